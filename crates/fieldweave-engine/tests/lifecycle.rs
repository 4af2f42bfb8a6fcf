//! End-to-end scenarios driven through the public `Pipeline` surface with
//! the simulated hardware unit standing in for the ASIC.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fieldweave_core::hw::{SimUnit, UnitEvent};
use fieldweave_core::types::FrameMeta;
use fieldweave_engine::pool::{BufToken, PoolKind};
use fieldweave_engine::queue::QueueId;
use fieldweave_engine::state::EngineMetrics;
use fieldweave_engine::testutil::{interlaced_source, progressive_source, state_with, TestSource};
use fieldweave_engine::{EngineConfig, OutputFrame, Pipeline, RunMode};

// ─── Harness ─────────────────────────────────────────────────────────────

/// Pipeline plus handles to the simulated unit and the scripted producer.
/// `tick` runs one quantum and then completes whatever the unit was armed
/// with, emulating instant hardware.
struct Harness {
    pipeline: Arc<Pipeline>,
    sim: Arc<Mutex<SimUnit>>,
    source: Arc<Mutex<TestSource>>,
    done_pre: u64,
    done_post: u64,
}

fn harness(cfg: EngineConfig, source: TestSource) -> Harness {
    let (unit, sim) = SimUnit::shared();
    let pipeline = Arc::new(Pipeline::new(cfg, Box::new(unit)).expect("valid config"));
    let (shared, handle) = source.into_shared();
    pipeline
        .register_source(Box::new(shared))
        .expect("register source");
    Harness {
        pipeline,
        sim,
        source: handle,
        done_pre: 0,
        done_post: 0,
    }
}

fn no_warmup() -> EngineConfig {
    EngineConfig {
        warmup_throw: 0,
        ..EngineConfig::default()
    }
}

impl Harness {
    fn pump_completions(&mut self) {
        let (pre, post) = {
            let sim = self.sim.lock().expect("sim lock");
            (sim.pre_armed, sim.post_armed)
        };
        while self.done_pre < pre {
            self.pipeline.on_unit_event(UnitEvent::PreDone);
            self.done_pre += 1;
        }
        while self.done_post < post {
            self.pipeline.on_unit_event(UnitEvent::PostDone);
            self.done_post += 1;
        }
    }

    fn tick(&mut self) {
        self.pipeline.tick();
        self.pump_completions();
    }

    fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    fn returned_loans(&self) -> usize {
        self.source.lock().expect("source lock").returned.len()
    }
}

// ─── Round trip ──────────────────────────────────────────────────────────

#[test]
fn interlaced_stream_delivers_progressive_frames() {
    let mut h = harness(no_warmup(), interlaced_source(12));

    h.ticks(12);
    let frame = h.pipeline.get().expect("a finished frame");
    assert!(frame.meta.is_progressive());
    assert_eq!(frame.meta.width, 720);
    assert_eq!(frame.meta.height, 480);

    let states = h.pipeline.states();
    assert_eq!(states.on_display, 1);
    assert_eq!(states.violations, 0);

    h.pipeline.put(frame);
    h.ticks(2);
    assert_eq!(h.pipeline.states().on_display, 0);
    // Consumed inputs made it back to the producer.
    assert!(h.returned_loans() > 0);
    h.pipeline.validate().expect("consistent after round trip");
}

// ─── Scenario: warm-up throws ────────────────────────────────────────────

#[test]
fn warmup_drops_keep_metrics_consistent() {
    // Default config throws the first composed frames instead of
    // delivering them; the drop accounting must stay ordered throughout.
    let mut h = harness(EngineConfig::default(), interlaced_source(16));
    h.ticks(20);

    let metrics = h.pipeline.metrics();
    assert!(metrics.frames_dropped.load(Ordering::Relaxed) >= 1);
    assert!(
        metrics.frames_composed.load(Ordering::Relaxed)
            >= metrics.frames_dropped.load(Ordering::Relaxed)
    );
    h.pipeline.validate().expect("consistent during warm-up");

    let frame = h.pipeline.get().expect("frame past the warm-up throws");
    h.pipeline.put(frame);
    h.ticks(2);
    h.pipeline.validate().expect("consistent after delivery");
}

// ─── Scenario: pool exhaustion ───────────────────────────────────────────

#[test]
fn exhausted_pools_backpressure_without_fault() {
    let cfg = EngineConfig {
        input_slots: 4,
        local_slots: 4,
        post_slots: 2,
        warmup_throw: 0,
        ..EngineConfig::default()
    };
    let mut h = harness(cfg, interlaced_source(32));

    // Nobody consumes; every pool should fill and the engine should stall
    // cleanly instead of corrupting or spinning.
    h.ticks(40);
    let metrics = h.pipeline.metrics();
    let plateau = metrics.frames_in.load(Ordering::Relaxed);
    h.ticks(10);
    assert_eq!(metrics.frames_in.load(Ordering::Relaxed), plateau);

    let states = h.pipeline.states();
    assert_eq!(states.free, 0, "output surfaces exhausted");
    assert!(states.ready > 0);
    assert_eq!(states.violations, 0);
    h.pipeline.validate().expect("exhaustion is not corruption");

    // Draining the consumer side restarts intake.
    let frame = h.pipeline.get().expect("ready frame");
    h.pipeline.put(frame);
    h.ticks(6);
    assert!(metrics.frames_in.load(Ordering::Relaxed) > plateau);
}

// ─── Scenario: corruption latches a fault, recovery clears it ────────────

#[test]
fn forged_consumer_return_latches_fault_until_recovery() {
    let mut h = harness(no_warmup(), interlaced_source(24));
    h.ticks(12);
    assert!(h.pipeline.peek().is_some());

    // A token that was never handed out.
    let forged = OutputFrame {
        token: BufToken::new(PoolKind::Input, 0),
        meta: FrameMeta::default(),
        canvas: Default::default(),
    };
    h.pipeline.put(forged);

    // The fault gates the consumer surface even though frames are ready.
    assert!(h.pipeline.peek().is_none());
    assert!(h.pipeline.get().is_none());
    assert!(h.pipeline.states().violations > 0);

    // Ticks keep running bookkeeping but admit nothing new.
    let metrics = h.pipeline.metrics();
    let stalled = metrics.frames_in.load(Ordering::Relaxed);
    h.ticks(5);
    assert_eq!(metrics.frames_in.load(Ordering::Relaxed), stalled);

    // Recovery reinitializes and the stream flows again.
    let loans_before = h.returned_loans();
    h.pipeline.recover().expect("recover");
    assert_eq!(h.pipeline.states().violations, 0);
    assert!(h.returned_loans() >= loans_before);

    h.ticks(14);
    assert!(h.pipeline.get().is_some());
    h.pipeline.validate().expect("consistent after recovery");
}

#[test]
fn post_completion_folds_while_faulted() {
    let mut h = harness(no_warmup(), interlaced_source(16));

    // Advance the pre stage only, until the first composed frame is on the
    // post unit with its completion still pending.
    while h.sim.lock().expect("sim lock").post_armed == 0 {
        h.pipeline.tick();
        let pre = h.sim.lock().expect("sim lock").pre_armed;
        while h.done_pre < pre {
            h.pipeline.on_unit_event(UnitEvent::PreDone);
            h.done_pre += 1;
        }
    }
    assert_eq!(h.pipeline.states().ready, 0);

    // Latch a fault while that pass is in flight.
    let forged = OutputFrame {
        token: BufToken::new(PoolKind::Input, 0),
        meta: FrameMeta::default(),
        canvas: Default::default(),
    };
    h.pipeline.put(forged);
    assert!(h.pipeline.states().violations > 0);

    // The completion must still fold back under the latched fault; only
    // admission stops.
    h.pipeline.on_unit_event(UnitEvent::PostDone);
    h.pipeline.tick();
    let states = h.pipeline.states();
    assert_eq!(states.ready, 1, "finished pass folded to the ready queue");
    assert!(states.violations > 0, "fault stays latched");
}

// ─── Scenario: format change with buffers in flight ──────────────────────

#[test]
fn format_change_reinitializes_while_in_flight() {
    let mut h = harness(no_warmup(), interlaced_source(6));
    h.ticks(6);
    let pool_size = h.pipeline.states().pool_size;
    assert!(pool_size > 0);

    {
        let mut source = h.source.lock().expect("source lock");
        source.clear_pending();
        source.set_geometry(1920, 1080);
        source.push_fields(12);
    }
    let loans_before = h.returned_loans();
    h.ticks(14);

    // Same capacity, new geometry, old loans returned.
    assert_eq!(h.pipeline.states().pool_size, pool_size);
    assert!(h.returned_loans() > loans_before);
    let frame = h.pipeline.get().expect("frame at new geometry");
    assert_eq!(frame.meta.width, 1920);
    assert_eq!(frame.meta.height, 1080);
    h.pipeline.put(frame);
    h.pipeline.validate().expect("consistent after reinit");
}

// ─── Scenario: linked pairs must recycle together ────────────────────────

#[test]
fn half_pair_recycle_is_detected() {
    let metrics = EngineMetrics::default();
    let cfg = EngineConfig {
        split_progressive: true,
        ..EngineConfig::default()
    };
    let mut source = progressive_source(4);
    let mut state = state_with(cfg, &mut source);
    let mut released = Vec::new();

    // Two pre passes publish one linked primary.
    for _ in 0..2 {
        state.pre_acquire(&mut source, &metrics, &mut released);
        state.pre.done = true;
        state.pre_complete();
    }
    let primary = state
        .queues
        .peek_head(&state.arena, &mut state.fault, QueueId::PreReady)
        .expect("published pair");
    let buddy = state
        .arena
        .get(primary)
        .expect("buffer")
        .linked
        .expect("linked buddy");

    // Corrupt the pair: sneak the carried half back onto the free queue on
    // its own.
    state
        .queues
        .enqueue(&mut state.arena, &mut state.fault, QueueId::LocalFree, buddy);
    assert!(!state.fault.active(), "enqueue itself looks legal");

    assert!(state.post_compose(&metrics));
    state.post_arm();
    state.post.done = true;
    state.post_complete();
    let frame = state
        .queues
        .take_head(&mut state.arena, &mut state.fault, QueueId::PostReady)
        .expect("woven frame");
    state.post_recycle(frame);

    let _ = state.sweep_recycle(&metrics);
    assert!(state.fault.active());
    assert_eq!(
        state.fault.first().expect("record").reason,
        fieldweave_engine::fault::FaultReason::HalfPairRecycle
    );
    // The primary stays parked on recycle rather than tearing the pair.
    assert!(state.queues.contains(&mut state.fault, QueueId::Recycle, primary));
}

// ─── Timeout forcing ─────────────────────────────────────────────────────

#[test]
fn silent_hardware_is_forced_along_by_timeouts() {
    let cfg = EngineConfig {
        timeout_ticks: 2,
        warmup_throw: 0,
        ..EngineConfig::default()
    };
    // No completion is ever delivered; only the software timeout advances
    // the stages.
    let mut h = harness(cfg, interlaced_source(16));
    for _ in 0..40 {
        h.pipeline.tick();
    }
    let metrics = h.pipeline.metrics();
    assert!(metrics.pre_timeouts.load(Ordering::Relaxed) > 0);
    assert!(
        h.pipeline.get().is_some(),
        "forced completions still deliver best-effort frames"
    );
    h.pipeline.validate().expect("consistent under timeouts");
}

// ─── Start hold ──────────────────────────────────────────────────────────

#[test]
fn start_hold_delays_first_exposure() {
    let cfg = EngineConfig {
        hold_ready: 1,
        warmup_throw: 0,
        ..EngineConfig::default()
    };
    let mut h = harness(cfg, interlaced_source(16));

    // Drive until exactly one frame is finished.
    while h.pipeline.states().ready == 0 {
        h.tick();
    }
    assert!(h.pipeline.peek().is_none(), "held below the start depth");

    while h.pipeline.states().ready < 2 {
        h.tick();
    }
    assert!(h.pipeline.peek().is_some());
    let frame = h.pipeline.get().expect("first frame");
    h.pipeline.put(frame);

    // Once started, a single ready frame is enough.
    while h.pipeline.states().ready == 0 {
        h.tick();
    }
    assert!(h.pipeline.peek().is_some());
}

// ─── Run modes ───────────────────────────────────────────────────────────

#[test]
fn pause_gates_admission_and_step_advances_one_quantum() {
    let mut h = harness(no_warmup(), interlaced_source(16));
    h.ticks(2);
    let metrics = h.pipeline.metrics();

    h.pipeline.set_run_mode(RunMode::Pause);
    let paused_at = metrics.frames_in.load(Ordering::Relaxed);
    h.ticks(5);
    assert_eq!(metrics.frames_in.load(Ordering::Relaxed), paused_at);

    h.pipeline.set_run_mode(RunMode::Step);
    h.tick();
    assert_eq!(metrics.frames_in.load(Ordering::Relaxed), paused_at + 1);
    h.ticks(5);
    assert_eq!(metrics.frames_in.load(Ordering::Relaxed), paused_at + 1);

    h.pipeline.set_run_mode(RunMode::Run);
    h.ticks(3);
    assert!(metrics.frames_in.load(Ordering::Relaxed) > paused_at + 1);
}

// ─── Teardown ────────────────────────────────────────────────────────────

#[test]
fn full_unregister_returns_loans_light_does_not() {
    let mut h = harness(no_warmup(), interlaced_source(8));
    h.ticks(3);
    let before = h.returned_loans();
    h.pipeline.unregister_source(false).expect("unregister");
    assert!(h.returned_loans() > before, "outstanding loans returned");
    assert_eq!(h.pipeline.states().pool_size, 0);

    let mut h = harness(no_warmup(), interlaced_source(8));
    h.ticks(3);
    let before = h.returned_loans();
    h.pipeline.unregister_source(true).expect("light unregister");
    assert_eq!(h.returned_loans(), before, "light teardown abandons loans");
}

// ─── Async runner ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_drives_quanta_until_shutdown() {
    let (unit, sim) = SimUnit::shared();
    let pipeline = Arc::new(Pipeline::new(no_warmup(), Box::new(unit)).expect("valid config"));
    let (shared, _source) = interlaced_source(64).into_shared();
    pipeline
        .register_source(Box::new(shared))
        .expect("register source");

    let runner = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run().await })
    };

    // Play the interrupt path: complete whatever the unit gets armed with.
    let mut done = (0u64, 0u64);
    for _ in 0..25 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (pre, post) = {
            let sim = sim.lock().expect("sim lock");
            (sim.pre_armed, sim.post_armed)
        };
        while done.0 < pre {
            pipeline.on_unit_event(UnitEvent::PreDone);
            done.0 += 1;
        }
        while done.1 < post {
            pipeline.on_unit_event(UnitEvent::PostDone);
            done.1 += 1;
        }
    }

    pipeline.shutdown();
    runner.await.expect("join runner").expect("runner result");

    let metrics = pipeline.metrics();
    assert!(metrics.frames_in.load(Ordering::Relaxed) > 0);
    assert!(metrics.frames_composed.load(Ordering::Relaxed) > 0);
    pipeline.validate().expect("consistent after shutdown");
}
