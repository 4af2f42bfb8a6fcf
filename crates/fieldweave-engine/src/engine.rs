//! The pipeline front object and the ~100 Hz scheduler.
//!
//! `Pipeline` owns two independent critical sections:
//!
//! - `state`    — arena, queues, contexts, fault latch, hardware handle.
//!                Every quantum and every consumer call goes through it.
//! - `exchange` — the registered producer.  Locked after `state` whenever
//!                both are needed; never the other way around.
//!
//! One scheduler quantum runs a fixed order: fold a finished pre pass,
//! sweep the recycle queue, admit one field to the pre unit, compose up to
//! the per-quantum budget, then fold and arm the post unit.  Admission
//! steps are skipped while a consistency fault is latched or the engine is
//! paused; bookkeeping always runs so completions are never lost.
//!
//! The async runner multiplexes a 10 ms interval with an event
//! notification, so interrupt-path triggers (frame ready, unit completion,
//! consumer put) collapse into at most one extra quantum.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldweave_core::error::{EngineError, Result};
use fieldweave_core::hw::{BlendMode, UnitEvent, VideoUnit};
use fieldweave_core::types::FrameMeta;

use crate::exchange::{EngineStates, FrameSource, OutputFrame, SourceFrame, StreamEvent};
use crate::fault::FaultReason;
use crate::pool::PoolKind;
use crate::queue::QueueId;
use crate::state::{EngineConfig, EngineMetrics, EngineState, RunMode};

/// Scheduler quantum.
const TICK: Duration = Duration::from_millis(10);

pub struct Pipeline {
    state: Mutex<EngineState>,
    exchange: Mutex<Option<Box<dyn FrameSource>>>,
    metrics: Arc<EngineMetrics>,
    notify: Notify,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(cfg: EngineConfig, unit: Box<dyn VideoUnit>) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            state: Mutex::new(EngineState::new(cfg, unit)),
            exchange: Mutex::new(None),
            metrics: Arc::new(EngineMetrics::default()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_exchange(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn FrameSource>>> {
        self.exchange.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ─── Registration ────────────────────────────────────────────────

    /// Attach a producer.  Pools are carved immediately if a frame is
    /// already waiting, otherwise lazily on the first quantum that sees
    /// one.
    pub fn register_source(&self, mut source: Box<dyn FrameSource>) -> Result<()> {
        let mut state = self.lock_state();
        let mut exchange = self.lock_exchange();
        if exchange.is_some() {
            return Err(EngineError::AlreadyRegistered);
        }
        if let Some(meta) = source.peek() {
            state.init_stream(&meta);
        }
        *exchange = Some(source);
        info!("frame source registered");
        self.notify.notify_one();
        Ok(())
    }

    /// Detach the producer.  A full unregister returns every outstanding
    /// loan; a light one abandons them (the producer is discarding its own
    /// surfaces anyway).
    pub fn unregister_source(&self, light: bool) -> Result<()> {
        let mut state = self.lock_state();
        let mut exchange = self.lock_exchange();
        let Some(mut source) = exchange.take() else {
            return Err(EngineError::NoSource);
        };
        let released = state.uninit_stream();
        if !light {
            for frame in released {
                source.put(frame);
            }
        }
        info!(light, "frame source unregistered");
        Ok(())
    }

    // ─── Events ──────────────────────────────────────────────────────

    /// Producer-side event entry point.  Cheap enough for interrupt-ish
    /// contexts: everything heavy is deferred to the next quantum.
    pub fn handle_event(&self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::FrameReady => {
                self.notify.notify_one();
                Ok(())
            }
            StreamEvent::Reset => {
                self.reset_stream();
                Ok(())
            }
            StreamEvent::Unregister => self.unregister_source(false),
            StreamEvent::LightUnregister => self.unregister_source(true),
        }
    }

    /// Flush in-flight state across a discontinuity, keeping the
    /// registration.  The next interlaced field is preceded by a dummy
    /// ready-marker so stale temporal context never crosses the gap.
    fn reset_stream(&self) {
        let released = {
            let mut state = self.lock_state();
            let Some(meta) = state.stream_meta else {
                return;
            };
            let released = state.uninit_stream();
            state.init_stream(&meta);
            state.pre.insert_dummy = !meta.is_progressive();
            released
        };
        self.put_upstream(released);
        self.notify.notify_one();
        debug!("stream reset");
    }

    /// Completion handler: the real unit's interrupt path and the test
    /// suites both land here.  Only flips flags; the next quantum folds
    /// the result back.
    pub fn on_unit_event(&self, event: UnitEvent) {
        {
            let mut state = self.lock_state();
            match event {
                UnitEvent::PreDone if state.pre.busy => state.pre.done = true,
                UnitEvent::PostDone if state.post.busy => state.post.done = true,
                // Stale completion after a forced timeout; already handled.
                _ => return,
            }
        }
        self.notify.notify_one();
    }

    // ─── The quantum ─────────────────────────────────────────────────

    /// Run one scheduler quantum synchronously.
    pub fn tick(&self) {
        let released = {
            let mut state = self.lock_state();
            let mut exchange = self.lock_exchange();
            self.run_quantum(&mut state, exchange.as_deref_mut())
        };
        self.put_upstream(released);
    }

    fn put_upstream(&self, released: Vec<SourceFrame>) {
        if released.is_empty() {
            return;
        }
        let mut exchange = self.lock_exchange();
        if let Some(source) = exchange.as_mut() {
            for frame in released {
                source.put(frame);
            }
        }
    }

    fn run_quantum(
        &self,
        state: &mut EngineState,
        mut source: Option<&mut (dyn FrameSource + 'static)>,
    ) -> Vec<SourceFrame> {
        if !state.init {
            if let Some(src) = source.as_deref_mut()
                && let Some(meta) = src.peek()
            {
                state.init_stream(&meta);
            } else {
                return Vec::new();
            }
        }

        // 1. Pre bookkeeping: timeout, then fold a finished pass.
        if state.pre.busy && !state.pre.done {
            state.pre.busy_ticks += 1;
            if state.pre.busy_ticks > state.cfg.timeout_ticks {
                warn!(
                    ticks = state.pre.busy_ticks,
                    "pre unit timed out, forcing completion"
                );
                state.unit.disable_pre();
                state.pre.done = true;
                state.pre.forced = true;
                EngineMetrics::bump(&self.metrics.pre_timeouts);
            }
        }
        state.pre_complete();

        // 2. Bounded recycle sweep.
        let mut outcome = state.sweep_recycle(&self.metrics);

        // Admission stops under a latched fault or a pause; bookkeeping
        // below still runs so in-flight completions fold back.
        let admit = !state.fault.active() && state.run_mode != RunMode::Pause;

        // 3. Admit one field to the pre unit.
        if admit
            && !state.pre.busy
            && let Some(src) = source.as_deref_mut()
        {
            state.pre_acquire(src, &self.metrics, &mut outcome.released);
        }

        // 4. Compose up to the per-quantum budget.
        if admit {
            for _ in 0..state.cfg.compose_budget {
                if !state.post_compose(&self.metrics) {
                    break;
                }
            }
        }

        // 5. Post bookkeeping, then arm the next composed frame.
        if state.post.busy && !state.post.done {
            state.post.busy_ticks += 1;
            if state.post.busy_ticks > state.cfg.timeout_ticks {
                warn!(
                    ticks = state.post.busy_ticks,
                    "post unit timed out, forcing completion"
                );
                state.unit.disable_post();
                state.post.done = true;
                state.post.forced = true;
                EngineMetrics::bump(&self.metrics.post_timeouts);
            }
        }
        state.post_complete();
        if admit {
            state.post_arm();
        }

        if state.run_mode == RunMode::Step {
            state.run_mode = RunMode::Pause;
        }
        outcome.released
    }

    // ─── Consumer surface ────────────────────────────────────────────

    /// Whether a frame may be exposed, honoring the start-hold depth.
    fn ready_visible(state: &EngineState) -> bool {
        let ready = state.queues.count(QueueId::PostReady);
        ready > 0 && (state.post.started || ready > state.cfg.hold_ready)
    }

    /// Metadata of the next finished frame, if one may be exposed.
    /// Returns `None` while a consistency fault is latched.
    pub fn peek(&self) -> Option<FrameMeta> {
        let mut state = self.lock_state();
        if !state.init || state.fault.active() || !Self::ready_visible(&state) {
            return None;
        }
        let state = &mut *state;
        let token = state
            .queues
            .peek_head(&state.arena, &mut state.fault, QueueId::PostReady)?;
        state.arena.get(token).map(|b| b.meta)
    }

    /// Take the next finished frame.  The caller owes a [`Pipeline::put`].
    pub fn get(&self) -> Option<OutputFrame> {
        let frame = {
            let mut state = self.lock_state();
            if !state.init || state.fault.active() || !Self::ready_visible(&state) {
                return None;
            }
            let state = &mut *state;
            let token =
                state
                    .queues
                    .take_head(&mut state.arena, &mut state.fault, QueueId::PostReady)?;
            state
                .queues
                .enqueue(&mut state.arena, &mut state.fault, QueueId::Display, token);
            state.post.started = true;
            let buf = state.arena.get(token)?;
            // Bypass frames expose the wrapped source surface.
            let canvas = if buf.blend == BlendMode::Bypass {
                buf.dup[0]
                    .and_then(|t| state.arena.get(t))
                    .map(|b| b.canvas)
                    .unwrap_or(buf.canvas)
            } else {
                buf.canvas
            };
            OutputFrame {
                token,
                meta: buf.meta,
                canvas,
            }
        };
        EngineMetrics::bump(&self.metrics.frames_delivered);
        self.notify.notify_one();
        Some(frame)
    }

    /// Return a frame taken with [`Pipeline::get`].  Works while faulted;
    /// consumer returns must never leak.
    pub fn put(&self, frame: OutputFrame) {
        {
            let mut state = self.lock_state();
            if !state.init {
                return;
            }
            let token = frame.token;
            if token.kind != PoolKind::Post
                || !state.fault_free_contains(QueueId::Display, token)
            {
                let state = &mut *state;
                state
                    .fault
                    .record(FaultReason::NotAttached, Some(QueueId::Display), Some(token));
                return;
            }
            let state = &mut *state;
            state.queues.remove(&mut state.arena, &mut state.fault, token);
            state.post_recycle(token);
        }
        self.notify.notify_one();
    }

    /// Pool occupancy snapshot.
    pub fn states(&self) -> EngineStates {
        self.lock_state().states()
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Cross-cutting consistency audit; test scaffolding and diagnostics.
    pub fn validate(&self) -> Result<()> {
        self.lock_state().validate()?;
        self.metrics.validate()
    }

    // ─── Control ─────────────────────────────────────────────────────

    pub fn set_run_mode(&self, mode: RunMode) {
        self.lock_state().run_mode = mode;
        self.notify.notify_one();
    }

    /// The only way out of a latched fault: reinitialize the pools against
    /// the current stream and clear the latch.  Abandoned loans go back to
    /// the producer.
    pub fn recover(&self) -> Result<()> {
        let released = {
            let mut state = self.lock_state();
            if !state.fault.active() {
                return Ok(());
            }
            let violations = state.fault.violations();
            let meta = state.stream_meta;
            let released = state.uninit_stream();
            state.fault.clear();
            if let Some(meta) = meta {
                state.init_stream(&meta);
                state.pre.insert_dummy = !meta.is_progressive();
            }
            info!(violations, "recovered from consistency fault");
            released
        };
        self.put_upstream(released);
        self.notify.notify_one();
        Ok(())
    }

    // ─── Runner ──────────────────────────────────────────────────────

    /// Drive quanta until cancelled: one per 10 ms tick, plus one per
    /// coalesced event notification.
    pub async fn run(&self) -> Result<()> {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("scheduler running");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
            }
            self.tick();
        }
        self.metrics.report();
        info!("scheduler stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl EngineState {
    /// Membership check that does not disturb the fault latch; `put` wants
    /// to reject a stray token with one precise record.
    fn fault_free_contains(&self, id: QueueId, token: crate::pool::BufToken) -> bool {
        let mut probe = crate::fault::FaultState::default();
        self.queues.contains(&mut probe, id, token)
    }
}
