//! Aggregate engine state, configuration, and metrics.
//!
//! `EngineState` is everything the scheduler mutates under the state lock:
//! the arena, the queues, the fault latch, both stage contexts, and the
//! hardware unit handle.  The recycle sweep and the cross-cutting
//! consistency validator live here because they touch all of it at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fieldweave_core::error::{EngineError, Result};
use fieldweave_core::hw::VideoUnit;
use fieldweave_core::types::{ChangeKey, FrameMeta};

use crate::exchange::{EngineStates, SourceFrame};
use crate::fault::{FaultReason, FaultState};
use crate::pool::{BufToken, BufferArena, PoolCapacities, PoolKind};
use crate::post::PostContext;
use crate::pre::PreContext;
use crate::queue::{QueueId, QueueSet};

// ─── Configuration ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Input wrapper count (bounds producer frames held concurrently).
    pub input_slots: usize,
    /// Field-intermediate count (bounds the temporal window depth).
    pub local_slots: usize,
    /// Output surface count (bounds frames in flight to the consumer).
    pub post_slots: usize,
    /// Split progressive input into two woven fields (linked-pair mode).
    pub split_progressive: bool,
    /// Treat every frame as bypass, regardless of scan structure.
    pub bypass_all: bool,
    /// Disable temporal blending: compose each field spatially on its own.
    pub spatial_only: bool,
    /// Scheduler ticks a hardware pass may stay busy before it is forced
    /// complete (one tick is the 10 ms quantum).
    pub timeout_ticks: u32,
    /// Fields tagged for dropping while the temporal window warms up after
    /// (re)initialization.
    pub warmup_throw: u32,
    /// Finished frames to accumulate before the first is exposed.
    pub hold_ready: usize,
    /// Maximum compositions attempted per quantum.
    pub compose_budget: usize,
    /// Maximum recycle-queue entries examined per quantum.
    pub sweep_budget: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_slots: 8,
            local_slots: 6,
            post_slots: 5,
            split_progressive: false,
            bypass_all: false,
            spatial_only: false,
            timeout_ticks: 5,
            warmup_throw: 2,
            hold_ready: 0,
            compose_budget: 3,
            sweep_budget: 32,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: EngineConfig =
            serde_json::from_str(json).map_err(|e| EngineError::ConfigParse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_slots < 2 {
            return Err(EngineError::Config(
                "input_slots must be >= 2 (current + next field)".into(),
            ));
        }
        if self.local_slots < 4 {
            return Err(EngineError::Config(
                "local_slots must be >= 4 (three-field window plus one in flight)".into(),
            ));
        }
        if self.post_slots < 2 {
            return Err(EngineError::Config("post_slots must be >= 2".into()));
        }
        if self.timeout_ticks == 0 {
            return Err(EngineError::Config("timeout_ticks must be >= 1".into()));
        }
        if self.compose_budget == 0 || self.sweep_budget == 0 {
            return Err(EngineError::Config(
                "compose_budget and sweep_budget must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub fn capacities(&self) -> PoolCapacities {
        PoolCapacities {
            input: self.input_slots,
            local: self.local_slots,
            post: self.post_slots,
        }
    }
}

// ─── Metrics ─────────────────────────────────────────────────────────────

/// Free-running stage counters.  Relaxed ordering: these are telemetry,
/// not synchronization.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub frames_in: AtomicU64,
    pub fields_pre: AtomicU64,
    pub frames_composed: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_dropped: AtomicU64,
    /// Ready fields discarded before any frame was composed from them
    /// (mis-paritied pair heads); not part of the composed/dropped ordering.
    pub fields_discarded: AtomicU64,
    pub buffers_recycled: AtomicU64,
    pub pre_timeouts: AtomicU64,
    pub post_timeouts: AtomicU64,
}

impl EngineMetrics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts must respect pipeline order: a frame cannot leave a stage it
    /// never entered.
    pub fn validate(&self) -> Result<()> {
        let composed = self.frames_composed.load(Ordering::Relaxed);
        let delivered = self.frames_delivered.load(Ordering::Relaxed);
        let dropped = self.frames_dropped.load(Ordering::Relaxed);
        if delivered + dropped > composed {
            return Err(EngineError::InvariantViolation(format!(
                "delivered ({delivered}) + dropped ({dropped}) exceeds composed ({composed})"
            )));
        }
        Ok(())
    }

    pub fn report(&self) {
        info!(
            frames_in = self.frames_in.load(Ordering::Relaxed),
            fields_pre = self.fields_pre.load(Ordering::Relaxed),
            frames_composed = self.frames_composed.load(Ordering::Relaxed),
            frames_delivered = self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped = self.frames_dropped.load(Ordering::Relaxed),
            fields_discarded = self.fields_discarded.load(Ordering::Relaxed),
            buffers_recycled = self.buffers_recycled.load(Ordering::Relaxed),
            pre_timeouts = self.pre_timeouts.load(Ordering::Relaxed),
            post_timeouts = self.post_timeouts.load(Ordering::Relaxed),
            "engine metrics"
        );
    }
}

// ─── Run mode ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    #[default]
    Run,
    Pause,
    /// Admit exactly one quantum of new work, then pause.
    Step,
}

// ─── Aggregate state ─────────────────────────────────────────────────────

pub struct EngineState {
    pub cfg: EngineConfig,
    pub arena: BufferArena,
    pub queues: QueueSet,
    pub fault: FaultState,
    pub pre: PreContext,
    pub post: PostContext,
    pub unit: Box<dyn VideoUnit>,
    /// Producer loans, indexed by input-buffer slot.
    pub loans: Vec<Option<SourceFrame>>,
    pub run_mode: RunMode,
    pub init: bool,
    /// Format key of the stream the pools were carved for.
    pub stream_key: Option<ChangeKey>,
    /// Metadata the pools were carved from; reset and recovery recarve
    /// against it.
    pub stream_meta: Option<FrameMeta>,
}

/// What one recycle sweep accomplished.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub recycled: usize,
    /// Producer frames to return upstream, outside the state lock.
    pub released: Vec<SourceFrame>,
}

impl EngineState {
    pub fn new(cfg: EngineConfig, unit: Box<dyn VideoUnit>) -> Self {
        let total = cfg.capacities().total();
        Self {
            queues: QueueSet::new(total, cfg.split_progressive),
            arena: BufferArena::default(),
            fault: FaultState::default(),
            pre: PreContext::default(),
            post: PostContext::default(),
            unit,
            loans: Vec::new(),
            run_mode: RunMode::Run,
            init: false,
            stream_key: None,
            stream_meta: None,
            cfg,
        }
    }

    /// Carve the pools for a stream and populate the free queues.  Called
    /// at registration, on format change, and from recovery.
    pub fn init_stream(&mut self, meta: &FrameMeta) {
        let caps = self.cfg.capacities();
        self.arena = BufferArena::init(caps, meta.width, meta.height, meta.format.ten_bit);
        self.queues = QueueSet::new(caps.total(), self.cfg.split_progressive);
        self.loans = (0..caps.input).map(|_| None).collect();
        self.pre = PreContext::default();
        self.pre.throw_remaining = self.cfg.warmup_throw;
        self.post = PostContext::default();

        for kind in PoolKind::ALL {
            let free = match kind {
                PoolKind::Input => QueueId::InFree,
                PoolKind::Local => QueueId::LocalFree,
                PoolKind::Post => QueueId::PostFree,
            };
            let tokens: Vec<BufToken> = self.arena.iter(kind).map(|b| b.token).collect();
            for token in tokens {
                self.queues.enqueue(&mut self.arena, &mut self.fault, free, token);
            }
        }

        self.stream_key = Some(meta.change_key());
        self.stream_meta = Some(*meta);
        self.init = true;
        info!(
            width = meta.width,
            height = meta.height,
            progressive = meta.is_progressive(),
            input = caps.input,
            local = caps.local,
            post = caps.post,
            "stream pools initialized"
        );
    }

    /// Tear everything down.  Returns the producer loans still held so the
    /// caller can `put` them outside the state lock; light teardown drops
    /// them instead.
    pub fn uninit_stream(&mut self) -> Vec<SourceFrame> {
        let released = self.loans.iter_mut().filter_map(Option::take).collect();
        self.arena = BufferArena::default();
        self.queues.reset();
        self.pre = PreContext::default();
        self.post = PostContext::default();
        self.unit.disable_pre();
        self.unit.disable_post();
        self.init = false;
        self.stream_key = None;
        self.stream_meta = None;
        debug!("stream pools released");
        released
    }

    /// One bounded pass over the recycle queue.  A buffer leaves only when
    /// both reference counts are zero; linked pairs leave together.
    pub fn sweep_recycle(&mut self, metrics: &EngineMetrics) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let snapshot = self.queues.tokens(QueueId::Recycle);

        for token in snapshot.into_iter().take(self.cfg.sweep_budget) {
            let Some(buf) = self.arena.get(token) else {
                self.fault
                    .record(FaultReason::UnknownToken, Some(QueueId::Recycle), Some(token));
                continue;
            };
            if buf.pre_ref > 0 || buf.post_ref > 0 {
                continue;
            }
            let linked = buf.linked;
            if let Some(buddy) = linked {
                // The carried half must still be detached and still
                // pointing back; anything else means one half went through
                // the pipeline alone.  The primary stays parked rather than
                // tearing the pair apart.
                let intact = self
                    .arena
                    .get(buddy)
                    .is_some_and(|b| b.queue.is_none() && b.linked == Some(token));
                if !intact {
                    self.fault.record(
                        FaultReason::HalfPairRecycle,
                        Some(QueueId::Recycle),
                        Some(token),
                    );
                    continue;
                }
            }

            self.queues.remove(&mut self.arena, &mut self.fault, token);
            match token.kind {
                PoolKind::Input => {
                    if let Some(loan) = self
                        .loans
                        .get_mut(usize::from(token.index))
                        .and_then(Option::take)
                    {
                        outcome.released.push(loan);
                    }
                    if let Some(buf) = self.arena.get_mut(token) {
                        buf.reset();
                    }
                    self.queues
                        .enqueue(&mut self.arena, &mut self.fault, QueueId::InFree, token);
                }
                PoolKind::Local => {
                    if let Some(buddy) = linked {
                        if let Some(b) = self.arena.get_mut(buddy) {
                            b.reset();
                        }
                        self.queues.enqueue(
                            &mut self.arena,
                            &mut self.fault,
                            QueueId::LocalFree,
                            buddy,
                        );
                        outcome.recycled += 1;
                        EngineMetrics::bump(&metrics.buffers_recycled);
                    }
                    if let Some(buf) = self.arena.get_mut(token) {
                        buf.reset();
                    }
                    self.queues
                        .enqueue(&mut self.arena, &mut self.fault, QueueId::LocalFree, token);
                }
                PoolKind::Post => {
                    if let Some(buf) = self.arena.get_mut(token) {
                        buf.reset();
                    }
                    self.queues
                        .enqueue(&mut self.arena, &mut self.fault, QueueId::PostFree, token);
                }
            }
            outcome.recycled += 1;
            EngineMetrics::bump(&metrics.buffers_recycled);
        }
        outcome
    }

    /// Occupancy snapshot for diagnostics and consumer pacing.
    pub fn states(&self) -> EngineStates {
        EngineStates {
            pool_size: self.arena.total(),
            free: self.queues.count(QueueId::PostFree),
            recyclable: self.queues.count(QueueId::Recycle),
            ready: self.queues.count(QueueId::PostReady),
            on_display: self.queues.count(QueueId::Display),
            violations: self.fault.violations(),
            first_fault: self.fault.first().copied(),
            cadence: self.pre.cadence.current(),
        }
    }

    /// Cross-cutting consistency audit: attachment bookkeeping, per-queue
    /// occupancy, and per-pool conservation.  Test suites call this after
    /// every scenario step; it is not on the hot path.
    pub fn validate(&self) -> Result<()> {
        // Queue counts must match slot occupancy.
        for id in QueueId::ALL {
            let occupied = self.queues.tokens(id).len();
            if occupied != self.queues.count(id) {
                return Err(EngineError::InvariantViolation(format!(
                    "queue {} count {} does not match occupancy {}",
                    id.label(),
                    self.queues.count(id),
                    occupied
                )));
            }
        }

        // Who accounts for each detached buffer.
        let mut held: HashMap<BufToken, &'static str> = HashMap::new();
        for (token, label) in [
            (self.pre.inp, "pre.inp"),
            (self.pre.inp_next, "pre.inp_next"),
            (self.pre.wr, "pre.wr"),
            (self.pre.pair_pending, "pre.pair_pending"),
        ] {
            if let Some(token) = token {
                held.insert(token, label);
            }
        }
        for buf in self.arena.iter_all() {
            for owned in buf.owned.iter().flatten() {
                held.insert(*owned, "owned");
            }
        }
        // A linked buddy is carried by its primary: accounted whenever the
        // primary is queued or held.
        for buf in self.arena.iter_all() {
            if let Some(linked) = buf.linked
                && (buf.queue.is_some() || held.contains_key(&buf.token))
            {
                held.entry(linked).or_insert("linked");
            }
        }

        let mut queued = [0usize; 3];
        let mut in_flight = [0usize; 3];
        for buf in self.arena.iter_all() {
            let pool = match buf.token.kind {
                PoolKind::Input => 0,
                PoolKind::Local => 1,
                PoolKind::Post => 2,
            };
            match buf.queue {
                Some(id) => {
                    let mut probe = FaultState::default();
                    if !self.queues.contains(&mut probe, id, buf.token) {
                        return Err(EngineError::InvariantViolation(format!(
                            "{} recorded in {} but absent from its slots",
                            buf.token,
                            id.label()
                        )));
                    }
                    queued[pool] += 1;
                }
                None => {
                    if !held.contains_key(&buf.token) {
                        return Err(EngineError::InvariantViolation(format!(
                            "{} is detached but held by no context or owner",
                            buf.token
                        )));
                    }
                    in_flight[pool] += 1;
                }
            }
        }

        // Conservation: every pool buffer is either queued or held.
        for (pool, kind) in PoolKind::ALL.iter().enumerate() {
            let cap = self.arena.capacity(*kind);
            if queued[pool] + in_flight[pool] != cap {
                return Err(EngineError::InvariantViolation(format!(
                    "{} pool accounts for {} of {} buffers",
                    kind.label(),
                    queued[pool] + in_flight[pool],
                    cap
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldweave_core::hw::SimUnit;
    use fieldweave_core::types::{FieldParity, ScanKind};

    fn interlaced_meta() -> FrameMeta {
        FrameMeta {
            width: 720,
            height: 480,
            scan: ScanKind::Interlaced(FieldParity::Top),
            ..FrameMeta::default()
        }
    }

    fn fresh_state() -> EngineState {
        let (unit, _) = SimUnit::shared();
        let mut state = EngineState::new(EngineConfig::default(), Box::new(unit));
        state.init_stream(&interlaced_meta());
        state
    }

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().expect("default config");
    }

    #[test]
    fn config_rejects_shallow_local_pool() {
        let cfg = EngineConfig {
            local_slots: 2,
            ..EngineConfig::default()
        };
        let err = cfg.validate().expect_err("shallow local pool");
        assert!(err.to_string().contains("local_slots"));
    }

    #[test]
    fn config_parses_from_json() {
        let cfg = EngineConfig::from_json_str(
            r#"{"input_slots": 4, "local_slots": 8, "split_progressive": true}"#,
        )
        .expect("parse");
        assert_eq!(cfg.input_slots, 4);
        assert_eq!(cfg.local_slots, 8);
        assert!(cfg.split_progressive);
        // Unspecified fields keep defaults.
        assert_eq!(cfg.post_slots, 5);
    }

    #[test]
    fn config_rejects_unknown_fields() {
        EngineConfig::from_json_str(r#"{"inptu_slots": 4}"#).expect_err("typo should fail");
    }

    #[test]
    fn init_stream_fills_free_queues() {
        let state = fresh_state();
        assert_eq!(state.queues.count(QueueId::InFree), 8);
        assert_eq!(state.queues.count(QueueId::LocalFree), 6);
        assert_eq!(state.queues.count(QueueId::PostFree), 5);
        state.validate().expect("fresh state is consistent");
    }

    #[test]
    fn sweep_of_empty_recycle_queue_is_a_noop() {
        let metrics = EngineMetrics::default();
        let mut state = fresh_state();
        let outcome = state.sweep_recycle(&metrics);
        assert_eq!(outcome.recycled, 0);
        assert!(outcome.released.is_empty());
        state.validate().expect("still consistent");
    }

    #[test]
    fn sweep_skips_referenced_buffers() {
        let metrics = EngineMetrics::default();
        let mut state = fresh_state();
        let token = state
            .queues
            .take_head(&mut state.arena, &mut state.fault, QueueId::LocalFree)
            .expect("free local");
        state.arena.get_mut(token).expect("buffer").pre_ref = 1;
        state
            .queues
            .enqueue(&mut state.arena, &mut state.fault, QueueId::Recycle, token);

        let outcome = state.sweep_recycle(&metrics);
        assert_eq!(outcome.recycled, 0);
        assert_eq!(state.queues.count(QueueId::Recycle), 1);

        state.arena.get_mut(token).expect("buffer").pre_ref = 0;
        let outcome = state.sweep_recycle(&metrics);
        assert_eq!(outcome.recycled, 1);
        assert_eq!(state.queues.count(QueueId::LocalFree), 6);
        state.validate().expect("consistent after sweep");
    }

    #[test]
    fn metrics_ordering_violation_is_reported() {
        let metrics = EngineMetrics::default();
        metrics.frames_delivered.store(3, Ordering::Relaxed);
        let err = metrics.validate().expect_err("delivered without composed");
        assert!(err.to_string().contains("composed"));
    }

    #[test]
    fn uninit_returns_loans() {
        let mut state = fresh_state();
        state.loans[2] = Some(SourceFrame {
            meta: interlaced_meta(),
            canvas: Default::default(),
        });
        let released = state.uninit_stream();
        assert_eq!(released.len(), 1);
        assert!(!state.init);
    }
}
