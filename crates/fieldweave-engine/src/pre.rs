//! Pre-process state machine.
//!
//! Pulls producer frames, wraps them in input buffers, and runs the pre
//! unit to produce field intermediates in local buffers.  Owns the
//! carried-forward temporal window: the last write rotates into the
//! opposite-parity reference (`chan2`) and then into the same-parity
//! reference (`mem`) across successive completions.
//!
//! Progressive input is either bypassed straight to the ready queue or, in
//! linked-pair mode, split into two woven fields sharing one producer loan.

use serde::Serialize;
use tracing::{debug, info, warn};

use fieldweave_core::hw::{MemInterface, PreArm};
use fieldweave_core::types::{FieldParity, FrameMeta, ScanKind};

use crate::exchange::{FrameSource, SourceFrame};
use crate::fault::FaultReason;
use crate::pool::{BufToken, PostOp};
use crate::queue::QueueId;
use crate::state::{EngineMetrics, EngineState};

// ─── Cadence detection ───────────────────────────────────────────────────

/// Field cadence inferred from the pre unit's motion readback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Cadence {
    /// True interlaced video, every field distinct.
    #[default]
    Video,
    /// 3:2 pulldown from 24 fps film: one repeated field per five.
    Film32,
    /// 2:2 pulldown from 25/30 fps film: paired fields share an instant.
    Film22,
}

/// Classifies the stream from the still/moving pattern of recent fields.
/// A field is "still" when the pre pass reports zero motion against its
/// same-parity reference, the signature of a pulldown-repeated field.
#[derive(Debug, Default)]
pub struct CadenceTracker {
    /// Low bit is the newest field; set bits are still fields.
    pattern: u32,
    seen: u32,
    current: Cadence,
}

impl CadenceTracker {
    const WINDOW: u32 = 10;

    pub fn push(&mut self, still: bool) -> Cadence {
        self.pattern = (self.pattern << 1) | u32::from(still);
        self.seen = (self.seen + 1).min(Self::WINDOW);
        self.current = self.classify();
        self.current
    }

    pub fn current(&self) -> Cadence {
        self.current
    }

    fn classify(&self) -> Cadence {
        if self.seen < Self::WINDOW {
            return Cadence::Video;
        }
        let window = self.pattern & 0x3ff;
        let half = window & 0x1f;
        // 3:2: the still positions repeat with period five, one per cycle.
        if half == (window >> 5) & 0x1f && half.count_ones() == 1 {
            return Cadence::Film32;
        }
        // 2:2: every other field is still.
        if window == 0b01_0101_0101 || window == 0b10_1010_1010 {
            return Cadence::Film22;
        }
        Cadence::Video
    }
}

// ─── Context ─────────────────────────────────────────────────────────────

/// Everything the pre stage holds between quanta.
#[derive(Debug, Default)]
pub struct PreContext {
    /// Input buffer currently armed on the unit.
    pub inp: Option<BufToken>,
    /// Second half of a split progressive frame, waiting its own pass.
    pub inp_next: Option<BufToken>,
    /// Local buffer the unit is writing.
    pub wr: Option<BufToken>,
    /// Same-parity temporal reference (two fields back).  Alias with a
    /// `pre_ref` hold, not ownership.
    pub mem: Option<BufToken>,
    /// Opposite-parity temporal reference (one field back).
    pub chan2: Option<BufToken>,
    /// Primary of a linked pair whose first field is written, waiting for
    /// the second before it is published.
    pub pair_pending: Option<BufToken>,
    pub busy: bool,
    pub done: bool,
    /// Quanta spent busy without completion; drives the software timeout.
    pub busy_ticks: u32,
    /// Completion was synthesized by the timeout path.
    pub forced: bool,
    /// Publish a dummy ready-marker before the next field (set on reset
    /// and format change while interlaced context may linger downstream).
    pub insert_dummy: bool,
    /// Fields still to tag for dropping while the window warms up.
    pub throw_remaining: u32,
    /// Sequence stamped on published ready buffers.
    pub seq: u64,
    pub fields_armed: u64,
    /// Whether the armed pass carries motion analysis (needs a same-parity
    /// reference); gates the completion readback.
    pub analysis_armed: bool,
    /// Pulldown classification fed by per-field motion readbacks.
    pub cadence: CadenceTracker,
}

/// What one acquire attempt accomplished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreOutcome {
    /// No producer frame or no free buffers.
    Starved,
    /// Frame went straight to the ready queue, no hardware pass.
    Bypassed,
    /// The pre unit is armed and busy.
    Armed,
}

// ─── Stage logic ─────────────────────────────────────────────────────────

impl EngineState {
    /// Drop the temporal reference holds.  Called when the window restarts
    /// (bypass transition, teardown).
    fn pre_release_window(&mut self) {
        for slot in [self.pre.mem.take(), self.pre.chan2.take()] {
            let Some(token) = slot else { continue };
            match self.arena.get_mut(token) {
                Some(buf) if buf.pre_ref > 0 => buf.pre_ref -= 1,
                _ => self
                    .fault
                    .record(FaultReason::PreRefUnderflow, None, Some(token)),
            }
        }
    }

    /// Whether this frame skips the pre unit entirely.
    fn is_bypass(&self, meta: &FrameMeta) -> bool {
        self.cfg.bypass_all
            || meta.format.compressed
            || (meta.is_progressive() && !self.cfg.split_progressive)
    }

    /// Step 3 of the quantum: try to admit one field to the pre unit.
    ///
    /// Format changes are detected on the peeked frame, before it is taken,
    /// so a full pool reinitialization never strands the triggering frame.
    /// Loans abandoned by the reinitialization are appended to `released`.
    pub fn pre_acquire(
        &mut self,
        source: &mut dyn FrameSource,
        metrics: &EngineMetrics,
        released: &mut Vec<SourceFrame>,
    ) -> PreOutcome {
        if self.pre.busy {
            return PreOutcome::Starved;
        }

        // Second half of a split frame needs no new producer frame.
        if let Some(next) = self.pre.inp_next.take() {
            return self.pre_arm_second_half(next, metrics);
        }

        let Some(meta) = source.peek() else {
            return PreOutcome::Starved;
        };

        if let Some(key) = self.stream_key
            && meta.change_key() != key
        {
            debug!(
                width = meta.width,
                height = meta.height,
                progressive = meta.is_progressive(),
                "format change, reinitializing pools"
            );
            released.extend(self.uninit_stream());
            self.init_stream(&meta);
            self.pre.insert_dummy = !meta.is_progressive();
        }

        if self.queues.is_empty(QueueId::InFree) {
            return PreOutcome::Starved;
        }

        let bypass = self.is_bypass(&meta);
        let split = !bypass && meta.is_progressive();

        // Reserve the write side before taking the frame.
        if !bypass {
            let have_write = if split {
                self.queues.peek_adjacent_pair(QueueId::LocalFree).is_some()
                    && self.queues.count(QueueId::InFree) >= 2
            } else {
                !self.queues.is_empty(QueueId::LocalFree)
            };
            if !have_write {
                return PreOutcome::Starved;
            }
        }

        let Some(frame) = source.get() else {
            return PreOutcome::Starved;
        };
        EngineMetrics::bump(&metrics.frames_in);

        if bypass {
            return self.pre_admit_bypass(frame);
        }
        if split {
            return self.pre_admit_split(frame, metrics);
        }
        self.pre_admit_field(frame, metrics)
    }

    /// Bypass: wrap the frame and publish it directly.
    fn pre_admit_bypass(&mut self, frame: SourceFrame) -> PreOutcome {
        self.pre_release_window();

        let Some(itok) = self
            .queues
            .take_head(&mut self.arena, &mut self.fault, QueueId::InFree)
        else {
            return PreOutcome::Starved;
        };
        self.loans[usize::from(itok.index)] = Some(frame);
        let seq = self.pre.seq;
        self.pre.seq += 1;
        if let Some(buf) = self.arena.get_mut(itok) {
            buf.meta = frame.meta;
            buf.canvas = frame.canvas;
            buf.op = PostOp::None;
            buf.seq = seq;
        }
        self.queues
            .enqueue(&mut self.arena, &mut self.fault, QueueId::PreReady, itok);
        debug!(token = %itok, "frame bypassed to ready");
        PreOutcome::Bypassed
    }

    /// Interlaced field: take a write buffer and arm the unit.
    fn pre_admit_field(&mut self, frame: SourceFrame, metrics: &EngineMetrics) -> PreOutcome {
        let Some(itok) = self
            .queues
            .take_head(&mut self.arena, &mut self.fault, QueueId::InFree)
        else {
            return PreOutcome::Starved;
        };
        self.loans[usize::from(itok.index)] = Some(frame);
        if let Some(buf) = self.arena.get_mut(itok) {
            buf.meta = frame.meta;
            buf.canvas = frame.canvas;
        }

        let Some(wtok) = self
            .queues
            .take_head(&mut self.arena, &mut self.fault, QueueId::LocalFree)
        else {
            // Availability was checked; an empty queue here is corruption.
            self.fault
                .record(FaultReason::UnexpectedEmpty, Some(QueueId::LocalFree), None);
            return PreOutcome::Starved;
        };

        // The write target must not appear in its own reference window.
        if self.pre.mem == Some(wtok) || self.pre.chan2 == Some(wtok) {
            self.fault
                .record(FaultReason::SelfReference, Some(QueueId::LocalFree), Some(wtok));
            return PreOutcome::Starved;
        }

        let throw = self.pre.throw_remaining > 0;
        if throw {
            self.pre.throw_remaining -= 1;
        }
        if let Some(buf) = self.arena.get_mut(wtok) {
            buf.meta = frame.meta;
            buf.op = if self.cfg.spatial_only {
                PostOp::Disable
            } else {
                PostOp::Deinterlace
            };
            buf.throw = throw;
            buf.pre_ref = 1;
        }

        self.pre.inp = Some(itok);
        self.pre.wr = Some(wtok);
        self.pre_fire(metrics);
        PreOutcome::Armed
    }

    /// First half of a split progressive frame: a linked local pair and two
    /// input wrappers, the second of which carries the producer loan.
    fn pre_admit_split(&mut self, frame: SourceFrame, metrics: &EngineMetrics) -> PreOutcome {
        let Some((a, b)) = self.queues.peek_adjacent_pair(QueueId::LocalFree) else {
            self.fault
                .record(FaultReason::UnexpectedEmpty, Some(QueueId::LocalFree), None);
            return PreOutcome::Starved;
        };
        let (Some(top_in), Some(bot_in)) = (
            self.queues
                .take_head(&mut self.arena, &mut self.fault, QueueId::InFree),
            self.queues
                .take_head(&mut self.arena, &mut self.fault, QueueId::InFree),
        ) else {
            self.fault
                .record(FaultReason::UnexpectedEmpty, Some(QueueId::InFree), None);
            return PreOutcome::Starved;
        };
        self.queues.remove(&mut self.arena, &mut self.fault, a);
        self.queues.remove(&mut self.arena, &mut self.fault, b);

        let half_duration = frame.meta.duration_us / 2;
        let field_meta = |parity| FrameMeta {
            scan: ScanKind::Interlaced(parity),
            duration_us: half_duration,
            ..frame.meta
        };

        // Bottom input owns the loan; the top half borrows the same canvas.
        self.loans[usize::from(bot_in.index)] = Some(frame);
        if let Some(buf) = self.arena.get_mut(top_in) {
            buf.meta = field_meta(FieldParity::Top);
            buf.canvas = frame.canvas;
        }
        if let Some(buf) = self.arena.get_mut(bot_in) {
            buf.meta = field_meta(FieldParity::Bottom);
            buf.canvas = frame.canvas;
        }

        let throw = self.pre.throw_remaining > 0;
        if throw {
            self.pre.throw_remaining -= 1;
        }
        if let Some(buf) = self.arena.get_mut(a) {
            buf.meta = field_meta(FieldParity::Top);
            buf.op = PostOp::Deinterlace;
            buf.throw = throw;
            buf.linked = Some(b);
        }
        if let Some(buf) = self.arena.get_mut(b) {
            buf.meta = field_meta(FieldParity::Bottom);
            buf.linked = Some(a);
        }

        self.pre.inp = Some(top_in);
        self.pre.inp_next = Some(bot_in);
        self.pre.wr = Some(a);
        self.pre_fire(metrics);
        PreOutcome::Armed
    }

    /// Second half of a split frame writes into the carried buddy.
    fn pre_arm_second_half(&mut self, next: BufToken, metrics: &EngineMetrics) -> PreOutcome {
        let Some(primary) = self.pre.pair_pending else {
            self.fault
                .record(FaultReason::NotAttached, None, Some(next));
            return PreOutcome::Starved;
        };
        let Some(buddy) = self.arena.get(primary).and_then(|b| b.linked) else {
            self.fault
                .record(FaultReason::HalfPairRecycle, None, Some(primary));
            return PreOutcome::Starved;
        };
        self.pre.inp = Some(next);
        self.pre.wr = Some(buddy);
        self.pre_fire(metrics);
        PreOutcome::Armed
    }

    /// Program the memory interfaces and kick the unit.
    fn pre_fire(&mut self, metrics: &EngineMetrics) {
        let iface = |state: &EngineState, token: BufToken| {
            state.arena.get(token).map(|buf| MemInterface {
                canvas: buf.canvas,
                field: buf.meta.scan.parity(),
            })
        };
        let (Some(inp), Some(wr)) = (self.pre.inp, self.pre.wr) else {
            self.fault.record(FaultReason::UnexpectedEmpty, None, None);
            return;
        };
        let (Some(input), Some(write)) = (iface(self, inp), iface(self, wr)) else {
            self.fault.record(FaultReason::UnknownToken, None, Some(inp));
            return;
        };
        let arm = PreArm {
            input,
            memory: self.pre.mem.and_then(|t| iface(self, t)),
            chan2: self.pre.chan2.and_then(|t| iface(self, t)),
            write,
            motion_map: self.pre.mem.is_some(),
        };

        self.pre.busy = true;
        self.pre.done = false;
        self.pre.forced = false;
        self.pre.busy_ticks = 0;
        self.pre.analysis_armed = arm.motion_map;
        self.pre.fields_armed += 1;
        EngineMetrics::bump(&metrics.fields_pre);

        if let Err(err) = self.unit.arm_pre(&arm) {
            // Synthesize a completion so the buffers keep flowing.
            warn!(error = %err, "pre arm failed, forcing completion");
            self.pre.done = true;
            self.pre.forced = true;
        }
    }

    /// Step 1 of the quantum: fold a finished (or forced) pass back into
    /// the queues and rotate the temporal window.
    pub fn pre_complete(&mut self) {
        if !(self.pre.busy && self.pre.done) {
            return;
        }
        self.pre.busy = false;
        self.pre.done = false;
        let forced = std::mem::take(&mut self.pre.forced);
        let Some(wr) = self.pre.wr.take() else {
            self.fault.record(FaultReason::UnexpectedEmpty, None, None);
            return;
        };
        let inp = self.pre.inp.take();

        let is_split = self.arena.get(wr).is_some_and(|b| b.linked.is_some());
        if is_split {
            if self.pre.pair_pending.is_none() {
                // First field written; hold the primary until its buddy is.
                self.pre.pair_pending = Some(wr);
            } else {
                let Some(primary) = self.pre.pair_pending.take() else {
                    return;
                };
                let seq = self.pre.seq;
                self.pre.seq += 1;
                if let Some(buf) = self.arena.get_mut(primary) {
                    buf.seq = seq;
                }
                self.publish_ready(primary);
            }
        } else {
            // Rotate the window: write → chan2 → mem, releasing the hold on
            // the buffer rotating out.
            if let Some(old) = self.pre.mem.take() {
                match self.arena.get_mut(old) {
                    Some(buf) if buf.pre_ref > 0 => buf.pre_ref -= 1,
                    _ => self
                        .fault
                        .record(FaultReason::PreRefUnderflow, None, Some(old)),
                }
            }
            self.pre.mem = self.pre.chan2.take();
            self.pre.chan2 = Some(wr);

            if std::mem::take(&mut self.pre.insert_dummy) {
                self.publish_dummy();
            }

            // Temporal-analysis readback: stamp the field's motion count and
            // feed the cadence classifier.  A forced completion produced no
            // usable analysis, so it reads as full motion.
            let motion = if forced || !self.pre.analysis_armed {
                u32::MAX
            } else {
                self.unit.pre_report().motion
            };
            let was = self.pre.cadence.current();
            let now = self.pre.cadence.push(motion == 0);
            if now != was {
                info!(cadence = ?now, "field cadence changed");
            }

            let seq = self.pre.seq;
            self.pre.seq += 1;
            if let Some(buf) = self.arena.get_mut(wr) {
                buf.motion = motion;
                buf.seq = seq;
            }
            self.publish_ready(wr);
        }

        if let Some(inp) = inp {
            self.queues
                .enqueue(&mut self.arena, &mut self.fault, QueueId::Recycle, inp);
        }
        if forced {
            debug!(token = %wr, "forced pre completion folded back");
        }
    }

    fn publish_ready(&mut self, token: BufToken) {
        self.queues
            .enqueue(&mut self.arena, &mut self.fault, QueueId::PreReady, token);
    }

    /// Ready-marker separating fields across a discontinuity; the post
    /// stage recycles everything up to it without composing.
    fn publish_dummy(&mut self) {
        let Some(token) = self
            .queues
            .take_head(&mut self.arena, &mut self.fault, QueueId::LocalFree)
        else {
            return;
        };
        if let Some(buf) = self.arena.get_mut(token) {
            buf.op = PostOp::Dummy;
        }
        self.publish_ready(token);
        debug!(token = %token, "dummy ready-marker published");
    }
}
