//! Post-process state machine.
//!
//! Composes ready field intermediates into progressive output frames.
//! Composition never copies pixels in software: it selects a blend mode,
//! binds up to three fields as the unit's input window, and arms the post
//! unit.  Bypass frames skip the unit and go straight to the ready queue.
//!
//! Reference-count discipline: a composed frame that reads fields it does
//! not consume increments `post_ref` on each and decrements on recycle
//! (`refs_held` marks it).  Split-pair weave and bypass consume their
//! window outright through the frame's owned set and never touch the
//! counters.

use tracing::debug;

use fieldweave_core::hw::{BlendMode, MemInterface, PostArm};
use fieldweave_core::types::{FieldParity, ScanKind};

use crate::fault::FaultReason;
use crate::pool::{BufToken, PostOp};
use crate::pre::Cadence;
use crate::queue::QueueId;
use crate::state::{EngineMetrics, EngineState};

// ─── Context ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PostContext {
    pub busy: bool,
    pub done: bool,
    pub busy_ticks: u32,
    pub forced: bool,
    /// Buffer armed on the unit; stays attached to `PostDoing` while busy.
    pub cur: Option<BufToken>,
    /// First frame has been handed to the consumer; start-hold is over.
    pub started: bool,
    pub seq: u64,
}

// ─── Stage logic ─────────────────────────────────────────────────────────

impl EngineState {
    /// Step 4 of the quantum: try to compose one output frame.  Returns
    /// whether any progress was made (the scheduler loops on this up to
    /// its per-quantum budget).
    pub fn post_compose(&mut self, metrics: &EngineMetrics) -> bool {
        if self.queues.is_empty(QueueId::PostFree) {
            return false;
        }
        let Some(head) = self
            .queues
            .peek_head(&self.arena, &mut self.fault, QueueId::PreReady)
        else {
            return false;
        };
        let Some(head_buf) = self.arena.get(head) else {
            return false;
        };
        let head_op = head_buf.op;
        let head_linked = head_buf.linked;
        let head_interlaced = !head_buf.meta.is_progressive();

        // A discontinuity marker, at the head or right behind it, drains
        // the queue up to the marker without composing.
        if head_op == PostOp::Dummy {
            self.queues.remove(&mut self.arena, &mut self.fault, head);
            self.queues
                .enqueue(&mut self.arena, &mut self.fault, QueueId::Recycle, head);
            return true;
        }
        let second_is_dummy = self
            .queues
            .peek_at(&self.arena, &mut self.fault, QueueId::PreReady, 1)
            .and_then(|t| self.arena.get(t))
            .is_some_and(|b| b.op == PostOp::Dummy);
        if second_is_dummy && head_op == PostOp::Deinterlace {
            self.queues.remove(&mut self.arena, &mut self.fault, head);
            self.queues
                .enqueue(&mut self.arena, &mut self.fault, QueueId::Recycle, head);
            return true;
        }

        if let Some(buddy) = head_linked {
            return self.compose_woven_pair(head, buddy, metrics);
        }
        match head_op {
            PostOp::Deinterlace if head_interlaced => self.compose_blend(head, metrics),
            PostOp::Disable if head_interlaced => self.compose_edge_only(head, metrics),
            _ => self.compose_bypass(head, metrics),
        }
    }

    /// Motion-adaptive blend over the three oldest ready fields.  Defers
    /// until the window is deep enough.
    fn compose_blend(&mut self, head: BufToken, metrics: &EngineMetrics) -> bool {
        if self.queues.count(QueueId::PreReady) < 3 {
            return false;
        }
        let window = [
            Some(head),
            self.queues
                .peek_at(&self.arena, &mut self.fault, QueueId::PreReady, 1),
            self.queues
                .peek_at(&self.arena, &mut self.fault, QueueId::PreReady, 2),
        ];
        let (Some(w0), Some(w1), Some(w2)) = (window[0], window[1], window[2]) else {
            return false;
        };
        // A marker anywhere in the window means the head field belongs to
        // a finished stream segment; drain it instead of composing.
        let window_has_marker = [w0, w1, w2]
            .iter()
            .filter_map(|t| self.arena.get(*t))
            .any(|b| b.op == PostOp::Dummy);
        if window_has_marker {
            self.queues.remove(&mut self.arena, &mut self.fault, head);
            self.queues
                .enqueue(&mut self.arena, &mut self.fault, QueueId::Recycle, head);
            return true;
        }
        if w0 == w1 || w1 == w2 || w0 == w2 {
            self.fault
                .record(FaultReason::SelfReference, Some(QueueId::PreReady), Some(w0));
            return false;
        }

        let Some(post) = self
            .queues
            .take_head(&mut self.arena, &mut self.fault, QueueId::PostFree)
        else {
            return false;
        };
        self.queues.remove(&mut self.arena, &mut self.fault, head);

        // Timing comes from the middle field.
        let mid_meta = self.arena.get(w1).map(|b| b.meta);
        let throw = [w0, w1, w2]
            .iter()
            .filter_map(|t| self.arena.get(*t))
            .any(|b| b.throw);
        // Under film cadence a zero-motion middle field matched its
        // same-parity reference, so weaving the pair is lossless.
        let mid_motion = self.arena.get(w1).map(|b| b.motion).unwrap_or(u32::MAX);
        let film = matches!(
            self.pre.cadence.current(),
            Cadence::Film32 | Cadence::Film22
        );
        let mode = if film && mid_motion == 0 {
            BlendMode::Weave
        } else {
            BlendMode::MotionBlend
        };
        let seq = self.post.seq;
        self.post.seq += 1;

        if let Some(buf) = self.arena.get_mut(post) {
            buf.dup = window;
            buf.owned[0] = Some(head);
            buf.blend = mode;
            buf.throw = throw;
            buf.seq = seq;
            if let Some(mid) = mid_meta {
                buf.meta = mid;
                buf.meta.scan = ScanKind::Progressive;
                buf.meta.height = mid.height;
            }
        }
        EngineMetrics::bump(&metrics.frames_composed);

        if throw {
            self.drop_composed(post, metrics);
            return true;
        }
        for token in [w0, w1, w2] {
            if let Some(buf) = self.arena.get_mut(token) {
                buf.post_ref += 1;
            }
        }
        if let Some(buf) = self.arena.get_mut(post) {
            buf.refs_held = true;
        }
        self.queues
            .enqueue(&mut self.arena, &mut self.fault, QueueId::PostDoing, post);
        true
    }

    /// Post disabled for this field: spatial interpolation from the single
    /// field, still a hardware pass.
    fn compose_edge_only(&mut self, head: BufToken, metrics: &EngineMetrics) -> bool {
        let Some(post) = self
            .queues
            .take_head(&mut self.arena, &mut self.fault, QueueId::PostFree)
        else {
            return false;
        };
        self.queues.remove(&mut self.arena, &mut self.fault, head);

        let head_meta = self.arena.get(head).map(|b| b.meta);
        let throw = self.arena.get(head).is_some_and(|b| b.throw);
        let seq = self.post.seq;
        self.post.seq += 1;
        if let Some(buf) = self.arena.get_mut(post) {
            buf.dup[0] = Some(head);
            buf.owned[0] = Some(head);
            buf.blend = BlendMode::EdgeInterp;
            buf.throw = throw;
            buf.seq = seq;
            if let Some(meta) = head_meta {
                buf.meta = meta;
                buf.meta.scan = ScanKind::Progressive;
            }
        }
        EngineMetrics::bump(&metrics.frames_composed);
        if throw {
            self.drop_composed(post, metrics);
            return true;
        }
        if let Some(buf) = self.arena.get_mut(head) {
            buf.post_ref += 1;
        }
        if let Some(buf) = self.arena.get_mut(post) {
            buf.refs_held = true;
        }
        self.queues
            .enqueue(&mut self.arena, &mut self.fault, QueueId::PostDoing, post);
        true
    }

    /// Straight weave of a linked pair written from one progressive frame.
    /// The pair is consumed outright; counters stay untouched.
    fn compose_woven_pair(
        &mut self,
        primary: BufToken,
        buddy: BufToken,
        metrics: &EngineMetrics,
    ) -> bool {
        // The published half must carry the top field; a lone bottom half
        // means cadence was lost upstream.  Drop it rather than weave
        // swapped fields.
        let top_first = self
            .arena
            .get(primary)
            .is_some_and(|b| b.meta.scan.parity() == Some(FieldParity::Top));
        if !top_first {
            self.queues.remove(&mut self.arena, &mut self.fault, primary);
            self.queues
                .enqueue(&mut self.arena, &mut self.fault, QueueId::Recycle, primary);
            EngineMetrics::bump(&metrics.fields_discarded);
            debug!(token = %primary, "mis-paritied pair head discarded");
            return true;
        }

        let Some(post) = self
            .queues
            .take_head(&mut self.arena, &mut self.fault, QueueId::PostFree)
        else {
            return false;
        };
        self.queues.remove(&mut self.arena, &mut self.fault, primary);

        let prim_meta = self.arena.get(primary).map(|b| b.meta);
        let throw = self.arena.get(primary).is_some_and(|b| b.throw);
        let seq = self.post.seq;
        self.post.seq += 1;
        if let Some(buf) = self.arena.get_mut(post) {
            buf.dup = [Some(primary), Some(buddy), None];
            buf.owned[0] = Some(primary);
            buf.blend = BlendMode::Weave;
            buf.throw = throw;
            buf.seq = seq;
            if let Some(meta) = prim_meta {
                buf.meta = meta;
                buf.meta.scan = ScanKind::Progressive;
                buf.meta.duration_us = meta.duration_us * 2;
            }
        }
        EngineMetrics::bump(&metrics.frames_composed);
        if throw {
            self.drop_composed(post, metrics);
            return true;
        }
        self.queues
            .enqueue(&mut self.arena, &mut self.fault, QueueId::PostDoing, post);
        true
    }

    /// Progressive or bypassed input: wrap and publish, no hardware pass.
    fn compose_bypass(&mut self, head: BufToken, metrics: &EngineMetrics) -> bool {
        let Some(post) = self
            .queues
            .take_head(&mut self.arena, &mut self.fault, QueueId::PostFree)
        else {
            return false;
        };
        self.queues.remove(&mut self.arena, &mut self.fault, head);

        let head_meta = self.arena.get(head).map(|b| b.meta);
        let seq = self.post.seq;
        self.post.seq += 1;
        if let Some(buf) = self.arena.get_mut(post) {
            buf.dup[0] = Some(head);
            buf.owned[0] = Some(head);
            buf.blend = BlendMode::Bypass;
            buf.seq = seq;
            if let Some(meta) = head_meta {
                buf.meta = meta;
            }
            // The consumer reads the wrapped source surface directly; the
            // output surface's own canvas is untouched (see `Pipeline::get`).
        }
        self.queues
            .enqueue(&mut self.arena, &mut self.fault, QueueId::PostReady, post);
        EngineMetrics::bump(&metrics.frames_composed);
        true
    }

    /// Drop a composed frame before arming: its window goes straight back
    /// through recycle.
    fn drop_composed(&mut self, post: BufToken, metrics: &EngineMetrics) {
        let owned = self
            .arena
            .get(post)
            .map(|b| b.owned)
            .unwrap_or([None, None]);
        for token in owned.into_iter().flatten() {
            self.queues
                .enqueue(&mut self.arena, &mut self.fault, QueueId::Recycle, token);
        }
        if let Some(buf) = self.arena.get_mut(post) {
            buf.reset();
        }
        self.queues
            .enqueue(&mut self.arena, &mut self.fault, QueueId::PostFree, post);
        EngineMetrics::bump(&metrics.frames_dropped);
        debug!(token = %post, "composed frame dropped before arm");
    }

    /// Step 5 of the quantum: arm the oldest composed frame.  The buffer
    /// stays attached to `PostDoing` until completion.
    pub fn post_arm(&mut self) {
        if self.post.busy {
            return;
        }
        let Some(token) = self
            .queues
            .peek_head(&self.arena, &mut self.fault, QueueId::PostDoing)
        else {
            return;
        };
        let Some(buf) = self.arena.get(token) else {
            return;
        };

        let window = buf.dup;
        let mode = buf.blend;
        let output = buf.canvas;
        let mut planes = [None, None, None];
        for (slot, dup) in window.iter().enumerate() {
            planes[slot] = dup.and_then(|t| self.arena.get(t)).map(|b| MemInterface {
                canvas: b.canvas,
                field: b.meta.scan.parity(),
            });
        }
        let arm = PostArm {
            mode,
            window: planes,
            output,
        };

        self.post.busy = true;
        self.post.done = false;
        self.post.forced = false;
        self.post.busy_ticks = 0;
        self.post.cur = Some(token);

        if let Err(err) = self.unit.arm_post(&arm) {
            tracing::warn!(error = %err, "post arm failed, forcing completion");
            self.post.done = true;
            self.post.forced = true;
        }
    }

    /// Fold a finished post pass back: the frame moves to the consumer
    /// queue.
    pub fn post_complete(&mut self) {
        if !(self.post.busy && self.post.done) {
            return;
        }
        self.post.busy = false;
        self.post.done = false;
        let forced = std::mem::take(&mut self.post.forced);
        let Some(token) = self.post.cur.take() else {
            self.fault.record(FaultReason::UnexpectedEmpty, None, None);
            return;
        };
        if self.arena.get(token).map(|b| b.queue) != Some(Some(QueueId::PostDoing)) {
            self.fault
                .record(FaultReason::WrongQueue, Some(QueueId::PostDoing), Some(token));
            return;
        }
        self.queues.remove(&mut self.arena, &mut self.fault, token);
        self.queues
            .enqueue(&mut self.arena, &mut self.fault, QueueId::PostReady, token);
        if forced {
            debug!(token = %token, "forced post completion published");
        }
    }

    /// Recycle a composed frame's window and return the output surface to
    /// the free queue.  Called when the consumer puts a frame back.
    pub fn post_recycle(&mut self, token: BufToken) {
        let Some(buf) = self.arena.get(token) else {
            self.fault.record(FaultReason::UnknownToken, None, Some(token));
            return;
        };
        let dup = buf.dup;
        let owned = buf.owned;
        let refs_held = buf.refs_held;

        // Only frames that took counts release them; weave and bypass
        // consume their window outright through the owned set.
        if refs_held {
            for field in dup.into_iter().flatten() {
                match self.arena.get_mut(field) {
                    Some(b) if b.post_ref > 0 => b.post_ref -= 1,
                    _ => self
                        .fault
                        .record(FaultReason::PostRefUnderflow, None, Some(field)),
                }
            }
        }
        for consumed in owned.into_iter().flatten() {
            self.queues
                .enqueue(&mut self.arena, &mut self.fault, QueueId::Recycle, consumed);
        }
        if let Some(buf) = self.arena.get_mut(token) {
            buf.reset();
        }
        self.queues
            .enqueue(&mut self.arena, &mut self.fault, QueueId::PostFree, token);
    }
}
