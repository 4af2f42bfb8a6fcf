//! Producer/consumer exchange contracts.
//!
//! The engine sits between an upstream frame producer (decoder, tuner) and
//! a downstream consumer (display path).  Upstream is abstracted as
//! [`FrameSource`]; the engine borrows frames with `get` and returns every
//! borrowed frame with `put` once its pipeline role ends.  Downstream uses
//! the peek/get/put triple on the engine itself (see `engine::Pipeline`).

use serde::Serialize;

use fieldweave_core::types::{Canvas, FrameMeta};

use crate::fault::FaultRecord;
use crate::pool::BufToken;
use crate::pre::Cadence;

// ─── Upstream ────────────────────────────────────────────────────────────

/// One producer-owned frame surface on loan to the engine.
#[derive(Clone, Copy, Debug)]
pub struct SourceFrame {
    pub meta: FrameMeta,
    pub canvas: Canvas,
}

/// Upstream frame producer.
///
/// Implementations: decoder output queue, tuner capture ring, test fixtures.
/// `peek` must be cheap and side-effect free; the engine peeks every frame
/// for format-change detection before deciding to take it.
pub trait FrameSource: Send + 'static {
    /// Metadata of the next available frame, or `None` if starved.
    fn peek(&mut self) -> Option<FrameMeta>;

    /// Take the next frame.  The engine now owes a `put`.
    fn get(&mut self) -> Option<SourceFrame>;

    /// Return a borrowed frame.
    fn put(&mut self, frame: SourceFrame);
}

/// Events the producer side delivers to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// A new frame is available upstream.
    FrameReady,
    /// Producer is going away; release everything, return all loans.
    Unregister,
    /// Producer is pausing; stop and abandon loans without `put`.
    LightUnregister,
    /// Discontinuity; flush in-flight state, keep the registration.
    Reset,
}

// ─── Downstream ──────────────────────────────────────────────────────────

/// A finished progressive frame held by the consumer.
#[derive(Clone, Copy, Debug)]
pub struct OutputFrame {
    /// Hand this back via `put` to recycle the underlying buffers.
    pub token: BufToken,
    pub meta: FrameMeta,
    pub canvas: Canvas,
}

/// Snapshot of pool occupancy for diagnostics and consumer pacing.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct EngineStates {
    /// Total buffers across all pools.
    pub pool_size: usize,
    /// Post buffers free for composition.
    pub free: usize,
    /// Buffers parked on the recycle queue.
    pub recyclable: usize,
    /// Finished frames the consumer could get right now.
    pub ready: usize,
    /// Frames currently on loan to the consumer.
    pub on_display: usize,
    /// Consistency violations seen since the last recovery.
    pub violations: u64,
    /// First recorded violation, if any.
    #[serde(skip)]
    pub first_fault: Option<FaultRecord>,
    /// Cadence currently detected from the pre-pass motion readbacks.
    pub cadence: Cadence,
}
