//! The hardware-unit seam.
//!
//! The deinterlacer ASIC has two units: a pre-process unit that writes
//! per-field intermediates (and motion maps) into local buffers, and a
//! post-process unit that blends a temporal window of fields into one
//! progressive frame.  Both are fire-and-forget: arming is a short burst of
//! register writes and completion arrives asynchronously.
//!
//! [`VideoUnit`] abstracts that contract so the engine can run against the
//! real memory-mapped unit or against [`SimUnit`] in tests, where the
//! completion interrupt is substituted by an explicit call into the engine's
//! completion handler.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::types::{Canvas, FieldParity};

// ─── Arm descriptors ─────────────────────────────────────────────────────

/// One surface the unit reads or writes, with the field it should walk.
#[derive(Clone, Copy, Debug)]
pub struct MemInterface {
    pub canvas: Canvas,
    /// `None` means the full progressive surface.
    pub field: Option<FieldParity>,
}

/// How the post unit combines its input window into the output frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    /// Interleave two fields line-by-line, no interpolation.
    Weave,
    /// Motion-adaptive blend over a three-field window.
    MotionBlend,
    /// Spatial edge interpolation from a single field.
    EdgeInterp,
    /// Pass a progressive surface through untouched (no hardware pass).
    Bypass,
}

/// Pre-process arm request: current field in, temporal references, field
/// intermediate out.
#[derive(Clone, Copy, Debug)]
pub struct PreArm {
    pub input: MemInterface,
    /// Field from two fields ago, same parity as `input`.
    pub memory: Option<MemInterface>,
    /// Opposite-parity field between `memory` and `input`.
    pub chan2: Option<MemInterface>,
    pub write: MemInterface,
    /// Whether to also produce a motion map for the post blend.
    pub motion_map: bool,
}

/// Post-process arm request: up to three field intermediates blended into
/// one progressive output surface.
#[derive(Clone, Copy, Debug)]
pub struct PostArm {
    pub mode: BlendMode,
    pub window: [Option<MemInterface>; 3],
    pub output: Canvas,
}

/// Completion events delivered by the unit's interrupt path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitEvent {
    PreDone,
    PostDone,
}

/// Temporal-analysis side output of one pre-process pass, read back after
/// completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreReport {
    /// Pixels that moved against the same-parity reference.  Zero means the
    /// field repeats its reference, the pulldown-cadence signature.
    pub motion: u32,
}

impl PreReport {
    /// Report for a pass with no usable analysis (no reference window yet,
    /// or a forced completion).
    pub fn saturated() -> Self {
        Self { motion: u32::MAX }
    }
}

// ─── The seam ────────────────────────────────────────────────────────────

/// Register-level access to the deinterlacer units.
///
/// Implementations must not block: arming is register writes only, and
/// completion is reported out-of-band to the engine's completion handler.
pub trait VideoUnit: Send {
    /// Kick one pre-process pass.
    fn arm_pre(&mut self, arm: &PreArm) -> Result<()>;

    /// Kick one post-process pass.  Never called with [`BlendMode::Bypass`].
    fn arm_post(&mut self, arm: &PostArm) -> Result<()>;

    /// Read back the analysis counters of the last completed pre pass.
    /// Units without an analysis block report saturated motion.
    fn pre_report(&mut self) -> PreReport {
        PreReport::saturated()
    }

    /// Force the pre unit idle.  Used on software timeout and teardown.
    fn disable_pre(&mut self);

    /// Force the post unit idle.
    fn disable_post(&mut self);
}

// ─── Simulator ───────────────────────────────────────────────────────────

/// Records every arm request for inspection.
#[derive(Clone, Debug)]
pub enum ArmRecord {
    Pre(PreArm),
    Post(PostArm),
}

/// In-memory stand-in for the ASIC.
///
/// Arms are recorded, never executed; tests drive completions by calling
/// the engine's completion handler directly.
#[derive(Default)]
pub struct SimUnit {
    pub arms: Vec<ArmRecord>,
    pub pre_armed: u64,
    pub post_armed: u64,
    pub pre_disabled: u64,
    pub post_disabled: u64,
    /// Scripted analysis readbacks, consumed one per `pre_report` call;
    /// saturated once exhausted.
    pub reports: VecDeque<PreReport>,
    /// When set, the next arm call fails with this message once.
    pub fail_next: Option<&'static str>,
}

impl SimUnit {
    /// A unit handle for the engine plus a shared view for test inspection.
    pub fn shared() -> (SharedSimUnit, Arc<Mutex<SimUnit>>) {
        let state = Arc::new(Mutex::new(SimUnit::default()));
        (SharedSimUnit(state.clone()), state)
    }

    fn take_failure(&mut self) -> Option<&'static str> {
        self.fail_next.take()
    }
}

/// `VideoUnit` facade over a shared [`SimUnit`].
pub struct SharedSimUnit(Arc<Mutex<SimUnit>>);

impl SharedSimUnit {
    fn with<R>(&self, f: impl FnOnce(&mut SimUnit) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

impl VideoUnit for SharedSimUnit {
    fn arm_pre(&mut self, arm: &PreArm) -> Result<()> {
        self.with(|sim| {
            if let Some(msg) = sim.take_failure() {
                return Err(crate::error::EngineError::Unit(msg.into()));
            }
            sim.pre_armed += 1;
            sim.arms.push(ArmRecord::Pre(*arm));
            Ok(())
        })
    }

    fn arm_post(&mut self, arm: &PostArm) -> Result<()> {
        self.with(|sim| {
            if let Some(msg) = sim.take_failure() {
                return Err(crate::error::EngineError::Unit(msg.into()));
            }
            sim.post_armed += 1;
            sim.arms.push(ArmRecord::Post(*arm));
            Ok(())
        })
    }

    fn pre_report(&mut self) -> PreReport {
        self.with(|sim| sim.reports.pop_front().unwrap_or(PreReport::saturated()))
    }

    fn disable_pre(&mut self) {
        self.with(|sim| sim.pre_disabled += 1);
    }

    fn disable_post(&mut self) {
        self.with(|sim| sim.post_disabled += 1);
    }
}
