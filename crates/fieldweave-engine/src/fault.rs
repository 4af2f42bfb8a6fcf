//! Consistency fault recording.
//!
//! The queue manager and both state machines funnel every detected
//! inconsistency through [`FaultState::record`].  Recording is first-wins:
//! the first violation is kept verbatim for postmortem inspection, later
//! ones only bump the counter, since cascading damage usually follows the
//! original corruption and would overwrite the interesting record.
//!
//! While a fault is active the scheduler stops admitting new work and the
//! consumer surface reports nothing available; [`FaultState::clear`] is
//! called only from the engine's explicit recovery path.

use tracing::error;

use crate::pool::BufToken;
use crate::queue::QueueId;

/// The four violation classes the checker distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultCategory {
    TokenMismatch,
    IllegalTransition,
    UnexpectedEmpty,
    RefUnderflow,
}

/// Specific violation detected by a queue or state-machine check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultReason {
    /// A queue slot held a token that does not resolve to any buffer.
    UnknownToken,
    /// A queue slot's token and the buffer's own token disagree.
    SlotTokenMismatch,
    /// A buffer's recorded queue and the queue it was found in disagree.
    WrongQueue,
    /// Enqueue of a buffer that is still attached to a queue.
    NotDetached,
    /// Removal of a buffer that is not attached to the expected queue.
    NotAttached,
    /// A buffer appeared in its own temporal reference window.
    SelfReference,
    /// Only one half of a linked pair reached the recycle path.
    HalfPairRecycle,
    /// A queue produced no element where the state machine guaranteed one.
    UnexpectedEmpty,
    /// Enqueue onto a queue that already holds every pool buffer.
    QueueOverflow,
    /// A queue scan ran past the pool capacity without terminating.
    ScanOverflow,
    PreRefUnderflow,
    PostRefUnderflow,
}

impl FaultReason {
    pub fn category(self) -> FaultCategory {
        match self {
            Self::UnknownToken | Self::SlotTokenMismatch | Self::WrongQueue => {
                FaultCategory::TokenMismatch
            }
            Self::NotDetached
            | Self::NotAttached
            | Self::SelfReference
            | Self::HalfPairRecycle => FaultCategory::IllegalTransition,
            Self::UnexpectedEmpty | Self::QueueOverflow | Self::ScanOverflow => {
                FaultCategory::UnexpectedEmpty
            }
            Self::PreRefUnderflow | Self::PostRefUnderflow => FaultCategory::RefUnderflow,
        }
    }
}

/// Snapshot of the first recorded violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRecord {
    pub reason: FaultReason,
    pub queue: Option<QueueId>,
    pub buffer: Option<BufToken>,
}

/// First-wins fault latch plus a running violation counter.
#[derive(Debug, Default)]
pub struct FaultState {
    violations: u64,
    first: Option<FaultRecord>,
}

impl FaultState {
    pub fn record(&mut self, reason: FaultReason, queue: Option<QueueId>, buffer: Option<BufToken>) {
        self.violations += 1;
        if self.first.is_none() {
            error!(
                ?reason,
                category = ?reason.category(),
                ?queue,
                ?buffer,
                "pipeline consistency fault"
            );
            self.first = Some(FaultRecord {
                reason,
                queue,
                buffer,
            });
        }
    }

    pub fn active(&self) -> bool {
        self.violations > 0
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }

    pub fn first(&self) -> Option<&FaultRecord> {
        self.first.as_ref()
    }

    /// Reset the latch.  Only the recovery path calls this, after pools and
    /// queues have been reinitialized.
    pub fn clear(&mut self) {
        self.violations = 0;
        self.first = None;
    }
}
