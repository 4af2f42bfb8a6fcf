//! The queue manager: nine named queues over one validating queue type.
//!
//! Every buffer movement in the pipeline goes through here.  Each operation
//! cross-checks the queue slot, the token, and the buffer's recorded
//! attachment; any disagreement records a first-wins fault instead of
//! panicking, and the caller sees the operation as "nothing available".
//!
//! Three disciplines cover the access patterns the state machines need:
//!
//! - `Fifo`     — ring with wraparound in/out indices; ordered hand-off
//!                queues (free lists, ready queues).
//! - `Scan`     — unordered slot scan; queues with arbitrary-order removal
//!                (recycle, display, in-flight post).
//! - `Indexed`  — slot fixed to the buffer's own index; lets the pre stage
//!                find two adjacent local buffers for a split progressive
//!                frame in O(capacity).

use crate::fault::{FaultReason, FaultState};
use crate::pool::{BufToken, BufferArena};

// ─── Queue identities ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueId {
    /// Input wrappers awaiting a producer frame.
    InFree,
    /// Local field intermediates awaiting the pre stage.
    LocalFree,
    /// Pre-processed fields awaiting composition.
    PreReady,
    /// Post output surfaces awaiting composition.
    PostFree,
    /// Composed frames armed on the post unit.
    PostDoing,
    /// Finished frames awaiting the consumer.
    PostReady,
    /// Buffers done with their pipeline role, awaiting the sweep.
    Recycle,
    /// Frames currently held by the consumer.
    Display,
    /// Staging for teardown edge cases.
    Tmp,
}

impl QueueId {
    pub const ALL: [QueueId; 9] = [
        QueueId::InFree,
        QueueId::LocalFree,
        QueueId::PreReady,
        QueueId::PostFree,
        QueueId::PostDoing,
        QueueId::PostReady,
        QueueId::Recycle,
        QueueId::Display,
        QueueId::Tmp,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::InFree => "in_free",
            Self::LocalFree => "local_free",
            Self::PreReady => "pre_ready",
            Self::PostFree => "post_free",
            Self::PostDoing => "post_doing",
            Self::PostReady => "post_ready",
            Self::Recycle => "recycle",
            Self::Display => "display",
            Self::Tmp => "tmp",
        }
    }

    fn pos(self) -> usize {
        Self::ALL.iter().position(|q| *q == self).unwrap_or(0)
    }

    fn discipline(self, linked_mode: bool) -> Discipline {
        match self {
            Self::InFree | Self::PreReady | Self::PostFree | Self::PostReady | Self::Tmp => {
                Discipline::Fifo
            }
            Self::LocalFree => {
                if linked_mode {
                    Discipline::Indexed
                } else {
                    Discipline::Scan
                }
            }
            Self::PostDoing | Self::Recycle | Self::Display => Discipline::Scan,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discipline {
    Fifo,
    Scan,
    Indexed,
}

// ─── One queue ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct Queue {
    discipline: Discipline,
    slots: Vec<Option<BufToken>>,
    /// Fifo out index.
    head: usize,
    /// Fifo in index.
    tail: usize,
    count: usize,
}

impl Queue {
    fn new(id: QueueId, capacity: usize, linked_mode: bool) -> Self {
        Self {
            discipline: id.discipline(linked_mode),
            slots: vec![None; capacity],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    fn reset(&mut self) {
        self.slots.fill(None);
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }

    /// Slot index the head element lives at, if any.
    fn head_slot(&self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        match self.discipline {
            Discipline::Fifo => Some(self.head),
            Discipline::Scan | Discipline::Indexed => {
                self.slots.iter().position(Option::is_some)
            }
        }
    }

    /// Ordered snapshot of the queue contents.
    fn tokens(&self) -> Vec<BufToken> {
        match self.discipline {
            Discipline::Fifo => {
                let cap = self.slots.len();
                (0..self.count)
                    .filter_map(|i| self.slots[(self.head + i) % cap])
                    .collect()
            }
            Discipline::Scan | Discipline::Indexed => {
                self.slots.iter().filter_map(|s| *s).collect()
            }
        }
    }
}

// ─── The manager ─────────────────────────────────────────────────────────

/// All nine queues, sized to hold every pool buffer.
#[derive(Debug)]
pub struct QueueSet {
    queues: Vec<Queue>,
}

impl QueueSet {
    pub fn new(capacity: usize, linked_mode: bool) -> Self {
        let queues = QueueId::ALL
            .iter()
            .map(|id| Queue::new(*id, capacity, linked_mode))
            .collect();
        Self { queues }
    }

    fn q(&self, id: QueueId) -> &Queue {
        &self.queues[id.pos()]
    }

    fn q_mut(&mut self, id: QueueId) -> &mut Queue {
        &mut self.queues[id.pos()]
    }

    pub fn count(&self, id: QueueId) -> usize {
        self.q(id).count
    }

    pub fn is_empty(&self, id: QueueId) -> bool {
        self.count(id) == 0
    }

    /// Ordered snapshot, for bounded sweeps that mutate while iterating.
    pub fn tokens(&self, id: QueueId) -> Vec<BufToken> {
        self.q(id).tokens()
    }

    /// Attach a detached buffer to a queue.
    pub fn enqueue(
        &mut self,
        arena: &mut BufferArena,
        fault: &mut FaultState,
        id: QueueId,
        token: BufToken,
    ) {
        let Some(buf) = arena.get_mut(token) else {
            fault.record(FaultReason::UnknownToken, Some(id), Some(token));
            return;
        };
        if buf.queue.is_some() {
            fault.record(FaultReason::NotDetached, Some(id), Some(token));
            return;
        }

        let queue = self.q_mut(id);
        let cap = queue.slots.len();
        let slot = match queue.discipline {
            Discipline::Fifo => {
                if queue.count >= cap {
                    fault.record(FaultReason::QueueOverflow, Some(id), Some(token));
                    return;
                }
                let slot = queue.tail;
                queue.tail = (queue.tail + 1) % cap;
                slot
            }
            Discipline::Scan => match queue.slots.iter().position(Option::is_none) {
                Some(slot) => slot,
                None => {
                    fault.record(FaultReason::QueueOverflow, Some(id), Some(token));
                    return;
                }
            },
            Discipline::Indexed => {
                let slot = usize::from(token.index);
                if slot >= cap || queue.slots[slot].is_some() {
                    fault.record(FaultReason::QueueOverflow, Some(id), Some(token));
                    return;
                }
                slot
            }
        };

        queue.slots[slot] = Some(token);
        queue.count += 1;
        buf.queue = Some(id);
    }

    /// Validate the token a slot claims to hold against the arena.
    fn validate(
        &self,
        arena: &BufferArena,
        fault: &mut FaultState,
        id: QueueId,
        token: BufToken,
    ) -> bool {
        let Some(buf) = arena.get(token) else {
            fault.record(FaultReason::UnknownToken, Some(id), Some(token));
            return false;
        };
        if buf.token != token {
            fault.record(FaultReason::SlotTokenMismatch, Some(id), Some(token));
            return false;
        }
        if buf.queue != Some(id) {
            fault.record(FaultReason::WrongQueue, Some(id), Some(token));
            return false;
        }
        true
    }

    /// Look at the head element without removing it.
    pub fn peek_head(
        &self,
        arena: &BufferArena,
        fault: &mut FaultState,
        id: QueueId,
    ) -> Option<BufToken> {
        let queue = self.q(id);
        let slot = queue.head_slot()?;
        let Some(token) = queue.slots[slot] else {
            fault.record(FaultReason::UnexpectedEmpty, Some(id), None);
            return None;
        };
        if !self.validate(arena, fault, id, token) {
            return None;
        }
        Some(token)
    }

    /// Peek the n-th element in queue order.  Used by the post stage to
    /// inspect the temporal window without disturbing it.
    pub fn peek_at(
        &self,
        arena: &BufferArena,
        fault: &mut FaultState,
        id: QueueId,
        n: usize,
    ) -> Option<BufToken> {
        let token = *self.q(id).tokens().get(n)?;
        if !self.validate(arena, fault, id, token) {
            return None;
        }
        Some(token)
    }

    /// Remove and return the head element.
    pub fn take_head(
        &mut self,
        arena: &mut BufferArena,
        fault: &mut FaultState,
        id: QueueId,
    ) -> Option<BufToken> {
        let token = self.peek_head(arena, fault, id)?;
        self.remove(arena, fault, token);
        Some(token)
    }

    /// Detach a specific buffer from the queue it is attached to.
    pub fn remove(&mut self, arena: &mut BufferArena, fault: &mut FaultState, token: BufToken) {
        let Some(buf) = arena.get(token) else {
            fault.record(FaultReason::UnknownToken, None, Some(token));
            return;
        };
        let Some(id) = buf.queue else {
            fault.record(FaultReason::NotAttached, None, Some(token));
            return;
        };

        let queue = self.q_mut(id);
        let cap = queue.slots.len();
        let removed = match queue.discipline {
            Discipline::Fifo => {
                // Head removal is the common case; mid-queue removal
                // compacts the ring.
                let mut found = None;
                for i in 0..queue.count {
                    let slot = (queue.head + i) % cap;
                    if queue.slots[slot] == Some(token) {
                        found = Some(i);
                        break;
                    }
                }
                match found {
                    Some(0) => {
                        queue.slots[queue.head] = None;
                        queue.head = (queue.head + 1) % cap;
                        true
                    }
                    Some(at) => {
                        for i in at..queue.count - 1 {
                            let dst = (queue.head + i) % cap;
                            let src = (queue.head + i + 1) % cap;
                            queue.slots[dst] = queue.slots[src];
                        }
                        queue.tail = (queue.head + queue.count - 1) % cap;
                        queue.slots[queue.tail] = None;
                        true
                    }
                    None => false,
                }
            }
            Discipline::Scan => match queue.slots.iter().position(|s| *s == Some(token)) {
                Some(slot) => {
                    queue.slots[slot] = None;
                    true
                }
                None => false,
            },
            Discipline::Indexed => {
                let slot = usize::from(token.index);
                if slot < cap && queue.slots[slot] == Some(token) {
                    queue.slots[slot] = None;
                    true
                } else {
                    false
                }
            }
        };

        if !removed {
            fault.record(FaultReason::SlotTokenMismatch, Some(id), Some(token));
            return;
        }
        queue.count -= 1;
        if let Some(buf) = arena.get_mut(token) {
            buf.queue = None;
        }
    }

    /// Bounded membership scan.  A scan that somehow runs past the pool
    /// capacity records a fault rather than looping.
    pub fn contains(
        &self,
        fault: &mut FaultState,
        id: QueueId,
        token: BufToken,
    ) -> bool {
        let queue = self.q(id);
        let cap = queue.slots.len();
        let mut visited = 0usize;
        for slot in &queue.slots {
            visited += 1;
            if visited > cap {
                fault.record(FaultReason::ScanOverflow, Some(id), Some(token));
                return false;
            }
            if *slot == Some(token) {
                return true;
            }
        }
        false
    }

    /// Find two adjacent free local buffers (Indexed discipline only).
    /// Returns the lower-indexed token of the pair.
    pub fn peek_adjacent_pair(&self, id: QueueId) -> Option<(BufToken, BufToken)> {
        let queue = self.q(id);
        if queue.discipline != Discipline::Indexed {
            return None;
        }
        for w in queue.slots.windows(2) {
            if let [Some(a), Some(b)] = w {
                return Some((*a, *b));
            }
        }
        None
    }

    /// Drop every element everywhere.  Buffer attachments are cleared by
    /// the caller via arena reinitialization.
    pub fn reset(&mut self) {
        for queue in &mut self.queues {
            queue.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferArena, PoolCapacities, PoolKind};

    fn setup(linked: bool) -> (BufferArena, QueueSet, FaultState) {
        let caps = PoolCapacities {
            input: 4,
            local: 6,
            post: 4,
        };
        let arena = BufferArena::init(caps, 720, 480, false);
        let queues = QueueSet::new(caps.total(), linked);
        (arena, queues, FaultState::default())
    }

    fn tok(kind: PoolKind, index: u8) -> BufToken {
        BufToken::new(kind, index)
    }

    #[test]
    fn fifo_preserves_order_across_wraparound() {
        let (mut arena, mut queues, mut fault) = setup(false);
        // Cycle enough times to wrap the ring.
        for round in 0..5u8 {
            for i in 0..4u8 {
                queues.enqueue(
                    &mut arena,
                    &mut fault,
                    QueueId::InFree,
                    tok(PoolKind::Input, i),
                );
            }
            for i in 0..4u8 {
                let got = queues
                    .take_head(&mut arena, &mut fault, QueueId::InFree)
                    .expect("head");
                assert_eq!(got, tok(PoolKind::Input, i), "round {round}");
            }
        }
        assert!(!fault.active());
    }

    #[test]
    fn enqueue_attached_buffer_records_fault() {
        let (mut arena, mut queues, mut fault) = setup(false);
        let t = tok(PoolKind::Input, 0);
        queues.enqueue(&mut arena, &mut fault, QueueId::InFree, t);
        queues.enqueue(&mut arena, &mut fault, QueueId::Recycle, t);
        assert!(fault.active());
        assert_eq!(
            fault.first().expect("record").reason,
            FaultReason::NotDetached
        );
        // The original attachment is untouched.
        assert_eq!(queues.count(QueueId::InFree), 1);
        assert_eq!(queues.count(QueueId::Recycle), 0);
    }

    #[test]
    fn corrupted_attachment_faults_on_peek() {
        let (mut arena, mut queues, mut fault) = setup(false);
        let t = tok(PoolKind::Local, 2);
        queues.enqueue(&mut arena, &mut fault, QueueId::PreReady, t);
        // Inject the corruption: the buffer claims a different queue.
        arena.get_mut(t).expect("buffer").queue = Some(QueueId::Recycle);

        assert!(queues
            .peek_head(&arena, &mut fault, QueueId::PreReady)
            .is_none());
        assert!(fault.active());
        assert_eq!(fault.first().expect("record").reason, FaultReason::WrongQueue);
    }

    #[test]
    fn scan_discipline_supports_arbitrary_removal() {
        let (mut arena, mut queues, mut fault) = setup(false);
        for i in 0..3u8 {
            queues.enqueue(
                &mut arena,
                &mut fault,
                QueueId::Display,
                tok(PoolKind::Post, i),
            );
        }
        queues.remove(&mut arena, &mut fault, tok(PoolKind::Post, 1));
        assert_eq!(queues.count(QueueId::Display), 2);
        assert!(queues.contains(&mut fault, QueueId::Display, tok(PoolKind::Post, 0)));
        assert!(!queues.contains(&mut fault, QueueId::Display, tok(PoolKind::Post, 1)));
        assert!(!fault.active());
    }

    #[test]
    fn fifo_mid_queue_removal_compacts() {
        let (mut arena, mut queues, mut fault) = setup(false);
        for i in 0..4u8 {
            queues.enqueue(
                &mut arena,
                &mut fault,
                QueueId::PreReady,
                tok(PoolKind::Local, i),
            );
        }
        queues.remove(&mut arena, &mut fault, tok(PoolKind::Local, 1));
        assert!(!fault.active());
        let order: Vec<u8> = queues.tokens(QueueId::PreReady).iter().map(|t| t.index).collect();
        assert_eq!(order, vec![0, 2, 3]);
        let head = queues
            .take_head(&mut arena, &mut fault, QueueId::PreReady)
            .expect("head");
        assert_eq!(head.index, 0);
    }

    #[test]
    fn indexed_discipline_finds_adjacent_pairs() {
        let (mut arena, mut queues, mut fault) = setup(true);
        // Free indices 0, 2, 3, 5: the only adjacent pair is (2, 3).
        for i in [0u8, 2, 3, 5] {
            queues.enqueue(
                &mut arena,
                &mut fault,
                QueueId::LocalFree,
                tok(PoolKind::Local, i),
            );
        }
        let (a, b) = queues
            .peek_adjacent_pair(QueueId::LocalFree)
            .expect("pair available");
        assert_eq!((a.index, b.index), (2, 3));

        queues.remove(&mut arena, &mut fault, tok(PoolKind::Local, 3));
        assert!(queues.peek_adjacent_pair(QueueId::LocalFree).is_none());
        assert!(!fault.active());
    }

    #[test]
    fn counts_track_slot_occupancy() {
        let (mut arena, mut queues, mut fault) = setup(false);
        for i in 0..4u8 {
            queues.enqueue(
                &mut arena,
                &mut fault,
                QueueId::Recycle,
                tok(PoolKind::Input, i),
            );
        }
        assert_eq!(queues.count(QueueId::Recycle), queues.tokens(QueueId::Recycle).len());
        queues.remove(&mut arena, &mut fault, tok(PoolKind::Input, 2));
        assert_eq!(queues.count(QueueId::Recycle), queues.tokens(QueueId::Recycle).len());
        assert!(!fault.active());
    }
}
