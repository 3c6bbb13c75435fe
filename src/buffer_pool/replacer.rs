use core::fmt::Debug;

use priority_queue::PriorityQueue;

use super::FrameId;

pub(super) trait Replacer: Send + Sync + Debug {
    /// Remove and return the least-recently-unpinned frame, if any.
    fn victim(&mut self) -> Option<FrameId>;
    /// Take a frame out of the candidate set. No-op when absent, so
    /// callers never have to check membership first.
    fn pin(&mut self, frame_id: FrameId);
    /// Add a frame at the most-recently-used end. Unpinning a frame that
    /// is already a candidate does NOT refresh its position.
    fn unpin(&mut self, frame_id: FrameId);
    fn size(&self) -> usize;
    #[cfg(test)]
    fn peek(&self) -> Option<FrameId>;
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Debug)]
pub(super) struct LRU {
    timestamp: i64,
    /// Max-heap over negated unpin timestamps, so the top is the frame
    /// whose unpin is the oldest.
    heap: PriorityQueue<FrameId, i64>,
}

impl LRU {
    pub fn new(size: usize) -> Self {
        Self {
            timestamp: 0,
            heap: PriorityQueue::with_capacity(size),
        }
    }
}

impl Replacer for LRU {
    fn victim(&mut self) -> Option<FrameId> {
        self.heap.pop().map(|(frame_id, _)| frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        self.heap.remove(&frame_id);
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if self.heap.get(&frame_id).is_none() {
            self.timestamp += 1;
            self.heap.push(frame_id, -self.timestamp);
        }
    }

    fn size(&self) -> usize {
        self.heap.len()
    }

    #[cfg(test)]
    fn peek(&self) -> Option<FrameId> {
        self.heap.peek().map(|(frame_id, _)| *frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_in_unpin_order() {
        let mut replacer = LRU::new(4);
        replacer.unpin(2);
        replacer.unpin(0);
        replacer.unpin(3);

        assert_eq!(replacer.size(), 3);
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(0));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_reunpin_does_not_move() {
        let mut replacer = LRU::new(3);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(1); // already a candidate, keeps its slot

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
    }

    #[test]
    fn test_pin_removes_candidate() {
        let mut replacer = LRU::new(3);
        replacer.unpin(1);
        replacer.unpin(2);

        replacer.pin(1);
        // pinning a frame that is not a candidate is a no-op
        replacer.pin(7);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.peek(), Some(2));

        // a later unpin makes the frame the youngest candidate again
        replacer.unpin(1);
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(1));
    }
}
