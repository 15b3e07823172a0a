use callbridge::IceCandidate;
use std::collections::VecDeque;

/// Remote ICE candidates that arrived before the remote description was
/// applied. Kept in arrival order, no deduplication.
#[derive(Debug, Default, Clone)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Remove and return every queued candidate, oldest first.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_keeps_arrival_order_and_empties() {
        let mut queue = IceCandidateQueue::new();
        for c in ["c1", "c2", "c3", "c2"] {
            queue.push(IceCandidate::new(c));
        }
        assert_eq!(queue.len(), 4);

        let drained: Vec<_> = queue.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, vec!["c1", "c2", "c3", "c2"]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }
}
