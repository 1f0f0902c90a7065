//! Release-time-ordered queue of delayed packets
//!
//! A min-heap keyed on release time, bounded at 2 MiB per queue. On
//! overflow the head (soonest release) is dropped until the new payload
//! fits. Packets record the profile version active when they were
//! decided; queued bytes are never re-evaluated after a profile change.
//!
//! Because release time is `now + delay` at decision time, a later packet
//! with a smaller delay can overtake an earlier one — that swap is the
//! intended reorder fault.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio::time::Instant;

use crate::types::Direction;

/// A payload waiting for its release time
#[derive(Debug, Clone)]
pub struct DelayedPacket {
    pub payload: Vec<u8>,
    pub release_time: Instant,
    pub packet_seq: u64,
    /// Profile version active when the delay was decided
    pub profile_version: u32,
    pub direction: Direction,
    /// Insertion order, breaks release-time ties
    order: u64,
}

impl PartialEq for DelayedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.order == other.order
    }
}

impl Eq for DelayedPacket {}

impl PartialOrd for DelayedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release_time
            .cmp(&other.release_time)
            .then(self.order.cmp(&other.order))
    }
}

/// Bounded min-heap of delayed packets
pub struct DelayQueue {
    heap: BinaryHeap<Reverse<DelayedPacket>>,
    total_bytes: usize,
    next_order: u64,
}

impl DelayQueue {
    /// 2 MiB per direction
    pub const MAX_BYTES: usize = 2 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            total_bytes: 0,
            next_order: 0,
        }
    }

    /// Enqueue a payload for release at `release_time`
    ///
    /// Head-drops until the payload fits; returns false (payload not
    /// queued) only when a single payload exceeds the queue limit.
    pub fn push(
        &mut self,
        payload: Vec<u8>,
        release_time: Instant,
        packet_seq: u64,
        profile_version: u32,
        direction: Direction,
    ) -> bool {
        let payload_size = payload.len();

        while self.total_bytes + payload_size > Self::MAX_BYTES && !self.heap.is_empty() {
            self.drop_head();
        }

        if payload_size > Self::MAX_BYTES {
            return false;
        }

        let order = self.next_order;
        self.next_order += 1;

        self.total_bytes += payload_size;
        self.heap.push(Reverse(DelayedPacket {
            payload,
            release_time,
            packet_seq,
            profile_version,
            direction,
            order,
        }));
        true
    }

    /// Whether the head packet is due
    pub fn has_ready(&self, now: Instant) -> bool {
        matches!(self.heap.peek(), Some(Reverse(pkt)) if pkt.release_time <= now)
    }

    /// Pop the head iff its release time has passed
    pub fn pop_ready(&mut self, now: Instant) -> Option<DelayedPacket> {
        match self.heap.peek() {
            Some(Reverse(pkt)) if pkt.release_time <= now => {}
            _ => return None,
        }
        let Reverse(pkt) = self.heap.pop()?;
        self.total_bytes -= pkt.payload.len();
        Some(pkt)
    }

    /// Release time of the head, for timer arming
    pub fn next_release_time(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(pkt)| pkt.release_time)
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.total_bytes = 0;
    }

    fn drop_head(&mut self) {
        if let Some(Reverse(pkt)) = self.heap.pop() {
            self.total_bytes -= pkt.payload.len();
        }
    }
}

impl Default for DelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const DIR: Direction = Direction::ClientToServer;

    #[test]
    fn test_pop_in_release_time_order() {
        let mut q = DelayQueue::new();
        let now = Instant::now();
        q.push(vec![1], now + Duration::from_millis(300), 1, 1, DIR);
        q.push(vec![2], now + Duration::from_millis(100), 2, 1, DIR);
        q.push(vec![3], now + Duration::from_millis(200), 3, 1, DIR);

        let later = now + Duration::from_millis(400);
        assert_eq!(q.pop_ready(later).unwrap().payload, vec![2]);
        assert_eq!(q.pop_ready(later).unwrap().payload, vec![3]);
        assert_eq!(q.pop_ready(later).unwrap().payload, vec![1]);
        assert!(q.pop_ready(later).is_none());
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let mut q = DelayQueue::new();
        let release = Instant::now() + Duration::from_millis(50);
        q.push(vec![1], release, 1, 1, DIR);
        q.push(vec![2], release, 2, 1, DIR);
        q.push(vec![3], release, 3, 1, DIR);

        let later = release + Duration::from_millis(10);
        assert_eq!(q.pop_ready(later).unwrap().payload, vec![1]);
        assert_eq!(q.pop_ready(later).unwrap().payload, vec![2]);
        assert_eq!(q.pop_ready(later).unwrap().payload, vec![3]);
    }

    #[test]
    fn test_pop_ready_respects_release_time() {
        let mut q = DelayQueue::new();
        let now = Instant::now();
        q.push(vec![1], now + Duration::from_secs(10), 1, 1, DIR);
        assert!(!q.has_ready(now));
        assert!(q.pop_ready(now).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_overflow_drops_head_first() {
        let mut q = DelayQueue::new();
        let now = Instant::now();
        let half = vec![0u8; DelayQueue::MAX_BYTES / 2];
        assert!(q.push(half.clone(), now + Duration::from_millis(10), 1, 1, DIR));
        assert!(q.push(half.clone(), now + Duration::from_millis(20), 2, 1, DIR));
        assert_eq!(q.total_bytes(), DelayQueue::MAX_BYTES);

        // one more byte forces the soonest-release entry out
        assert!(q.push(vec![0xff], now + Duration::from_millis(30), 3, 1, DIR));
        assert!(q.total_bytes() <= DelayQueue::MAX_BYTES);
        assert_eq!(q.len(), 2);

        let later = now + Duration::from_secs(1);
        // seq 1 was shed; seq 2 survives
        assert_eq!(q.pop_ready(later).unwrap().packet_seq, 2);
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let mut q = DelayQueue::new();
        let now = Instant::now();
        q.push(vec![1, 2, 3], now, 1, 1, DIR);
        let giant = vec![0u8; DelayQueue::MAX_BYTES + 1];
        assert!(!q.push(giant, now, 2, 1, DIR));
        // the fitting entries were shed in the attempt, but accounting holds
        assert_eq!(q.total_bytes(), 0);
    }

    #[test]
    fn test_next_release_time_tracks_head() {
        let mut q = DelayQueue::new();
        assert!(q.next_release_time().is_none());
        let now = Instant::now();
        let early = now + Duration::from_millis(10);
        q.push(vec![1], now + Duration::from_millis(99), 1, 1, DIR);
        q.push(vec![2], early, 2, 1, DIR);
        assert_eq!(q.next_release_time(), Some(early));
    }

    #[test]
    fn test_profile_version_is_preserved() {
        let mut q = DelayQueue::new();
        let now = Instant::now();
        q.push(vec![1], now, 7, 42, DIR);
        let pkt = q.pop_ready(now).unwrap();
        assert_eq!(pkt.profile_version, 42);
        assert_eq!(pkt.direction, DIR);
    }

    #[test]
    fn test_total_bytes_accounting() {
        let mut q = DelayQueue::new();
        let now = Instant::now();
        q.push(vec![0; 100], now, 1, 1, DIR);
        q.push(vec![0; 50], now, 2, 1, DIR);
        assert_eq!(q.total_bytes(), 150);
        q.pop_ready(now);
        assert_eq!(q.total_bytes(), 50);
        q.clear();
        assert_eq!(q.total_bytes(), 0);
        assert!(q.is_empty());
    }
}
