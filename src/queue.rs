//! Request queue.
//!
//! Mutex-protected multi-producer single-consumer queue between the
//! submission side and the coordinator's consumer thread. Entries are
//! ordered by request priority first and arrival order second, so a
//! stronger request may overtake a weaker one here, but two messages of the
//! same priority are always consumed in submission order. That FIFO-within-
//! priority guarantee is what keeps an untune from overtaking the tune it
//! refers to.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

use crate::error::TuneError;
use crate::request::{Handle, Request, RequestPriority};

/// One unit of work for the consumer thread.
#[derive(Debug)]
pub enum WorkItem {
    Tune(Request),
    Untune { handle: Handle },
    Retune { handle: Handle, duration_ms: i64 },
    /// Poison value enqueued at shutdown. Sorts after everything else so the
    /// consumer drains real work, tears down live nodes and exits.
    Stop,
}

const STOP_RANK: u8 = u8::MAX;

struct Entry {
    rank: u8,
    seq: u64,
    item: WorkItem,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: smaller rank (stronger priority) and
        // smaller sequence number must compare greater.
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    capacity: usize,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Producer side: enqueue on behalf of a client. Fails once the
    /// configured capacity is reached; the caller surfaces the failure
    /// upstream and rolls back its bookkeeping.
    pub fn push(&self, priority: RequestPriority, item: WorkItem) -> Result<(), TuneError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.heap.len() >= self.capacity {
            return Err(TuneError::QueueFull);
        }
        Self::push_locked(&mut inner, priority.index() as u8, item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Internal producers (expiry timers, the garbage collector). These
    /// messages only ever shrink coordinator state, so they bypass the
    /// capacity check; dropping them would leak nodes.
    pub fn push_internal(&self, priority: RequestPriority, item: WorkItem) {
        let mut inner = self.inner.lock().unwrap();
        Self::push_locked(&mut inner, priority.index() as u8, item);
        self.not_empty.notify_one();
    }

    /// Enqueues the shutdown poison value.
    pub fn push_stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::push_locked(&mut inner, STOP_RANK, WorkItem::Stop);
        self.not_empty.notify_one();
    }

    fn push_locked(inner: &mut QueueInner, rank: u8, item: WorkItem) {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry { rank, seq, item });
    }

    /// Consumer side: blocks until an item is available.
    pub fn pop(&self) -> WorkItem {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(entry) = inner.heap.pop() {
                return entry.item;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn untune(handle: Handle) -> WorkItem {
        WorkItem::Untune { handle }
    }

    fn popped_handle(queue: &RequestQueue) -> Handle {
        match queue.pop() {
            WorkItem::Untune { handle } => handle,
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn orders_by_priority_then_fifo() {
        let queue = RequestQueue::new(16);
        queue.push(RequestPriority::ThirdPartyLow, untune(1)).unwrap();
        queue.push(RequestPriority::SystemHigh, untune(2)).unwrap();
        queue.push(RequestPriority::SystemHigh, untune(3)).unwrap();
        queue.push(RequestPriority::SystemLow, untune(4)).unwrap();

        assert_eq!(popped_handle(&queue), 2);
        assert_eq!(popped_handle(&queue), 3);
        assert_eq!(popped_handle(&queue), 4);
        assert_eq!(popped_handle(&queue), 1);
    }

    #[test]
    fn stop_sorts_after_pending_work() {
        let queue = RequestQueue::new(16);
        queue.push(RequestPriority::ThirdPartyLow, untune(1)).unwrap();
        queue.push_stop();
        queue.push(RequestPriority::ThirdPartyLow, untune(2)).unwrap();

        assert_eq!(popped_handle(&queue), 1);
        assert_eq!(popped_handle(&queue), 2);
        assert!(matches!(queue.pop(), WorkItem::Stop));
    }

    #[test]
    fn capacity_bounds_client_pushes_only() {
        let queue = RequestQueue::new(2);
        queue.push(RequestPriority::SystemLow, untune(1)).unwrap();
        queue.push(RequestPriority::SystemLow, untune(2)).unwrap();
        assert_eq!(
            queue.push(RequestPriority::SystemLow, untune(3)),
            Err(TuneError::QueueFull)
        );
        // Internal producers are exempt from the cap.
        queue.push_internal(RequestPriority::SystemLow, untune(4));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn pop_blocks_until_push() {
        use std::sync::Arc;
        use std::time::Duration;

        let queue = Arc::new(RequestQueue::new(4));
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(RequestPriority::SystemHigh, untune(9)).unwrap();
        });
        assert_eq!(popped_handle(&queue), 9);
        handle.join().unwrap();
    }
}
