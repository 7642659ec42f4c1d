//! Request expiry timers.
//!
//! One service thread owns a min-heap of pending deadlines. Expiry never
//! mutates coordinator state directly: the callback wired in at startup
//! submits a synthetic untune through the request queue, so "what is
//! applied right now" stays a function of the serialized work stream.
//!
//! Re-arming and cancellation are epoch-based: each handle carries a
//! generation counter and a popped deadline whose generation is stale is
//! simply dropped. That makes cancel idempotent and lets retune shorten or
//! extend a pending deadline without hunting through the heap.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::debug;

use crate::request::Handle;

struct Deadline {
    at: Instant,
    epoch: u64,
    handle: Handle,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.epoch == other.epoch && self.handle == other.handle
    }
}

impl Eq for Deadline {}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: the max-heap must surface the earliest deadline.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.handle.cmp(&self.handle))
            .then_with(|| other.epoch.cmp(&self.epoch))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TimerState {
    heap: BinaryHeap<Deadline>,
    epochs: HashMap<Handle, u64>,
    // Never reused, even across cancel/re-arm cycles of the same handle, so
    // a stale heap entry can never match a fresh arming.
    next_epoch: u64,
    stop: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cv: Condvar,
}

pub struct TimerService {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Spawns the service thread. `on_expire` runs on that thread with no
    /// internal lock held; it must not block for long.
    pub fn start(on_expire: impl Fn(Handle) + Send + 'static) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                epochs: HashMap::new(),
                next_epoch: 0,
                stop: false,
            }),
            cv: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let thread = std::thread::spawn(move || Self::run(&worker, on_expire));

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    fn run(shared: &TimerShared, on_expire: impl Fn(Handle)) {
        let mut state = shared.state.lock().unwrap();
        loop {
            if state.stop {
                break;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            while state.heap.peek().is_some_and(|head| head.at <= now) {
                let Some(deadline) = state.heap.pop() else { break };
                // Stale generation: the handle was cancelled or re-armed
                // after this entry was pushed.
                if state.epochs.get(&deadline.handle) == Some(&deadline.epoch) {
                    state.epochs.remove(&deadline.handle);
                    due.push(deadline.handle);
                }
            }

            if !due.is_empty() {
                drop(state);
                for handle in due {
                    debug!("Request {} expired", handle);
                    on_expire(handle);
                }
                state = shared.state.lock().unwrap();
                continue;
            }

            state = match state.heap.peek() {
                Some(head) => {
                    let wait = head.at.saturating_duration_since(now);
                    shared.cv.wait_timeout(state, wait).unwrap().0
                }
                None => shared.cv.wait(state).unwrap(),
            };
        }
    }

    /// Arms (or re-arms) the expiry for a handle. A later call supersedes
    /// any pending deadline, whether it shortens or extends it.
    pub fn arm(&self, handle: Handle, duration: Duration) {
        let mut state = self.shared.state.lock().unwrap();
        let epoch = state.next_epoch;
        state.next_epoch += 1;
        state.epochs.insert(handle, epoch);
        state.heap.push(Deadline {
            at: Instant::now() + duration,
            epoch,
            handle,
        });
        self.shared.cv.notify_one();
    }

    /// Cancels any pending expiry for the handle. Idempotent; a fire racing
    /// the cancel is dropped by the generation check.
    pub fn cancel(&self, handle: Handle) {
        let mut state = self.shared.state.lock().unwrap();
        state.epochs.remove(&handle);
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().epochs.len()
    }

    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
            self.shared.cv.notify_all();
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_in_deadline_order() {
        let (tx, rx) = mpsc::channel();
        let timers = TimerService::start(move |h| {
            let _ = tx.send(h);
        });

        timers.arm(2, Duration::from_millis(60));
        timers.arm(1, Duration::from_millis(20));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn cancel_suppresses_fire() {
        let (tx, rx) = mpsc::channel();
        let timers = TimerService::start(move |h| {
            let _ = tx.send(h);
        });

        timers.arm(7, Duration::from_millis(30));
        timers.cancel(7);
        timers.cancel(7); // idempotent

        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }

    #[test]
    fn rearm_supersedes_pending_deadline() {
        let (tx, rx) = mpsc::channel();
        let timers = TimerService::start(move |h| {
            let _ = tx.send((h, Instant::now()));
        });

        let armed_at = Instant::now();
        timers.arm(3, Duration::from_millis(500));
        // Shorten: the stale 500 ms entry must not fire a second time.
        timers.arm(3, Duration::from_millis(40));

        let (handle, fired_at) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(handle, 3);
        assert!(fired_at.duration_since(armed_at) < Duration::from_millis(400));
        assert!(rx.recv_timeout(Duration::from_millis(600)).is_err());
    }
}
