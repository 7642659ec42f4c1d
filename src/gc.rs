//! Dead-client garbage collector.
//!
//! Consumes the PIDs nominated by the pulse monitor and dismantles what
//! they left behind: every outstanding handle gets a synthetic untune
//! through the request queue (so ordering and coordinator invariants hold),
//! and once the handles have drained the client tracking entries are
//! erased. Cleanup is bounded per tick; PIDs that cannot finish are pushed
//! back to the tail for the next round. The period is deliberately coprime
//! with the pulse period so the two sweeps do not synchronize.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::Receiver;
use log::{debug, info};

use crate::client::{ClientDataManager, RawPid};
use crate::request::{Handle, RequestPriority};
use crate::Shutdown;

/// Sink for the synthetic untunes the collector emits. Wired to
/// `RequestQueue::push_internal` by the server; rate limiting is bypassed
/// on purpose, a dead client cannot be penalized into compliance.
pub type UntuneSink = Arc<dyn Fn(Handle, RequestPriority) + Send + Sync>;

pub struct ClientGarbageCollector {
    thread: Option<JoinHandle<()>>,
}

impl ClientGarbageCollector {
    pub fn start(
        cdm: Arc<ClientDataManager>,
        nominations: Receiver<RawPid>,
        untune: UntuneSink,
        period: Duration,
        batch_cap: usize,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let thread = std::thread::spawn(move || {
            info!(
                "Client garbage collector running every {:?}, batch cap {}",
                period, batch_cap
            );
            // FIFO of PIDs awaiting cleanup; the set keeps each PID queued
            // at most once however often the pulse monitor renominates it.
            let mut pending: VecDeque<RawPid> = VecDeque::new();
            let mut queued: HashSet<RawPid> = HashSet::new();

            while !shutdown.wait_timeout(period) {
                for pid in nominations.try_iter() {
                    if queued.insert(pid) {
                        pending.push_back(pid);
                    }
                }

                for _ in 0..batch_cap {
                    let Some(pid) = pending.pop_front() else { break };
                    if Self::collect_one(&cdm, &untune, pid) {
                        queued.remove(&pid);
                    } else {
                        // Handles still draining through the queue; finish
                        // this client on a later tick.
                        pending.push_back(pid);
                    }
                }
            }
        });
        Self {
            thread: Some(thread),
        }
    }

    /// Attempts to fully clean one dead client. Returns true when its
    /// tracking entries are gone.
    fn collect_one(cdm: &ClientDataManager, untune: &UntuneSink, pid: RawPid) -> bool {
        let tids = cdm.threads_of(pid);
        let mut outstanding = 0;
        for tid in &tids {
            for (handle, priority) in cdm.handles_with_priority(*tid) {
                outstanding += 1;
                // Idempotent: resubmitting for a handle already queued is a
                // no-op once the consumer gets there.
                (untune)(handle, priority);
            }
        }

        if outstanding > 0 {
            debug!(
                "Client {}: {} handles still draining, requeueing",
                pid, outstanding
            );
            return false;
        }

        for tid in tids {
            cdm.delete_tid(tid);
        }
        cdm.delete_pid(pid);
        info!("Cleaned up dead client {}", pid);
        true
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
