//! Client liveness monitor.
//!
//! A daemon thread wakes on a fixed period, snapshots the set of tracked
//! client PIDs and checks each against the OS. Clients that died without
//! untuning are handed to the garbage collector; nothing is mutated here
//! beyond that handoff.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::Sender;
use log::{debug, info};

use crate::client::{ClientDataManager, RawPid};
use crate::Shutdown;

/// Decides whether a PID is still alive. The production probe stats the
/// process entry under /proc; tests substitute their own.
pub type LivenessProbe = Arc<dyn Fn(RawPid) -> bool + Send + Sync>;

pub fn proc_liveness_probe() -> LivenessProbe {
    Arc::new(|pid| PathBuf::from(format!("/proc/{pid}")).exists())
}

pub struct PulseMonitor {
    thread: Option<JoinHandle<()>>,
}

impl PulseMonitor {
    pub fn start(
        cdm: Arc<ClientDataManager>,
        reaper: Sender<RawPid>,
        period: Duration,
        probe: LivenessProbe,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let thread = std::thread::spawn(move || {
            info!("Pulse monitor running every {:?}", period);
            while !shutdown.wait_timeout(period) {
                for pid in cdm.active_pids() {
                    if !(probe)(pid) {
                        debug!("Client {} is gone, nominating for cleanup", pid);
                        // The receiver only disappears at shutdown.
                        let _ = reaper.send(pid);
                    }
                }
            }
        });
        Self {
            thread: Some(thread),
        }
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
