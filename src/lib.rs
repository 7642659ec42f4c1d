//! restuned: a user-space daemon that arbitrates concurrent client requests
//! to tune system resources (CPU governors, scheduler knobs, cgroup
//! controllers, generic sysfs nodes).
//!
//! Clients send short-lived tune/retune/untune requests; the server
//! decides, per resource sub-target, which value is applied right now,
//! honoring both the resource's policy and the request's priority, and
//! automatically reverts changes when requests expire or clients die.
//!
//! The [`server::Server`] is the root object: it owns the resource and
//! target registries, the client table, the admission gates, the work
//! queue, the coordinator and the background threads (consumer, expiry
//! timers, pulse monitor, garbage collector). Embedders feed it requests
//! through [`server::Server::submit_tune`] and friends; the bundled binary
//! wires it to a static config and waits for SIGINT.

pub mod client;
pub mod coco;
pub mod config;
pub mod error;
pub mod gc;
pub mod hooks;
pub mod pulse;
pub mod queue;
pub mod ratelimit;
pub mod request;
pub mod resource;
pub mod server;
pub mod target;
pub mod timer;

pub use client::{ClientDataManager, RawPid};
pub use config::Config;
pub use error::TuneError;
pub use request::{Handle, RequestKind, RequestPriority, ResourceTuple};
pub use resource::{ApplyType, PermissionClass, Policy, ResourceBuilder, ResourceRegistry};
pub use server::{ClientContext, Server};
pub use target::TargetRegistry;

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// One-shot stop flag shared by the periodic worker threads. Triggering it
/// wakes every sleeper immediately instead of letting it ride out its tick.
pub struct Shutdown {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn trigger(&self) {
        let mut stopped = self.stopped.lock().unwrap();
        *stopped = true;
        self.cv.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock().unwrap()
    }

    /// Blocks until triggered.
    pub fn wait(&self) {
        let mut stopped = self.stopped.lock().unwrap();
        while !*stopped {
            stopped = self.cv.wait(stopped).unwrap();
        }
    }

    /// Sleeps for one tick, returning early if triggered. Returns whether
    /// the flag is set, so periodic loops read `while !shutdown.wait_timeout(p)`.
    pub fn wait_timeout(&self, period: Duration) -> bool {
        let deadline = std::time::Instant::now() + period;
        let mut stopped = self.stopped.lock().unwrap();
        loop {
            if *stopped {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cv.wait_timeout(stopped, deadline - now).unwrap();
            stopped = guard;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
