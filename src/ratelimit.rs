//! Admission control.
//!
//! Two independent gates run before a request is queued. The per-client
//! gate tracks a health score per thread: requests spaced closer than the
//! configured delta are penalized, well-spaced ones are rewarded, and a
//! thread whose health hits zero is dropped until rewards lift it back
//! above. The global gate caps the number of requests concurrently active
//! across all clients. Neither gate touches coordinator state, so a denied
//! request leaves nothing to roll back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::client::{ClientDataManager, RawPid};
use crate::error::TuneError;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub struct RateLimiter {
    cdm: Arc<ClientDataManager>,
    active: AtomicUsize,
    delta_ms: i64,
    penalty_factor: f64,
    reward_factor: f64,
    max_concurrent: usize,
}

impl RateLimiter {
    pub fn new(
        cdm: Arc<ClientDataManager>,
        delta_ms: i64,
        penalty_factor: f64,
        reward_factor: f64,
        max_concurrent: usize,
    ) -> Self {
        Self {
            cdm,
            active: AtomicUsize::new(0),
            delta_ms,
            penalty_factor,
            reward_factor,
            max_concurrent,
        }
    }

    /// Per-client admission event. Updates the thread's health and last
    /// request timestamp, then accepts iff the resulting health is strictly
    /// positive.
    pub fn admit(&self, tid: RawPid) -> Result<(), TuneError> {
        self.admit_at(tid, now_ms())
    }

    /// Same as [`admit`](Self::admit) with an explicit clock, so the
    /// reward/penalty arithmetic is testable without sleeping.
    pub fn admit_at(&self, tid: RawPid, now_ms: i64) -> Result<(), TuneError> {
        let delta_ms = self.delta_ms;
        let penalty = self.penalty_factor;
        let reward = self.reward_factor;

        let health = self
            .cdm
            .with_tid_mut(tid, |data| {
                let first_contact = data.last_request_ms == 0;
                let delta = now_ms - data.last_request_ms;
                if !first_contact && delta < delta_ms {
                    data.health -= penalty;
                } else {
                    data.health += reward;
                }
                data.health = data.health.clamp(0.0, 100.0);
                data.last_request_ms = now_ms;
                data.health
            })
            .ok_or(TuneError::RateLimitDenied)?;

        if health > 0.0 {
            Ok(())
        } else {
            debug!("Dropping request from tid {}: health exhausted", tid);
            Err(TuneError::RateLimitDenied)
        }
    }

    /// Global admission event: reject once the concurrent active request
    /// count reaches the configured cap.
    pub fn admit_global(&self) -> Result<(), TuneError> {
        if self.active.load(Ordering::Relaxed) >= self.max_concurrent {
            return Err(TuneError::GlobalCapacityExceeded);
        }
        Ok(())
    }

    pub fn on_request_accepted(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_request_retired(&self) {
        let prev = self.active.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "active request counter underflow");
    }

    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}
