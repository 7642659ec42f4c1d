//! Error taxonomy for request submission.
//!
//! Every rejection a client can observe maps to a stable negative wire code,
//! mirroring the reply convention of the RPC layer: a successful Tune returns
//! a positive handle, everything else returns one of the codes below.
//! Transient sysfs failures are handled inside the coordinator (the failed
//! node is dropped and the slot repaired) and never surface here.

use crate::request::Handle;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TuneError {
    #[error("unknown resource code {0:#010x}")]
    UnknownResource(u32),

    #[error("value {value} outside [{low}, {high}] for resource {code:#010x}")]
    ValueOutOfBounds { code: u32, value: i32, low: i32, high: i32 },

    #[error("resource count {0} outside the accepted range")]
    TooManyResources(usize),

    #[error("bad request duration {0} ms")]
    BadDuration(i64),

    #[error("unrecognized priority value {0}")]
    BadPriority(u8),

    #[error("no active request with handle {0}")]
    UnknownHandle(Handle),

    #[error("client health exhausted, request dropped")]
    RateLimitDenied,

    #[error("global concurrent request cap reached")]
    GlobalCapacityExceeded,

    #[error("client lacks the permission level required for this request")]
    PermissionDenied,

    #[error("per-process thread cap reached")]
    TooManyThreads,

    #[error("request queue is full")]
    QueueFull,
}

impl TuneError {
    /// Stable negative code returned on the wire in place of a handle.
    pub fn wire_code(&self) -> i64 {
        match self {
            TuneError::UnknownResource(_) => -2,
            TuneError::ValueOutOfBounds { .. } => -3,
            TuneError::TooManyResources(_) => -4,
            TuneError::BadDuration(_) => -5,
            TuneError::BadPriority(_) => -6,
            TuneError::UnknownHandle(_) => -7,
            TuneError::RateLimitDenied => -8,
            TuneError::GlobalCapacityExceeded => -9,
            TuneError::PermissionDenied => -10,
            TuneError::TooManyThreads => -11,
            TuneError::QueueFull => -12,
        }
    }
}
