//! Client request model.

use serde::{Deserialize, Serialize};

use crate::client::RawPid;
use crate::config::Config;
use crate::error::TuneError;
use crate::resource::ResourceRegistry;

/// Opaque identifier of an accepted Tune, monotonic and never reused.
pub type Handle = i64;

/// What a submitted message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Tune,
    Retune,
    Untune,
}

impl RequestKind {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(RequestKind::Tune),
            2 => Some(RequestKind::Retune),
            3 => Some(RequestKind::Untune),
            _ => None,
        }
    }
}

/// Client-declared urgency, partitioned by permission class.
///
/// Ordering is the arbitration order: a SystemHigh head always beats a
/// ThirdPartyHigh head for the same resource slot, and so on down. The
/// numeric index doubles as the low bits of the coordinator's secondary
/// slot index, so iterating `all()` walks slots from strongest to weakest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestPriority {
    SystemHigh,
    ThirdPartyHigh,
    SystemLow,
    ThirdPartyLow,
}

impl RequestPriority {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        match self {
            RequestPriority::SystemHigh => 0,
            RequestPriority::ThirdPartyHigh => 1,
            RequestPriority::SystemLow => 2,
            RequestPriority::ThirdPartyLow => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::all().get(index).copied()
    }

    pub fn from_wire(raw: u8) -> Result<Self, TuneError> {
        Self::from_index(raw as usize).ok_or(TuneError::BadPriority(raw))
    }

    /// Strongest first.
    pub fn all() -> [RequestPriority; Self::COUNT] {
        [
            RequestPriority::SystemHigh,
            RequestPriority::ThirdPartyHigh,
            RequestPriority::SystemLow,
            RequestPriority::ThirdPartyLow,
        ]
    }

    /// Whether this priority is reserved for system-level clients.
    pub fn is_system(self) -> bool {
        matches!(
            self,
            RequestPriority::SystemHigh | RequestPriority::SystemLow
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            RequestPriority::SystemHigh => "system-high",
            RequestPriority::ThirdPartyHigh => "third-party-high",
            RequestPriority::SystemLow => "system-low",
            RequestPriority::ThirdPartyLow => "third-party-low",
        }
    }
}

/// One `(resource, sub-target, value)` triple of a Tune request. The
/// sub-index is a logical core/cluster/cgroup selector; it is translated to
/// a physical target when the coordinator inserts the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTuple {
    pub code: u32,
    pub sub_index: u32,
    pub value: i32,
}

/// An accepted Tune in flight. Owned by the coordinator once the consumer
/// picks it up; everything else refers to it by handle only.
#[derive(Debug, Clone)]
pub struct Request {
    pub handle: Handle,
    pub client_pid: RawPid,
    pub client_tid: RawPid,
    pub priority: RequestPriority,
    pub duration_ms: i64,
    pub resources: Vec<ResourceTuple>,
}

/// Validates the tunable payload of a Tune request against the registry and
/// the configured limits. Runs before any state is touched, so a rejected
/// request leaves no trace.
pub fn validate_tune(
    config: &Config,
    registry: &ResourceRegistry,
    duration_ms: i64,
    resources: &[ResourceTuple],
) -> Result<(), TuneError> {
    if duration_ms < 0 || duration_ms > config.max_request_duration_ms {
        return Err(TuneError::BadDuration(duration_ms));
    }
    if resources.is_empty() || resources.len() > config.max_resources_per_request {
        return Err(TuneError::TooManyResources(resources.len()));
    }
    for tuple in resources {
        let desc = registry
            .lookup(tuple.code)
            .ok_or(TuneError::UnknownResource(tuple.code))?;
        if tuple.value < desc.low || tuple.value > desc.high {
            return Err(TuneError::ValueOutOfBounds {
                code: tuple.code,
                value: tuple.value,
                low: desc.low,
                high: desc.high,
            });
        }
    }
    Ok(())
}
