use std::net::IpAddr;

use crate::catalogue::{ModuleKind, TestId};

/// Seconds a cached DNS answer, positive or negative, stays fresh.
pub const DNS_CACHE_TTL: i64 = 3600;

/// Marker stored in place of an address when a lookup failed.
pub const NEGATIVE_MARKER: &str = "-";

/// One row of the `schedule` relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub id: TestId,
    pub location: Option<String>,
    pub test_type: String,
    pub source_ip: Option<String>,
    pub timeout_secs: i64,
    pub interval_secs: i64,
    /// Unix time the test last ran; 0 when it never has.
    pub due: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// A cached lookup; `address == None` is a remembered failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedLookup {
    pub address: Option<IpAddr>,
    pub updated: i64,
}

impl CachedLookup {
    pub fn is_fresh(&self, now: i64) -> bool {
        now - self.updated < DNS_CACHE_TTL
    }
}

/// A helper-backed test waiting for its module to pick it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleQueueItem {
    pub id: Option<i64>,
    pub module: ModuleKind,
    pub test: TestId,
    pub location: Option<String>,
    pub queued_at: i64,
}
