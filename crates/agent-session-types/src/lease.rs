//! Lease records (§3 `Lease`, §4.3) — dedups concurrent consumers of one
//! enqueued execution message.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ExecutionId, LeaseId};

/// Default lease lifetime before it must be renewed by heartbeat.
pub const DEFAULT_LEASE_TTL: Duration = Duration::seconds(30);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub execution_id: ExecutionId,
    pub lease_id: LeaseId,
    pub expires_at: DateTime<Utc>,
    pub message_id: Option<String>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
