//! Command queue rows (§3 `QueueEntry`, §4.4).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ExecutionId, SessionId};

/// Queue rows expire one hour after creation (§3).
pub const QUEUE_ENTRY_TTL: Duration = Duration::hours(1);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: i64,
    pub session_id: SessionId,
    pub execution_id: ExecutionId,
    pub message_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > QUEUE_ENTRY_TTL
    }
}

/// Maximum simultaneous queue depth per session (§4.6, scenario 3).
pub const MAX_QUEUE_DEPTH: usize = 3;

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_at(created_at: DateTime<Utc>) -> QueueEntry {
        QueueEntry {
            id: 1,
            session_id: SessionId::from("s1"),
            execution_id: ExecutionId::from("e1"),
            message_json: serde_json::json!({}),
            created_at,
        }
    }

    #[test]
    fn expires_after_one_hour() {
        let created = Utc::now() - Duration::minutes(61);
        assert!(entry_at(created).is_expired(Utc::now()));
    }

    #[test]
    fn not_expired_within_the_hour() {
        let created = Utc::now() - Duration::minutes(30);
        assert!(!entry_at(created).is_expired(Utc::now()));
    }
}
