//! Newtype identifiers threaded through every crate in the workspace.
//!
//! Kept as thin `String` wrappers (not UUID-typed) because the wire format
//! mandates specific prefixes (`agent_...`, sandbox ids, etc.) that a generic
//! UUID type cannot express.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(SessionId);
string_id!(ExecutionId);
string_id!(UserId);
string_id!(OrgId);
string_id!(BotId);
string_id!(LeaseId);
string_id!(SandboxId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_inner_string() {
        let id = SessionId::from("agent_abc123");
        assert_eq!(id.to_string(), "agent_abc123");
        assert_eq!(id.as_str(), "agent_abc123");
    }

    #[test]
    fn serializes_as_bare_string() {
        let id = ExecutionId::from("exec-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"exec-1\"");
    }
}
