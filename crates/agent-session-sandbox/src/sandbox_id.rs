//! Deterministic sandbox identifier (§4.6, §6).

use sha2::{Digest, Sha256};

/// `<prefix>-<48 lowercase hex>`, 52 characters total.
///
/// Prefix selects which identity axes are present: `org` (org only), `bot`
/// (org + bot), `usr` (personal, no bot), `ubt` (personal + bot).
pub fn generate_sandbox_id(org_id: Option<&str>, user_id: &str, bot_id: Option<&str>) -> String {
    let prefix = match (org_id, bot_id) {
        (Some(_), Some(_)) => "bot",
        (Some(_), None) => "org",
        (None, Some(_)) => "ubt",
        (None, None) => "usr",
    };

    let mut hasher = Sha256::new();
    hasher.update(org_id.unwrap_or(""));
    hasher.update(b"\0");
    hasher.update(user_id);
    hasher.update(b"\0");
    hasher.update(bot_id.unwrap_or(""));
    let digest = hasher.finalize();

    format!("{prefix}-{}", &hex::encode(digest)[..48])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_prefix_by_identity_axes() {
        assert!(generate_sandbox_id(Some("org1"), "user1", None).starts_with("org-"));
        assert!(generate_sandbox_id(Some("org1"), "user1", Some("bot1")).starts_with("bot-"));
        assert!(generate_sandbox_id(None, "user1", None).starts_with("usr-"));
        assert!(generate_sandbox_id(None, "user1", Some("bot1")).starts_with("ubt-"));
    }

    #[test]
    fn total_length_is_52() {
        let id = generate_sandbox_id(Some("org1"), "user1", Some("bot1"));
        assert_eq!(id.len(), 52);
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let a = generate_sandbox_id(Some("org1"), "user1", Some("bot1"));
        let b = generate_sandbox_id(Some("org1"), "user1", Some("bot1"));
        assert_eq!(a, b);
    }

    #[test]
    fn differs_when_any_input_changes() {
        let base = generate_sandbox_id(Some("org1"), "user1", Some("bot1"));
        assert_ne!(base, generate_sandbox_id(Some("org2"), "user1", Some("bot1")));
        assert_ne!(base, generate_sandbox_id(Some("org1"), "user2", Some("bot1")));
        assert_ne!(base, generate_sandbox_id(Some("org1"), "user1", Some("bot2")));
    }
}
