//! `/stream` ticket signing and verification (§6): a short-lived token whose
//! payload binds a session id to the URL parameter it was issued for.
//! HMAC-SHA256 over a compact JSON payload.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("malformed ticket")]
    Malformed,
    #[error("bad ticket signature")]
    BadSignature,
    #[error("ticket expired")]
    Expired,
    #[error("ticket does not match session")]
    SessionMismatch,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct TicketPayload {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "expiresAtMs")]
    expires_at_ms: i64,
}

pub struct TicketSigner {
    key: Vec<u8>,
}

impl TicketSigner {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    /// Issues a ticket for `session_id` valid for `ttl` from `now`. Not
    /// called by the HTTP routes themselves (ticket issuance belongs to
    /// whatever service hands a client the `/stream` URL) but kept alongside
    /// `verify` so the two halves of the scheme stay in lockstep, and used
    /// directly by this module's own tests.
    pub fn issue(&self, session_id: &str, now: chrono::DateTime<chrono::Utc>, ttl: chrono::Duration) -> String {
        let payload = TicketPayload {
            session_id: session_id.to_string(),
            expires_at_ms: (now + ttl).timestamp_millis(),
        };
        let payload_json = serde_json::to_vec(&payload).expect("ticket payload always serializes");
        let payload_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&payload_json);

        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(payload_b64.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        format!("{payload_b64}.{signature}")
    }

    /// Verifies `ticket` was issued by this signer, is unexpired, and names
    /// `expected_session_id` (§6: "payload contains either cloudAgentSessionId
    /// or sessionId equal to the URL parameter").
    pub fn verify(&self, ticket: &str, expected_session_id: &str, now: chrono::DateTime<chrono::Utc>) -> Result<(), TicketError> {
        let (payload_b64, signature_hex) = ticket.split_once('.').ok_or(TicketError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(payload_b64.as_bytes());
        let expected_signature = hex::encode(mac.finalize().into_bytes());
        if !constant_time_eq(expected_signature.as_bytes(), signature_hex.as_bytes()) {
            return Err(TicketError::BadSignature);
        }

        let payload_json = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TicketError::Malformed)?;
        let payload: TicketPayload = serde_json::from_slice(&payload_json).map_err(|_| TicketError::Malformed)?;

        if now.timestamp_millis() > payload.expires_at_ms {
            return Err(TicketError::Expired);
        }
        if payload.session_id != expected_session_id {
            return Err(TicketError::SessionMismatch);
        }
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
