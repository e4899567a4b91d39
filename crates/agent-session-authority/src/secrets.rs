//! `SecretsDecryptor` (§3 `encryptedSecrets`, §4.5 step 2): envelope
//! decryption is owned by a KMS integration this workspace does not carry
//! (§1) — the same narrow-seam treatment as [`crate::external_queue`] and
//! [`crate::backend_link`] for other out-of-scope collaborators.

use std::collections::HashMap;

use agent_session_types::SessionResult;
use async_trait::async_trait;

#[async_trait]
pub trait SecretsDecryptor: Send + Sync {
    async fn decrypt_all(&self, encrypted: &HashMap<String, String>) -> SessionResult<HashMap<String, String>>;
}

/// Treats stored ciphertext as already-plaintext. Stands in for a real KMS
/// client until one is wired in; callers that never populate
/// `encryptedSecrets` are unaffected either way.
pub struct IdentitySecretsDecryptor;

#[async_trait]
impl SecretsDecryptor for IdentitySecretsDecryptor {
    async fn decrypt_all(&self, encrypted: &HashMap<String, String>) -> SessionResult<HashMap<String, String>> {
        Ok(encrypted.clone())
    }
}

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fake {
    use super::*;

    /// Appends a fixed suffix so tests can assert decryption ran.
    pub struct FakeSecretsDecryptor;

    #[async_trait]
    impl SecretsDecryptor for FakeSecretsDecryptor {
        async fn decrypt_all(&self, encrypted: &HashMap<String, String>) -> SessionResult<HashMap<String, String>> {
            Ok(encrypted
                .iter()
                .map(|(k, v)| (k.clone(), format!("{v}-decrypted")))
                .collect())
        }
    }
}
