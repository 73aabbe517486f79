//! Errors from the cipher, the credential store and the audit log.

use ledgerlink_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// `ring` refused to seal.
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// The authentication tag did not verify: wrong key or tampered data.
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// The ciphertext is not `iv:tag:ciphertext` in hex.
    #[error("malformed ciphertext: {reason}")]
    MalformedCiphertext { reason: String },

    /// Key derivation failed (e.g. empty application secret).
    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    #[error("no stored credential for {provider}")]
    CredentialNotFound { provider: String },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Credential metadata is not a JSON object.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// RNG failure or a corrupt status column.
    #[error("internal vault error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Whether this error means stored ciphertext could not be trusted.
    pub fn is_decryption_failure(&self) -> bool {
        matches!(
            self,
            Self::DecryptionFailed { .. } | Self::MalformedCiphertext { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
