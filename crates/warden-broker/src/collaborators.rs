//! External collaborator interfaces.
//!
//! The broker never holds keys, talks to chains, or builds transactions; it
//! calls into these traits. Implementations live outside this crate (the
//! in-memory ones in [`crate::testing`] back the tests and the dev daemon).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use warden_settings::SettingsStore;

use crate::errors::BrokerError;

/// Failure reported by a collaborator.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    /// Password did not decrypt the keyring.
    #[error("invalid password")]
    InvalidPassword,
    /// Operation needs an unlocked keyring.
    #[error("keyring is locked")]
    Locked,
    /// Referenced account, chain, or record does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// Anything else.
    #[error("{0}")]
    Failed(String),
}

impl From<CollaboratorError> for BrokerError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::InvalidPassword => Self::LockPolicy {
                message: err.to_string(),
            },
            CollaboratorError::Locked => Self::NotAvailable {
                message: err.to_string(),
            },
            CollaboratorError::NotFound(what) => Self::NotFound {
                what: "record",
                id: what,
            },
            CollaboratorError::Failed(message) => Self::Collaborator {
                message,
                details: None,
            },
        }
    }
}

/// Keyring and signing service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Keyring: Send + Sync {
    /// Whether the keyring is locked.
    async fn is_locked(&self) -> bool;

    /// Lock the keyring, forgetting decrypted key material.
    async fn lock(&self) -> Result<(), CollaboratorError>;

    /// Unlock with the master password.
    async fn unlock(&self, password: &str) -> Result<(), CollaboratorError>;

    /// Sign `payload` with `address`. A password unlocks the key for this
    /// signature only.
    async fn sign(
        &self,
        address: &str,
        payload: &Value,
        password: Option<String>,
    ) -> Result<String, CollaboratorError>;

    /// Change (or on first run, create) the master password.
    async fn change_master_password(
        &self,
        old_password: Option<String>,
        new_password: &str,
    ) -> Result<(), CollaboratorError>;

    /// Re-encrypt one account under the master password. Returns how many
    /// accounts still need migrating.
    async fn migrate_password(&self, address: &str, password: &str) -> Result<usize, CollaboratorError>;

    /// Create an account from a secret (mnemonic or private key).
    async fn create_account(&self, secret: &str, name: &str) -> Result<Value, CollaboratorError>;

    /// Derive a child account.
    async fn derive_account(&self, parent_address: &str, path: &str) -> Result<Value, CollaboratorError>;
}

/// Current value of a chain state stream plus its future updates.
pub struct ChainStateFeed {
    /// State at subscribe time.
    pub current: Value,
    /// Subsequent states, in emission order.
    pub updates: BoxStream<'static, Value>,
}

impl fmt::Debug for ChainStateFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainStateFeed")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

/// Chain registry and account sync.
#[async_trait]
pub trait ChainRegistry: Send + Sync {
    /// Static and connection info for `chain`.
    async fn chain_info(&self, chain: &str) -> Result<Value, CollaboratorError>;

    /// Live state of `chain`.
    async fn subscribe_chain_state(&self, chain: &str) -> Result<ChainStateFeed, CollaboratorError>;

    /// Long-running full sync of one account's chain data.
    async fn sync_account(&self, address: &str) -> Result<Value, CollaboratorError>;
}

/// Balance and transaction building service.
#[async_trait]
pub trait TransactionService: Send + Sync {
    /// Build the chain-specific transaction for `spec` and submit it.
    async fn build_and_submit(&self, spec: Value) -> Result<Value, CollaboratorError>;
}

/// Everything the broker calls out to.
#[derive(Clone)]
pub struct Services {
    /// Keyring and signer.
    pub keyring: Arc<dyn Keyring>,
    /// Chain registry.
    pub chains: Arc<dyn ChainRegistry>,
    /// Transaction builder.
    pub transactions: Arc<dyn TransactionService>,
    /// Settings store (`getSettings` / `onSettingsChange`).
    pub settings: Arc<SettingsStore>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn error_mapping() {
        assert_matches!(
            BrokerError::from(CollaboratorError::InvalidPassword),
            BrokerError::LockPolicy { .. }
        );
        assert_matches!(
            BrokerError::from(CollaboratorError::Locked),
            BrokerError::NotAvailable { .. }
        );
        assert_matches!(
            BrokerError::from(CollaboratorError::NotFound("account 0xab".into())),
            BrokerError::NotFound { id, .. } if id == "account 0xab"
        );
        assert_matches!(
            BrokerError::from(CollaboratorError::Failed("rpc down".into())),
            BrokerError::Collaborator { message, .. } if message == "rpc down"
        );
    }

    #[tokio::test]
    async fn keyring_mock_records_calls() {
        let mut keyring = MockKeyring::new();
        let _ = keyring
            .expect_unlock()
            .withf(|password| password == "hunter2")
            .times(1)
            .returning(|_| Ok(()));
        let _ = keyring.expect_is_locked().returning(|| false);

        keyring.unlock("hunter2").await.unwrap();
        assert!(!keyring.is_locked().await);
    }
}
