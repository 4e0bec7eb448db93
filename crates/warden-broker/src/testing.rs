//! In-memory collaborators.
//!
//! Back the unit tests, the server integration tests, and `wardend`.
//! Nothing here touches real keys or chains.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use warden_settings::{SettingsStore, WardenSettings};

use crate::collaborators::{
    ChainRegistry, ChainStateFeed, CollaboratorError, Keyring, Services, TransactionService,
};

/// Keyring holding a single master password and a list of accounts.
pub struct MemoryKeyring {
    password: Mutex<Option<String>>,
    locked: AtomicBool,
    lock_calls: AtomicUsize,
    accounts: Mutex<Vec<Value>>,
    unmigrated: Mutex<Vec<String>>,
    lock_delay: Duration,
}

impl MemoryKeyring {
    /// Unlocked keyring with master password `password`.
    pub fn unlocked(password: &str) -> Self {
        Self::with_state(Some(password.to_owned()), false)
    }

    /// Locked keyring with master password `password`.
    pub fn locked(password: &str) -> Self {
        Self::with_state(Some(password.to_owned()), true)
    }

    /// Keyring before first run: no master password yet.
    pub fn fresh() -> Self {
        Self::with_state(None, false)
    }

    fn with_state(password: Option<String>, locked: bool) -> Self {
        Self {
            password: Mutex::new(password),
            locked: AtomicBool::new(locked),
            lock_calls: AtomicUsize::new(0),
            accounts: Mutex::new(Vec::new()),
            unmigrated: Mutex::new(Vec::new()),
            lock_delay: Duration::ZERO,
        }
    }

    /// Make every [`Keyring::lock`] take `delay` before the keyring locks.
    #[must_use]
    pub fn with_lock_delay(mut self, delay: Duration) -> Self {
        self.lock_delay = delay;
        self
    }

    /// Mark `addresses` as still using a per-account password.
    #[must_use]
    pub fn with_unmigrated(self, addresses: &[&str]) -> Self {
        *self.unmigrated.lock() = addresses.iter().map(|a| (*a).to_owned()).collect();
        self
    }

    /// Times [`Keyring::lock`] was called.
    pub fn lock_calls(&self) -> usize {
        self.lock_calls.load(Ordering::SeqCst)
    }

    /// Synchronous view of the lock flag.
    pub fn is_locked_now(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Accounts created or derived so far.
    pub fn accounts(&self) -> Vec<Value> {
        self.accounts.lock().clone()
    }

    fn check_password(&self, candidate: &str) -> Result<(), CollaboratorError> {
        match self.password.lock().as_deref() {
            Some(expected) if expected == candidate => Ok(()),
            _ => Err(CollaboratorError::InvalidPassword),
        }
    }

    fn require_unlocked(&self) -> Result<(), CollaboratorError> {
        if self.locked.load(Ordering::SeqCst) {
            Err(CollaboratorError::Locked)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Keyring for MemoryKeyring {
    async fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    async fn lock(&self) -> Result<(), CollaboratorError> {
        let _ = self.lock_calls.fetch_add(1, Ordering::SeqCst);
        if !self.lock_delay.is_zero() {
            tokio::time::sleep(self.lock_delay).await;
        }
        self.locked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unlock(&self, password: &str) -> Result<(), CollaboratorError> {
        self.check_password(password)?;
        self.locked.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn sign(
        &self,
        address: &str,
        payload: &Value,
        password: Option<String>,
    ) -> Result<String, CollaboratorError> {
        match password {
            Some(password) => self.check_password(&password)?,
            None => self.require_unlocked()?,
        }
        let digest = payload
            .to_string()
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
                (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
            });
        Ok(format!("0x{digest:016x}{}", address.len()))
    }

    async fn change_master_password(
        &self,
        old_password: Option<String>,
        new_password: &str,
    ) -> Result<(), CollaboratorError> {
        let mut current = self.password.lock();
        if current.is_some() {
            match (current.as_deref(), old_password.as_deref()) {
                (Some(expected), Some(given)) if expected == given => {}
                _ => return Err(CollaboratorError::InvalidPassword),
            }
        }
        *current = Some(new_password.to_owned());
        self.locked.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn migrate_password(&self, address: &str, password: &str) -> Result<usize, CollaboratorError> {
        self.check_password(password)?;
        let mut unmigrated = self.unmigrated.lock();
        let before = unmigrated.len();
        unmigrated.retain(|a| a != address);
        if unmigrated.len() == before {
            return Err(CollaboratorError::NotFound(address.to_owned()));
        }
        Ok(unmigrated.len())
    }

    async fn create_account(&self, secret: &str, name: &str) -> Result<Value, CollaboratorError> {
        self.require_unlocked()?;
        if secret.split_whitespace().count() < 12 && !secret.starts_with("0x") {
            return Err(CollaboratorError::Failed("unsupported secret format".into()));
        }
        let mut accounts = self.accounts.lock();
        let account = json!({
            "address": format!("0x{:040x}", accounts.len() + 1),
            "name": name,
        });
        accounts.push(account.clone());
        Ok(account)
    }

    async fn derive_account(&self, parent_address: &str, path: &str) -> Result<Value, CollaboratorError> {
        self.require_unlocked()?;
        let mut accounts = self.accounts.lock();
        if !accounts.iter().any(|a| a["address"] == parent_address) {
            return Err(CollaboratorError::NotFound(parent_address.to_owned()));
        }
        let account = json!({
            "address": format!("0x{:040x}", accounts.len() + 1),
            "parentAddress": parent_address,
            "path": path,
        });
        accounts.push(account.clone());
        Ok(account)
    }
}

/// Chain registry with a fixed set of chains and pushable state.
pub struct StaticChainRegistry {
    chains: Mutex<HashMap<String, (Value, broadcast::Sender<Value>)>>,
    sync_delay: Duration,
}

impl StaticChainRegistry {
    /// Registry knowing `chains`, each starting with state `{"block": 0}`.
    pub fn new(chains: &[&str]) -> Self {
        let chains = chains
            .iter()
            .map(|name| {
                let (tx, _) = broadcast::channel(64);
                ((*name).to_owned(), (json!({"block": 0}), tx))
            })
            .collect();
        Self {
            chains: Mutex::new(chains),
            sync_delay: Duration::ZERO,
        }
    }

    /// Make [`ChainRegistry::sync_account`] take `delay`.
    #[must_use]
    pub fn with_sync_delay(mut self, delay: Duration) -> Self {
        self.sync_delay = delay;
        self
    }

    /// Push a new state for `chain` to every subscriber.
    pub fn publish(&self, chain: &str, state: Value) -> bool {
        let mut chains = self.chains.lock();
        let Some((current, tx)) = chains.get_mut(chain) else {
            return false;
        };
        *current = state.clone();
        let _ = tx.send(state);
        true
    }
}

#[async_trait]
impl ChainRegistry for StaticChainRegistry {
    async fn chain_info(&self, chain: &str) -> Result<Value, CollaboratorError> {
        if self.chains.lock().contains_key(chain) {
            Ok(json!({"chain": chain, "connected": true}))
        } else {
            Err(CollaboratorError::NotFound(chain.to_owned()))
        }
    }

    async fn subscribe_chain_state(&self, chain: &str) -> Result<ChainStateFeed, CollaboratorError> {
        let chains = self.chains.lock();
        let (current, tx) = chains
            .get(chain)
            .ok_or_else(|| CollaboratorError::NotFound(chain.to_owned()))?;
        let updates = BroadcastStream::new(tx.subscribe())
            .filter_map(|item| async move { item.ok() })
            .boxed();
        Ok(ChainStateFeed {
            current: current.clone(),
            updates,
        })
    }

    async fn sync_account(&self, address: &str) -> Result<Value, CollaboratorError> {
        if !self.sync_delay.is_zero() {
            tokio::time::sleep(self.sync_delay).await;
        }
        Ok(json!({"address": address, "synced": true}))
    }
}

/// Transaction service that echoes the spec back with a fake hash.
#[derive(Default)]
pub struct EchoTransactionService {
    submitted: AtomicUsize,
}

impl EchoTransactionService {
    /// Transactions submitted so far.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionService for EchoTransactionService {
    async fn build_and_submit(&self, spec: Value) -> Result<Value, CollaboratorError> {
        if !spec.is_object() {
            return Err(CollaboratorError::Failed("transaction spec must be an object".into()));
        }
        let n = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({"hash": format!("0x{n:064x}"), "spec": spec}))
    }
}

/// Handles on the in-memory collaborators behind a [`Services`].
pub struct MemoryServices {
    /// Keyring.
    pub keyring: Arc<MemoryKeyring>,
    /// Chains.
    pub chains: Arc<StaticChainRegistry>,
    /// Transactions.
    pub transactions: Arc<EchoTransactionService>,
    /// Settings (not persisted).
    pub settings: Arc<SettingsStore>,
}

impl MemoryServices {
    /// Unlocked keyring with password `password`, chains `polkadot` and
    /// `kusama`, and `settings` held in memory.
    pub fn new(password: &str, settings: WardenSettings) -> Self {
        Self::with_keyring(MemoryKeyring::unlocked(password), settings)
    }

    /// Same, with a caller-built keyring.
    pub fn with_keyring(keyring: MemoryKeyring, settings: WardenSettings) -> Self {
        Self {
            keyring: Arc::new(keyring),
            chains: Arc::new(StaticChainRegistry::new(&["polkadot", "kusama"])),
            transactions: Arc::new(EchoTransactionService::default()),
            settings: Arc::new(SettingsStore::in_memory(settings)),
        }
    }

    /// Type-erased bundle for the broker.
    pub fn services(&self) -> Services {
        Services {
            keyring: self.keyring.clone(),
            chains: self.chains.clone(),
            transactions: self.transactions.clone(),
            settings: Arc::clone(&self.settings),
        }
    }
}
