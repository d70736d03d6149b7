//! In-memory implementations of the registry collaborators
//!
//! These are suitable for development and testing. Production deployments
//! back the same traits with the application's database and provider API.

use crate::connection::{
    AccountResolver, ConnectionRecord, ConnectionStore, CredentialCipher, ResolvedAccount,
};
use crate::error::{RegistryError, Result};
use crate::snapshot::AssignmentStore;
use async_trait::async_trait;
use dashmap::DashMap;
use shardline_types::{AccountId, SiteAssignment};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

/// In-memory connection store
pub struct InMemoryConnectionStore {
    records: RwLock<Vec<ConnectionRecord>>,
    list_calls: AtomicUsize,
    fail_next: Mutex<Option<String>>,
    unresponsive: AtomicBool,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
            unresponsive: AtomicBool::new(false),
        }
    }

    /// Make list calls never complete.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Insert or replace a record by id.
    pub async fn insert(&self, record: ConnectionRecord) {
        let mut records = self.records.write().await;
        records.retain(|r| r.id != record.id);
        records.push(record);
    }

    pub async fn remove(&self, id: &str) {
        self.records.write().await.retain(|r| r.id != id);
    }

    /// Number of times the store has been listed.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Make the next list call fail with `message`.
    pub fn fail_next_list(&self, message: &str) {
        if let Ok(mut slot) = self.fail_next.lock() {
            *slot = Some(message.to_string());
        }
    }
}

impl Default for InMemoryConnectionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn list_shard_connections(&self) -> Result<Vec<ConnectionRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.unresponsive.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let failure = self.fail_next.lock().ok().and_then(|mut slot| slot.take());
        if let Some(message) = failure {
            return Err(RegistryError::ConnectionStore(message));
        }
        Ok(self.records.read().await.clone())
    }
}

/// Credential cipher backed by a lookup table of blob -> plaintext.
///
/// Unknown blobs fail to decrypt, mirroring a real cipher failing closed.
pub struct InMemoryCredentialCipher {
    secrets: DashMap<String, String>,
}

impl InMemoryCredentialCipher {
    pub fn new() -> Self {
        Self {
            secrets: DashMap::new(),
        }
    }

    pub fn add_secret(&self, blob: impl Into<String>, plaintext: impl Into<String>) {
        self.secrets.insert(blob.into(), plaintext.into());
    }
}

impl Default for InMemoryCredentialCipher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialCipher for InMemoryCredentialCipher {
    async fn decrypt(&self, secret_blob: &str) -> Result<String> {
        self.secrets
            .get(secret_blob)
            .map(|s| s.value().clone())
            .ok_or_else(|| RegistryError::Decrypt("unknown secret blob".into()))
    }
}

/// Account resolver backed by a reference -> account table.
pub struct InMemoryAccountResolver {
    accounts: DashMap<String, ResolvedAccount>,
    lookups: AtomicUsize,
    failing: AtomicBool,
    unresponsive: AtomicBool,
}

impl InMemoryAccountResolver {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            lookups: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            unresponsive: AtomicBool::new(false),
        }
    }

    /// Make every lookup return a provider error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every lookup hang forever.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    pub fn add_account(&self, reference: impl Into<String>, account: ResolvedAccount) {
        self.accounts.insert(reference.into(), account);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryAccountResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountResolver for InMemoryAccountResolver {
    async fn resolve_account_by_reference(
        &self,
        reference: &str,
        _credential: &str,
    ) -> Result<Option<ResolvedAccount>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unresponsive.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RegistryError::AccountResolution(format!(
                "lookup of {reference} rejected"
            )));
        }
        Ok(self.accounts.get(reference).map(|a| a.value().clone()))
    }
}

/// In-memory view of the domain table's live assignments.
pub struct InMemoryAssignmentStore {
    rows: RwLock<Vec<SiteAssignment>>,
    list_calls: AtomicUsize,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
        }
    }

    pub async fn insert(&self, assignment: SiteAssignment) {
        let mut rows = self.rows.write().await;
        rows.retain(|r| r.domain_id != assignment.domain_id);
        rows.push(assignment);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryAssignmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn list_live_assignments(&self, account_ids: &[AccountId]) -> Result<Vec<SiteAssignment>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| account_ids.contains(&r.account_id))
            .cloned()
            .collect())
    }
}
