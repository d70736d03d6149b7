//! Shard registry - the cached set of eligible upstream accounts

use crate::connection::{
    AccountResolver, ConnectionRecord, ConnectionStore, CredentialCipher, ShardConnectionConfig,
};
use crate::error::{RegistryError, Result};
use shardline_types::{
    AccountId, ConnectionId, Region, ShardCandidate, ShardIdentity, ShardKey, TtlCache,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Default lifetime of a loaded candidate set.
pub const DEFAULT_REGISTRY_TTL: Duration = Duration::from_secs(60);

/// Upper bound on any single store, cipher or resolver call made while
/// loading. The cache slot stays locked during a load, so a hung lookup
/// would otherwise stall every planner.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Loads, resolves and caches shard candidates.
pub struct ShardRegistry {
    store: Arc<dyn ConnectionStore>,
    cipher: Arc<dyn CredentialCipher>,
    resolver: Arc<dyn AccountResolver>,
    cache: TtlCache<(), Vec<ShardCandidate>>,
    lookup_timeout: Duration,
}

impl ShardRegistry {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        cipher: Arc<dyn CredentialCipher>,
        resolver: Arc<dyn AccountResolver>,
    ) -> Self {
        Self::with_ttl(store, cipher, resolver, DEFAULT_REGISTRY_TTL)
    }

    pub fn with_ttl(
        store: Arc<dyn ConnectionStore>,
        cipher: Arc<dyn CredentialCipher>,
        resolver: Arc<dyn AccountResolver>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            cipher,
            resolver,
            cache: TtlCache::new(ttl),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    /// Bound each individual lookup made during a load.
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }

    /// The current candidate set, loading it on cache miss.
    pub async fn candidates(&self) -> Result<Arc<Vec<ShardCandidate>>> {
        self.cache
            .get_or_try_load((), move || self.load_candidates())
            .await
    }

    /// Force the next [`candidates`](Self::candidates) call to reload.
    pub async fn invalidate(&self) {
        self.cache.invalidate().await;
    }

    /// Load the candidate set from the connection store, bypassing the cache.
    ///
    /// Records without a usable credential or resolvable account are dropped
    /// with a warning. The result is de-duplicated by (shard key, account)
    /// and sorted for deterministic iteration.
    #[instrument(skip(self))]
    pub async fn load_candidates(&self) -> Result<Vec<ShardCandidate>> {
        let mut records =
            tokio::time::timeout(self.lookup_timeout, self.store.list_shard_connections())
                .await
                .map_err(|_| RegistryError::Timeout {
                    operation: "connection store listing",
                    after: self.lookup_timeout,
                })??;
        records.sort_by(|a, b| a.id.cmp(&b.id));
        let total = records.len();

        let mut seen: HashSet<ShardIdentity> = HashSet::new();
        let mut candidates = Vec::with_capacity(total);

        for record in &records {
            let Some(candidate) = self.build_candidate(record).await else {
                continue;
            };
            if !seen.insert(candidate.identity()) {
                debug!(
                    connection_id = %record.id,
                    shard_key = %candidate.shard_key,
                    account_id = %candidate.account_id,
                    "Duplicate shard connection ignored"
                );
                continue;
            }
            candidates.push(candidate);
        }

        candidates.sort_by(|a, b| {
            (&a.shard_key, &a.account_id, &a.connection_id).cmp(&(
                &b.shard_key,
                &b.account_id,
                &b.connection_id,
            ))
        });

        info!(
            connections = total,
            candidates = candidates.len(),
            "Shard registry loaded"
        );

        Ok(candidates)
    }

    async fn build_candidate(&self, record: &ConnectionRecord) -> Option<ShardCandidate> {
        let config = ShardConnectionConfig::from_value(&record.config);

        let Some(blob) = record
            .encrypted_credential
            .as_deref()
            .filter(|b| !b.trim().is_empty())
        else {
            warn!(connection_id = %record.id, "Shard connection has no credential; skipping");
            return None;
        };

        let credential = match tokio::time::timeout(self.lookup_timeout, self.cipher.decrypt(blob)).await {
            Ok(Ok(token)) if !token.trim().is_empty() => token,
            Ok(Ok(_)) => {
                warn!(connection_id = %record.id, "Shard credential decrypted to nothing; skipping");
                return None;
            }
            Ok(Err(e)) => {
                warn!(connection_id = %record.id, error = %e, "Shard credential could not be decrypted; skipping");
                return None;
            }
            Err(_) => {
                warn!(
                    connection_id = %record.id,
                    timeout_secs = self.lookup_timeout.as_secs(),
                    "Shard credential decryption timed out; skipping"
                );
                return None;
            }
        };

        let Some(reference) = config.account_ref.as_deref() else {
            warn!(connection_id = %record.id, "Shard connection has no account reference; skipping");
            return None;
        };

        let account_id = match AccountId::parse_canonical(reference) {
            Some(id) => id,
            None => self.resolve_reference(record, reference, &credential).await?,
        };

        let shard_key = [config.shard_key.as_deref(), record.display_name.as_deref()]
            .into_iter()
            .flatten()
            .map(ShardKey::new)
            .find(|key| !key.is_empty())
            .unwrap_or_else(|| ShardKey::new(&record.id));

        Some(ShardCandidate {
            connection_id: ConnectionId::new(record.id.clone()),
            shard_key,
            account_id,
            credential,
            region: config.region.as_deref().and_then(Region::parse),
            base_weight: ShardCandidate::clamp_weight(config.weight),
        })
    }

    async fn resolve_reference(
        &self,
        record: &ConnectionRecord,
        reference: &str,
        credential: &str,
    ) -> Option<AccountId> {
        let lookup = self.resolver.resolve_account_by_reference(reference, credential);
        match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Ok(Some(account))) => {
                let id = AccountId::parse_canonical(&account.id)
                    .unwrap_or_else(|| AccountId::new(account.id.trim()));
                debug!(
                    connection_id = %record.id,
                    reference,
                    account_id = %id,
                    "Resolved account reference"
                );
                Some(id)
            }
            Ok(Ok(None)) => {
                warn!(connection_id = %record.id, reference, "Account reference did not resolve; skipping");
                None
            }
            Ok(Err(e)) => {
                warn!(connection_id = %record.id, reference, error = %e, "Account lookup failed; skipping");
                None
            }
            Err(_) => {
                warn!(
                    connection_id = %record.id,
                    reference,
                    timeout_secs = self.lookup_timeout.as_secs(),
                    "Account lookup timed out; skipping"
                );
                None
            }
        }
    }
}
