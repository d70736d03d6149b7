//! Connection records and the collaborators that turn them into shards

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A hosting-provider connection as stored by the connection store.
///
/// The store only returns records of the hosting provider type that are not
/// scoped to a single domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub display_name: Option<String>,
    /// Free-form JSON configuration; see [`ShardConnectionConfig`].
    #[serde(default)]
    pub config: Value,
    pub encrypted_credential: Option<String>,
}

/// Account identity returned by the provider for a reference lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAccount {
    pub id: String,
    pub name: Option<String>,
}

/// Source of shard connection records.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// List connected or pending shard connections.
    async fn list_shard_connections(&self) -> Result<Vec<ConnectionRecord>>;
}

/// Decrypts stored credential blobs. Must fail closed.
#[async_trait]
pub trait CredentialCipher: Send + Sync {
    async fn decrypt(&self, secret_blob: &str) -> Result<String>;
}

/// Resolves a non-canonical account reference (name, slug, email...) to
/// the provider's account identity.
#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn resolve_account_by_reference(
        &self,
        reference: &str,
        credential: &str,
    ) -> Result<Option<ResolvedAccount>>;
}

/// Routing-relevant settings parsed out of a connection's config blob.
///
/// Parsing is lenient: unknown keys are ignored, snake_case and camelCase
/// spellings are both accepted and numeric strings are accepted for the
/// weight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardConnectionConfig {
    pub account_ref: Option<String>,
    pub shard_key: Option<String>,
    pub region: Option<String>,
    pub weight: Option<i64>,
}

impl ShardConnectionConfig {
    pub fn from_value(config: &Value) -> Self {
        Self {
            account_ref: string_field(config, &["account_id", "accountId", "account_ref", "accountRef", "account"]),
            shard_key: string_field(config, &["shard_key", "shardKey"]),
            region: string_field(config, &["region"]),
            weight: int_field(config, &["weight", "base_weight", "baseWeight"]),
        }
    }
}

fn string_field(config: &Value, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        config
            .get(*name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn int_field(config: &Value, names: &[&str]) -> Option<i64> {
    names.iter().find_map(|name| match config.get(*name)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}
