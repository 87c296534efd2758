use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Host-owned key-value store that survives restarts. Writing `None`
/// removes the key.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Option<Value>) -> Result<()>;
}

pub type StateStoreBox = Arc<dyn StateStore>;

pub const ACTIVE_SESSION_KEY: &str = "activeSessionId";

pub fn session_cache_key(session_id: &str) -> String {
    return format!("session_{session_id}");
}
