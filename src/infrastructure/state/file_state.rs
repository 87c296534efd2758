#[cfg(test)]
#[path = "file_state_test.rs"]
mod tests;

use std::collections::BTreeMap;
use std::path;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::StateStore;

type Entries = BTreeMap<String, Value>;

/// Key-value state kept in a single YAML file. Every write rewrites the
/// file; reads go to disk so several processes see each other's changes.
pub struct FileStateStore {
    pub file_path: path::PathBuf,
    write_lock: Mutex<()>,
}

impl Default for FileStateStore {
    fn default() -> FileStateStore {
        return FileStateStore::new(path::PathBuf::from(Config::get(ConfigKey::StateFile)));
    }
}

impl FileStateStore {
    pub fn new(file_path: path::PathBuf) -> FileStateStore {
        return FileStateStore {
            file_path,
            write_lock: Mutex::new(()),
        };
    }

    async fn read(&self) -> Result<Entries> {
        if !self.file_path.exists() {
            return Ok(Entries::new());
        }

        let payload = fs::read_to_string(&self.file_path).await?;
        if payload.trim().is_empty() {
            return Ok(Entries::new());
        }

        let entries: Entries = serde_yaml::from_str(&payload)
            .with_context(|| return format!("Failed to parse {}", self.file_path.display()))?;
        return Ok(entries);
    }

    async fn write(&self, entries: &Entries) -> Result<()> {
        let payload = serde_yaml::to_string(entries)?;

        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut file = fs::File::create(&self.file_path).await?;
        file.write_all(payload.as_bytes()).await?;

        return Ok(());
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    #[allow(clippy::implicit_return)]
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.read().await?;
        return Ok(entries.get(key).cloned());
    }

    #[allow(clippy::implicit_return)]
    async fn set(&self, key: &str, value: Option<Value>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read().await?;
        match value {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                if entries.remove(key).is_none() {
                    return Ok(());
                }
            }
        }

        tracing::debug!(key, path = %self.file_path.display(), "Writing state");
        return self.write(&entries).await;
    }
}
