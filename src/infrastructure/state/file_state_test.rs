use anyhow::Result;
use serde_json::json;
use uuid::Uuid;

use super::FileStateStore;
use crate::domain::models::StateStore;

fn scratch_store() -> FileStateStore {
    let dir = std::env::temp_dir().join(format!("parley-state-{}", Uuid::new_v4().simple()));
    return FileStateStore::new(dir.join("nested/state.yaml"));
}

async fn cleanup(store: &FileStateStore) -> Result<()> {
    if let Some(root) = store.file_path.parent().and_then(|e| return e.parent()) {
        tokio::fs::remove_dir_all(root).await?;
    }

    return Ok(());
}

#[tokio::test]
async fn it_reads_nothing_from_a_missing_file() -> Result<()> {
    let store = scratch_store();

    assert_eq!(store.get("activeSessionId").await?, None);

    return Ok(());
}

#[tokio::test]
async fn it_persists_values_across_instances() -> Result<()> {
    let store = scratch_store();
    store.set("activeSessionId", Some(json!("ses_1"))).await?;
    store
        .set(
            "session_ses_1",
            Some(json!({ "status": "idle", "messageCount": 3, "lastActivity": 1700000000000_i64 })),
        )
        .await?;

    let reopened = FileStateStore::new(store.file_path.clone());
    assert_eq!(reopened.get("activeSessionId").await?, Some(json!("ses_1")));
    assert_eq!(
        reopened.get("session_ses_1").await?.and_then(|e| return e.get("messageCount").cloned()),
        Some(json!(3))
    );

    cleanup(&store).await?;
    return Ok(());
}

#[tokio::test]
async fn it_removes_keys_written_as_none() -> Result<()> {
    let store = scratch_store();
    store.set("activeSessionId", Some(json!("ses_1"))).await?;

    store.set("activeSessionId", None).await?;
    store.set("never-set", None).await?;

    assert_eq!(store.get("activeSessionId").await?, None);

    cleanup(&store).await?;
    return Ok(());
}

#[tokio::test]
async fn it_fails_on_unreadable_files() -> Result<()> {
    let store = scratch_store();
    if let Some(parent) = store.file_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&store.file_path, "- just\n- a list\n").await?;

    assert!(store.get("activeSessionId").await.is_err());

    cleanup(&store).await?;
    return Ok(());
}
