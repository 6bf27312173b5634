mod support;

use std::sync::Arc;
use std::time::Duration;

use chat_engine::{ChatBackend, Engine, EngineConfig, SyncOutcome};
use chat_state::{FileStore, KeyValueStore};
use support::ScriptedBackend;
use tempfile::TempDir;

/// Engine with its own `FileStore` handle on `dir`, as a separate process would have.
fn file_engine(dir: &TempDir, backend: &Arc<ScriptedBackend>) -> Engine {
    let store: Arc<dyn KeyValueStore> =
        Arc::new(FileStore::open(dir.path()).expect("state directory should open"));
    let config = EngineConfig::default()
        .with_sync_policy(Duration::from_millis(5), 3)
        .with_sweep_interval(Duration::from_millis(20));
    Engine::new(config, Arc::clone(backend) as Arc<dyn ChatBackend>, store)
}

#[tokio::test]
async fn conversation_created_elsewhere_can_be_activated() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let backend = ScriptedBackend::new();
    let mut first = file_engine(&dir, &backend);
    first.start_watchers();
    let second = file_engine(&dir, &backend);

    let id = second.lifecycle().new_conversation().expect("create");

    assert_eq!(
        first.activate(&id).await.expect("activate"),
        SyncOutcome::NotSynced
    );
    assert_eq!(first.lifecycle().active_conversation(), Some(id.clone()));
    assert_eq!(first.conversations().list().len(), 1);
}

#[tokio::test]
async fn sweep_picks_up_changes_from_another_handle() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let backend = ScriptedBackend::new();
    let mut first = file_engine(&dir, &backend);
    let second = file_engine(&dir, &backend);
    let id = second.lifecycle().new_conversation().expect("create");
    first.start_watchers();

    let mut view = first.conversations().subscribe();
    second
        .conversations()
        .rename(&id, "renamed elsewhere")
        .expect("rename");
    second.registry().mark(&id, "claude").expect("mark");

    tokio::time::timeout(
        Duration::from_secs(2),
        view.wait_for(|list| {
            list.iter()
                .any(|conversation| conversation.title == "renamed elsewhere")
        }),
    )
    .await
    .expect("sweep should re-derive the list")
    .expect("view alive");

    let mut generating = first.registry().subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        generating.wait_for(|entries| entries.contains_key(&id)),
    )
    .await
    .expect("sweep should re-derive the registry")
    .expect("registry alive");
}
