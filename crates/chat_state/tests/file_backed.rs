use std::sync::Arc;
use std::time::Duration;

use chat_state::{
    key_file_name, Conversation, ConversationStore, Feedback, FileStore, GeneratingRegistry,
    KeyValueStore, Message, SettingsStore, CONVERSATIONS_KEY, DEFAULT_TITLE, GENERATING_KEY,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> Arc<dyn KeyValueStore> {
    Arc::new(FileStore::open(dir.path()).expect("state directory should open"))
}

#[test]
fn conversations_survive_reopening_the_directory() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let id = {
        let conversations = ConversationStore::new(open_store(&dir));
        let created = conversations
            .create(Conversation::new(DEFAULT_TITLE))
            .expect("create");
        conversations
            .append_message(&created.id, Message::user("persist me"))
            .expect("append");
        created.id
    };

    assert!(dir.path().join(key_file_name(CONVERSATIONS_KEY)).exists());

    let reopened = ConversationStore::new(open_store(&dir));
    let conversation = reopened.get(&id).expect("conversation should reload");
    assert_eq!(conversation.title, "persist me");
    assert_eq!(conversation.messages[0].content, "persist me");
}

#[test]
fn separate_handles_observe_each_other_after_refresh() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let first = GeneratingRegistry::new(open_store(&dir));
    let second = GeneratingRegistry::new(open_store(&dir));

    first.mark("c1", "claude").expect("mark");
    assert!(second.snapshot().is_empty());
    assert!(second.is_generating("c1"));

    second.clear("c1").expect("clear");
    assert!(!first.is_generating("c1"));
    assert_eq!(
        std::fs::read_to_string(dir.path().join(key_file_name(GENERATING_KEY)))
            .expect("registry file"),
        "{}"
    );
}

#[test]
fn feedback_rename_and_delete_are_persisted() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let conversations = ConversationStore::new(open_store(&dir));
    let created = conversations
        .create(Conversation::new(DEFAULT_TITLE))
        .expect("create");
    let reply = Message::assistant("answer");
    let reply_id = reply.id.clone();
    conversations
        .append_message(&created.id, reply)
        .expect("append");

    conversations
        .set_feedback(&created.id, &reply_id, Some(Feedback::Up))
        .expect("feedback");
    conversations.rename(&created.id, "  Renamed  ").expect("rename");

    let reopened = ConversationStore::new(open_store(&dir));
    let conversation = reopened.get(&created.id).expect("conversation");
    assert_eq!(conversation.title, "Renamed");
    assert_eq!(conversation.messages[0].feedback, Some(Feedback::Up));

    assert!(reopened.delete(&created.id).expect("delete"));
    assert!(!reopened.delete(&created.id).expect("second delete"));
    assert!(ConversationStore::new(open_store(&dir)).list().is_empty());
}

#[test]
fn settings_round_trip_through_files() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    SettingsStore::new(open_store(&dir))
        .update(|settings| settings.cwd = Some("/work".to_string()))
        .expect("update");

    let loaded = SettingsStore::new(open_store(&dir)).load();
    assert_eq!(loaded.cwd.as_deref(), Some("/work"));
}

#[tokio::test]
async fn conversation_watcher_follows_same_handle_writes() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = open_store(&dir);
    let viewer = Arc::new(ConversationStore::new(Arc::clone(&store)));
    let _watcher = viewer.spawn_watcher(Duration::from_secs(3600));
    let mut view = viewer.subscribe();

    let writer = ConversationStore::new(store);
    let created = writer.create(Conversation::new("remote")).expect("create");

    tokio::time::timeout(
        Duration::from_secs(2),
        view.wait_for(|list| list.iter().any(|conversation| conversation.id == created.id)),
    )
    .await
    .expect("viewer should re-derive within timeout")
    .expect("view sender alive");
}

#[test]
fn lookup_miss_rereads_writes_from_another_handle() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let reader = ConversationStore::new(open_store(&dir));
    let writer = ConversationStore::new(open_store(&dir));

    let created = writer.create(Conversation::new("elsewhere")).expect("create");
    assert!(reader.snapshot().is_empty());
    let found = reader.get(&created.id).expect("miss should re-read the file");
    assert_eq!(found.title, "elsewhere");
    assert_eq!(reader.list().len(), 1);
}

#[tokio::test]
async fn conversation_sweep_follows_other_handles() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let viewer = Arc::new(ConversationStore::new(open_store(&dir)));
    let _watcher = viewer.spawn_watcher(Duration::from_millis(20));
    let mut view = viewer.subscribe();

    let writer = ConversationStore::new(open_store(&dir));
    let created = writer.create(Conversation::new("other handle")).expect("create");

    tokio::time::timeout(
        Duration::from_secs(2),
        view.wait_for(|list| list.iter().any(|conversation| conversation.id == created.id)),
    )
    .await
    .expect("sweep should re-derive within timeout")
    .expect("view sender alive");
}

#[test]
fn concurrent_writers_on_separate_handles_never_fail() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let writers: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|fill| {
            let store = open_store(&dir);
            let value = fill.repeat(256 * 1024);
            std::thread::spawn(move || {
                (0..20)
                    .map(|_| store.set(CONVERSATIONS_KEY, &value))
                    .filter(Result::is_err)
                    .count()
            })
        })
        .collect();

    let failures: usize = writers
        .into_iter()
        .map(|writer| writer.join().expect("writer thread"))
        .sum();
    assert_eq!(failures, 0);

    let stored = open_store(&dir)
        .get(CONVERSATIONS_KEY)
        .expect("get")
        .expect("value");
    assert!(stored == "a".repeat(256 * 1024) || stored == "b".repeat(256 * 1024));
    let leftovers = std::fs::read_dir(dir.path())
        .expect("read dir")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name() != key_file_name(CONVERSATIONS_KEY).as_str())
        .count();
    assert_eq!(leftovers, 0);
}
