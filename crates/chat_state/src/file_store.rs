use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;
use tokio::sync::broadcast;

use crate::error::ChatStateError;
use crate::kv::{lock_unpoisoned, KeyValueStore, StoreChange};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// File name holding the value of `key`; unsafe characters become `_`.
#[must_use]
pub fn key_file_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    format!("{sanitized}.json")
}

/// Directory-backed store: one JSON file per key, replaced atomically.
///
/// Change notifications reach subscribers of this handle only. Other
/// processes sharing the directory observe changes through periodic refresh.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<StoreChange>,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ChatStateError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|source| ChatStateError::io("creating state directory", &root, source))?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            changes,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key_file_name(key))
    }

    fn notify(&self, key: &str) {
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
        });
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, ChatStateError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ChatStateError::io("reading state file", path, source)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ChatStateError> {
        let path = self.path_for(key);
        {
            let _guard = lock_unpoisoned(&self.write_lock);
            if fs::read_to_string(&path).is_ok_and(|current| current == value) {
                return Ok(());
            }

            // Unique per writer, so concurrent processes never share a temp file.
            let mut temp = NamedTempFile::new_in(&self.root).map_err(|source| {
                ChatStateError::io("creating temp state file", &self.root, source)
            })?;
            temp.write_all(value.as_bytes())
                .and_then(|()| temp.as_file().sync_all())
                .map_err(|source| {
                    ChatStateError::io("writing temp state file", temp.path(), source)
                })?;
            temp.persist(&path).map_err(|persist| {
                ChatStateError::io("replacing state file", &path, persist.error)
            })?;
        }
        self.notify(key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ChatStateError> {
        let path = self.path_for(key);
        let removed = {
            let _guard = lock_unpoisoned(&self.write_lock);
            match fs::remove_file(&path) {
                Ok(()) => true,
                Err(error) if error.kind() == ErrorKind::NotFound => false,
                Err(source) => {
                    return Err(ChatStateError::io("removing state file", path, source));
                }
            }
        };
        if removed {
            self.notify(key);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::key_file_name;

    #[test]
    fn key_file_name_replaces_path_separators() {
        assert_eq!(key_file_name("chat-generating"), "chat-generating.json");
        assert_eq!(key_file_name("../etc/passwd"), ".._etc_passwd.json");
        assert_eq!(key_file_name("a b:c"), "a_b_c.json");
    }
}
