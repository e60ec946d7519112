//! Key-value persistence for checkpoints and task records.
//!
//! The store is an injected dependency: the loop only sees [`KvStore`]. An
//! in-memory map serves tests and short-lived sessions; [`FileStore`] keeps
//! one file per key with atomic replace-on-write.

mod checkpoint;
pub mod format;
mod registry;

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

pub use checkpoint::{CHECKPOINT_PREFIX, Checkpointer};
pub use registry::{TASK_PREFIX, TaskRegistry};

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Minimal key-value interface. Single-key writes are atomic; there are no
/// cross-key guarantees.
pub trait KvStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;
    /// Keys starting with `prefix`, sorted.
    fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Run a store operation on tokio's blocking pool.
pub(crate) async fn blocking<T, F>(op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| StoreError::Io(io::Error::other(e)))?
}

/// [`KvStore::put`] off the async workers; file stores fsync on every write.
pub(crate) async fn put_blocking(
    store: Arc<dyn KvStore>,
    key: String,
    value: Vec<u8>,
) -> Result<(), StoreError> {
    blocking(move || store.put(&key, &value)).await
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// One file per key under a root directory.
///
/// Keys are escaped into flat file names, so `/` in a key never creates
/// subdirectories.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

const RECORD_EXT: &str = "rec";

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", escape_key(key), RECORD_EXT))
    }
}

/// Escape everything outside `[A-Za-z0-9_-]` as `%XX`.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Write via a temp file and rename so readers never see partial records.
fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("record");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        chrono::Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl KvStore for FileStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        atomic_write(&self.path_for(key), value)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            // Temp files start with '.', which escaped keys never do.
            if name.starts_with('.') {
                continue;
            }
            let Some(stem) = name.strip_suffix(&format!(".{}", RECORD_EXT)) else {
                continue;
            };
            if let Some(key) = unescape_key(stem)
                && key.starts_with(prefix)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KvStore) {
        store.put("task/a", b"1").unwrap();
        store.put("task/b", b"2").unwrap();
        store.put("task-status/running/a", b"").unwrap();
        store.put("checkpoint/s1", b"3").unwrap();

        assert_eq!(store.get("task/a").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(store.get("task/missing").unwrap(), None);
        assert_eq!(
            store.list_by_prefix("task/").unwrap(),
            vec!["task/a".to_string(), "task/b".to_string()]
        );

        store.put("task/a", b"replaced").unwrap();
        assert_eq!(
            store.get("task/a").unwrap().as_deref(),
            Some(&b"replaced"[..])
        );

        assert!(store.delete("task/a").unwrap());
        assert!(!store.delete("task/a").unwrap());
        assert_eq!(store.list_by_prefix("task/").unwrap(), vec!["task/b".to_string()]);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        exercise(&store);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        exercise(&store);

        // Reopening sees the same records.
        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get("checkpoint/s1").unwrap().as_deref(),
            Some(&b"3"[..])
        );
    }

    #[test]
    fn test_key_escaping_roundtrip() {
        for key in ["task/a b", "checkpoint/ü-1", "plain_key-2", "a%2Fb"] {
            let escaped = escape_key(key);
            assert!(!escaped.contains('/'));
            assert_eq!(unescape_key(&escaped).as_deref(), Some(key));
        }
    }
}
