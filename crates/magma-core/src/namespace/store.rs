//! Durable namespace storage.
//!
//! One file per document, rewritten atomically: the new content goes to a
//! uniquely named temp file in the same directory, is synced, then renamed
//! over the old file. Writers serialize on an advisory lock held on a
//! sidecar `.lock` file, so readers only ever observe complete files.

use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use rustc_hash::FxHasher;

use super::types::{Namespace, NamespaceDelta, decode_namespace, encode_namespace};
use crate::document::DocumentId;
use crate::error::{Error, Result};
use crate::paths::StateDirs;

/// Extension of namespace files.
pub const NAMESPACE_EXT: &str = "ns";

/// Maps document ids to namespace files.
#[derive(Debug, Clone)]
pub struct NamespaceStore {
    dir: PathBuf,
}

impl NamespaceStore {
    pub fn new(dirs: &StateDirs) -> Self {
        Self {
            dir: dirs.namespace_dir.clone(),
        }
    }

    /// Store rooted directly at a namespace directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic file path for a document.
    ///
    /// `<dir>/<sanitized stem>-<fxhash:016x>.ns`: the stem keeps files
    /// recognizable, the hash keeps documents with equal stems apart.
    pub fn path_for(&self, id: &DocumentId) -> PathBuf {
        let mut hasher = FxHasher::default();
        id.as_str().hash(&mut hasher);
        let hash = hasher.finish();

        let stem = Path::new(id.as_str())
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut stem: String = stem
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(40)
            .collect();
        if stem.is_empty() {
            stem.push_str("document");
        }

        self.dir
            .join(format!("{}-{:016x}.{}", stem, hash, NAMESPACE_EXT))
    }

    /// Load a document's namespace. Missing or unreadable files load as
    /// empty.
    pub fn load(&self, id: &DocumentId) -> Namespace {
        load_from(&self.path_for(id))
    }

    /// Replace the stored namespace.
    pub fn persist(&self, id: &DocumentId, namespace: &Namespace) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        persist_at(&self.path_for(id), namespace)
    }

    /// Apply a delta to the stored namespace and persist the result.
    ///
    /// Entries the delta does not mention are kept.
    pub fn merge(&self, id: &DocumentId, delta: &NamespaceDelta) -> Result<Namespace> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(id);
        let _lock = lock_for(&path)?;
        let mut namespace = load_from(&path);
        namespace.apply(delta);
        write_atomic(&path, &encode_namespace(&namespace)?)?;
        Ok(namespace)
    }

    /// Remove a document's namespace file and any stale temp files.
    pub fn delete(&self, id: &DocumentId) -> Result<()> {
        let path = self.path_for(id);
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Ok(());
        };

        remove_if_exists(&path)?;
        if let Ok(entries) = fs::read_dir(&self.dir) {
            let temp_prefix = format!("{}.", file_name);
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(&temp_prefix) && name.ends_with(".tmp") {
                    remove_if_exists(&entry.path())?;
                }
            }
        }
        remove_if_exists(&lock_path(&path))?;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Exclusive advisory lock, released when the returned file is dropped.
fn lock_for(path: &Path) -> Result<File> {
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))?;
    lock.lock_exclusive()
        .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("cannot lock namespace: {}", e))))?;
    Ok(lock)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "namespace".to_string());
    let temp = dir.join(format!("{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let result = (|| -> Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Load a namespace file, treating anything unreadable as empty.
pub fn load_from(path: &Path) -> Namespace {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Namespace::new(),
        Err(e) => {
            tracing::warn!("Failed to read namespace {}: {}", path.display(), e);
            return Namespace::new();
        }
    };
    match decode_namespace(&bytes) {
        Ok(namespace) => namespace,
        Err(e) => {
            tracing::warn!("Ignoring corrupt namespace {}: {}", path.display(), e);
            Namespace::new()
        }
    }
}

/// Atomically write the serializable subset of `namespace` to `path`.
pub fn persist_at(path: &Path, namespace: &Namespace) -> Result<()> {
    let bytes = encode_namespace(namespace)?;
    let _lock = lock_for(path)?;
    write_atomic(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Value;
    use crate::script::builtins::Builtin;
    use crate::script::StoredValue;
    use tempfile::TempDir;

    fn store() -> (TempDir, NamespaceStore) {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dirs = StateDirs::new(temp.path()).expect("Failed to create dirs");
        (temp, NamespaceStore::new(&dirs))
    }

    #[test]
    fn test_path_for_is_stable_and_distinct() {
        let (_temp, store) = store();
        let a = DocumentId::new("/notes/analysis.txt");
        let b = DocumentId::new("/other/analysis.txt");

        assert_eq!(store.path_for(&a), store.path_for(&a));
        assert_ne!(store.path_for(&a), store.path_for(&b));
        let name = store.path_for(&a).file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("analysis-"));
        assert!(name.ends_with(".ns"));
    }

    #[test]
    fn test_path_for_sanitizes() {
        let (_temp, store) = store();
        let path = store.path_for(&DocumentId::new("my notes (1).txt"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("my_notes__1_-"));
    }

    #[test]
    fn test_load_missing_is_empty() {
        let (_temp, store) = store();
        assert!(store.load(&DocumentId::new("nothing")).is_empty());
    }

    #[test]
    fn test_persist_then_load_keeps_serializable_subset() {
        let (_temp, store) = store();
        let id = DocumentId::new("doc");
        let mut ns = Namespace::new();
        ns.variables.insert("x".into(), Value::Int(1));
        ns.variables.insert("xs".into(), Value::List(vec![Value::Str("a".into())]));
        ns.variables.insert("f".into(), Value::Builtin(Builtin::Len));
        ns.add_import("import math");

        store.persist(&id, &ns).unwrap();
        let loaded = store.load(&id);

        assert_eq!(loaded.variables.len(), 2);
        assert_eq!(loaded.variables["xs"].repr(), "['a']");
        assert_eq!(loaded.imports, vec!["import math"]);
    }

    #[test]
    fn test_merge_keeps_unrelated_entries() {
        let (_temp, store) = store();
        let id = DocumentId::new("doc");
        let mut ns = Namespace::new();
        ns.variables.insert("a".into(), Value::Int(1));
        ns.variables.insert("b".into(), Value::Int(2));
        store.persist(&id, &ns).unwrap();

        let mut delta = NamespaceDelta::default();
        delta.set.insert("c".into(), StoredValue::Int(3));
        delta.removed.push("b".into());
        let merged = store.merge(&id, &delta).unwrap();

        let keys: Vec<&String> = merged.variables.keys().collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert_eq!(store.load(&id).variables.len(), 2);
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let (_temp, store) = store();
        let id = DocumentId::new("doc");
        fs::write(store.path_for(&id), b"\xff\xff\xff garbage").unwrap();
        assert!(store.load(&id).is_empty());
    }

    #[test]
    fn test_huge_length_prefix_loads_empty() {
        let (_temp, store) = store();
        let id = DocumentId::new("doc");
        let path = store.path_for(&id);
        let bytes = [
            0x01, 0x01, 0xFD, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F, 0x00,
        ];
        fs::write(&path, bytes).unwrap();
        assert!(load_from(&path).is_empty());
        assert!(store.load(&id).is_empty());
    }

    #[test]
    fn test_delete_removes_file_and_temps() {
        let (_temp, store) = store();
        let id = DocumentId::new("doc");
        let mut ns = Namespace::new();
        ns.variables.insert("x".into(), Value::Int(1));
        store.persist(&id, &ns).unwrap();

        let path = store.path_for(&id);
        let stale = PathBuf::from(format!("{}.deadbeef.tmp", path.display()));
        fs::write(&stale, b"partial").unwrap();

        store.delete(&id).unwrap();
        assert!(!path.exists());
        assert!(!stale.exists());
        assert!(store.load(&id).is_empty());
        store.delete(&id).unwrap();
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let (_temp, store) = store();
        let id = DocumentId::new("doc");
        store.persist(&id, &Namespace::new()).unwrap();

        let leftovers = fs::read_dir(store.dir())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
