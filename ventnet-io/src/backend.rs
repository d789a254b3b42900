//! 快照存储后端：按 id 存取原始字节。

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{SnapshotBackend, StoreError, validate_id};

const RECORD_EXTENSION: &str = "json";
const PENDING_SUFFIX: &str = ".json.tmp";

/// 进程内存后端，会话结束即丢弃。
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    records: BTreeMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotBackend for MemoryBackend {
    fn load_raw(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn save_raw(&mut self, id: &str, data: &[u8]) -> Result<(), StoreError> {
        self.records.insert(id.to_string(), data.to_vec());
        Ok(())
    }

    fn remove_raw(&mut self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.remove(id).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records.keys().cloned().collect())
    }

    fn clear(&mut self) -> Result<usize, StoreError> {
        let count = self.records.len();
        self.records.clear();
        Ok(count)
    }
}

/// 文件系统后端：每条记录一个 `<id>.json`。
///
/// 写入先落到 `<id>.json.tmp`，成功后再改名覆盖正式文件，
/// 中途失败或被放弃的写入不会破坏已有记录。
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// id 只能映射为根目录下的文件名，不允许路径分隔符或 `..`。
    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.root.join(format!("{id}.{RECORD_EXTENSION}")))
    }

    fn pending_path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.root.join(format!("{id}{PENDING_SUFFIX}")))
    }
}

impl SnapshotBackend for FsBackend {
    fn load_raw(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(id.to_string()))
            }
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn save_raw(&mut self, id: &str, data: &[u8]) -> Result<(), StoreError> {
        let pending = self.pending_path_for(id)?;
        let path = self.path_for(id)?;
        fs::write(&pending, data).map_err(|source| StoreError::Io {
            path: pending.clone(),
            source,
        })?;
        if let Err(source) = fs::rename(&pending, &path) {
            // 改名失败时清理临时文件，正式记录保持原样
            let _ = fs::remove_file(&pending);
            return Err(StoreError::Io { path, source });
        }
        debug!(path = %path.display(), bytes = data.len(), "快照记录已写入");
        Ok(())
    }

    fn remove_raw(&mut self, id: &str) -> Result<bool, StoreError> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if validate_id(stem).is_err() {
                    continue;
                }
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn clear(&mut self) -> Result<usize, StoreError> {
        let keys = self.keys()?;
        let mut removed = 0;
        for key in keys {
            if self.remove_raw(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_reports_missing_keys() {
        let mut backend = MemoryBackend::new();
        assert!(matches!(
            backend.load_raw("absent"),
            Err(StoreError::NotFound(id)) if id == "absent"
        ));
        backend.save_raw("a", b"{}").unwrap();
        assert_eq!(backend.keys().unwrap(), vec!["a".to_string()]);
        assert!(backend.remove_raw("a").unwrap());
        assert!(!backend.remove_raw("a").unwrap());
    }

    #[test]
    fn fs_backend_ignores_pending_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut backend = FsBackend::new(dir.path()).unwrap();
        backend.save_raw("scene-1", b"{\"id\":\"scene-1\"}").unwrap();
        fs::write(dir.path().join("scene-2.json.tmp"), b"partial").unwrap();

        assert_eq!(backend.keys().unwrap(), vec!["scene-1".to_string()]);
        assert_eq!(
            backend.load_raw("scene-1").unwrap(),
            b"{\"id\":\"scene-1\"}".to_vec()
        );
        assert!(!dir.path().join("scene-1.json.tmp").exists());
        assert_eq!(backend.clear().unwrap(), 1);
        assert!(backend.keys().unwrap().is_empty());
    }

    #[test]
    fn fs_backend_never_touches_paths_outside_root() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = dir.path().join("store");
        let outside = dir.path().join("victim.json");
        fs::write(&outside, b"keep").unwrap();
        let mut backend = FsBackend::new(&root).unwrap();

        for id in ["../victim", "..", "a/b", ""] {
            assert!(matches!(backend.load_raw(id), Err(StoreError::InvalidId(_))));
            assert!(matches!(backend.remove_raw(id), Err(StoreError::InvalidId(_))));
            assert!(matches!(
                backend.save_raw(id, b"{}"),
                Err(StoreError::InvalidId(_))
            ));
        }
        assert_eq!(fs::read(&outside).unwrap(), b"keep".to_vec());

        fs::write(root.join("not valid.json"), b"{}").unwrap();
        assert!(backend.keys().unwrap().is_empty());
    }
}
