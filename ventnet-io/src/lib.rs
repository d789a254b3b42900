//! 场景快照持久化：带版本的场景记录存储，后端可替换为内存或文件系统。

mod backend;

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use ventnet_core::graph::DEFAULT_DECIMALS;
use ventnet_core::{EntityGraph, GraphError, snapshot::SceneSnapshot};

pub use backend::{FsBackend, MemoryBackend};

/// 新建记录未指定名称时使用。
pub const DEFAULT_SCENE_NAME: &str = "未命名场景";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("scene {0} not found")]
    NotFound(String),
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
    #[error("invalid scene id {0:?}")]
    InvalidId(String),
    #[error("rejected scene content: {0}")]
    Rejected(#[from] GraphError),
}

/// 原始字节存储端口，键为场景 id。
pub trait SnapshotBackend {
    /// 读取记录；不存在时返回 [`StoreError::NotFound`]。
    fn load_raw(&self, id: &str) -> Result<Vec<u8>, StoreError>;
    fn save_raw(&mut self, id: &str, data: &[u8]) -> Result<(), StoreError>;
    /// 返回记录此前是否存在。
    fn remove_raw(&mut self, id: &str) -> Result<bool, StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
    /// 返回删除的记录数。
    fn clear(&mut self) -> Result<usize, StoreError>;
}

/// 持久化的场景记录：元数据加完整快照。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredScene {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// 自 Unix 纪元起的毫秒数。
    pub last_modified: i64,
    #[serde(default = "StoredScene::first_version")]
    pub version: u32,
    #[serde(default)]
    pub is_version: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<i64>,
    #[serde(flatten)]
    pub snapshot: SceneSnapshot,
}

impl StoredScene {
    fn first_version() -> u32 {
        1
    }

    pub fn meta(&self) -> SceneMeta {
        SceneMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            last_modified: self.last_modified,
            version: self.version,
            is_version: self.is_version,
            original_id: self.original_id.clone(),
        }
    }
}

/// 列表展示用的轻量元数据。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneMeta {
    pub id: String,
    pub name: String,
    pub last_modified: i64,
    pub version: u32,
    pub is_version: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
}

/// 导入文本的宽松形态：既接受导出的完整记录，也接受裸快照。
#[derive(Deserialize)]
struct ImportedScene {
    #[serde(default)]
    name: Option<String>,
    #[serde(flatten)]
    snapshot: SceneSnapshot,
}

pub struct SnapshotStore {
    backend: Box<dyn SnapshotBackend>,
    last_stamp: i64,
    /// 导入时坐标保留的小数位数，应与会话实体图一致。
    decimals: u32,
}

impl SnapshotStore {
    pub fn new(backend: impl SnapshotBackend + 'static) -> Self {
        let mut store = Self {
            backend: Box::new(backend),
            last_stamp: 0,
            decimals: DEFAULT_DECIMALS,
        };
        // 续用已有记录的时间戳，保证新写入排在最前
        match store.list_all() {
            Ok(records) => {
                store.last_stamp = records.iter().map(|r| r.last_modified).max().unwrap_or(0);
            }
            Err(err) => {
                warn!(error = %err, "读取已有场景记录失败，时间戳从当前时间起算");
            }
        }
        store
    }

    /// 指定导入时使用的坐标精度。
    pub fn with_precision(mut self, decimals: u32) -> Self {
        self.decimals = decimals;
        self
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// 以目录为根打开文件系统存储。
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self::new(FsBackend::new(root)?))
    }

    /// 写入场景并返回记录 id。
    ///
    /// - `scene_id` 指向在用记录：覆盖并递增版本号，未给名称时保留原名；
    /// - 指向历史版本：另建新的在用记录，版本快照本身不变；
    /// - 未知 id：以该 id 新建，版本号为 1；未给 id 时生成新 id。
    pub fn persist(
        &mut self,
        scene_id: Option<&str>,
        name: Option<&str>,
        snapshot: &SceneSnapshot,
    ) -> Result<String, StoreError> {
        let existing = match scene_id {
            Some(id) => self.load(id)?,
            None => None,
        };

        let record = match (scene_id, existing) {
            (Some(_), Some(current)) if !current.is_version => StoredScene {
                name: name.map(str::to_string).unwrap_or(current.name),
                last_modified: self.next_stamp(),
                version: current.version.saturating_add(1),
                snapshot: snapshot.clone(),
                ..current
            },
            (_, existing) => {
                let id = match (scene_id, &existing) {
                    (Some(id), None) => id.to_string(),
                    _ => new_id(),
                };
                let name = name
                    .map(str::to_string)
                    .or_else(|| existing.map(|version| version.name))
                    .unwrap_or_else(|| DEFAULT_SCENE_NAME.to_string());
                StoredScene {
                    id,
                    name,
                    last_modified: self.next_stamp(),
                    version: 1,
                    is_version: false,
                    original_id: None,
                    imported_at: None,
                    snapshot: snapshot.clone(),
                }
            }
        };

        self.write(&record)?;
        info!(id = %record.id, version = record.version, "场景已保存");
        Ok(record.id)
    }

    pub fn get(&self, id: &str) -> Result<Option<StoredScene>, StoreError> {
        self.load(id)
    }

    /// 最近修改的在用记录（不含历史版本）。
    pub fn get_latest(&self) -> Result<Option<StoredScene>, StoreError> {
        Ok(self
            .list_all()?
            .into_iter()
            .find(|record| !record.is_version))
    }

    /// 全部记录，按修改时间倒序，同时刻按 id 排序。损坏的记录会被跳过。
    pub fn list_all(&self) -> Result<Vec<StoredScene>, StoreError> {
        let mut records = Vec::new();
        for key in self.backend.keys()? {
            match self.load(&key) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(StoreError::Corrupt(reason)) => {
                    warn!(id = %key, %reason, "跳过损坏的场景记录");
                }
                Err(StoreError::InvalidId(_)) => {
                    warn!(id = %key, "跳过 id 非法的场景记录");
                }
                Err(err) => return Err(err),
            }
        }
        sort_records(&mut records);
        Ok(records)
    }

    pub fn list_meta(&self) -> Result<Vec<SceneMeta>, StoreError> {
        Ok(self.list_all()?.iter().map(StoredScene::meta).collect())
    }

    pub fn delete(&mut self, id: &str) -> Result<bool, StoreError> {
        validate_id(id)?;
        let removed = self.backend.remove_raw(id)?;
        if removed {
            info!(id, "场景已删除");
        }
        Ok(removed)
    }

    /// 清空存储，返回是否删除了任何记录。
    pub fn clear_all(&mut self) -> Result<bool, StoreError> {
        let removed = self.backend.clear()?;
        info!(removed, "场景存储已清空");
        Ok(removed > 0)
    }

    /// 为已有记录创建不可变的版本快照，原记录保持不变。
    pub fn create_version(&mut self, id: &str, name: Option<&str>) -> Result<String, StoreError> {
        let source = self
            .load(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let original_id = source
            .original_id
            .clone()
            .unwrap_or_else(|| source.id.clone());
        // 取谱系中最大序号加一，删除中间版本后也不会与现存版本重号
        let ordinal = self
            .list_versions(&original_id)?
            .iter()
            .map(|version| version.version)
            .max()
            .unwrap_or(0)
            .saturating_add(1);
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} v{ordinal}", source.name));

        let record = StoredScene {
            id: new_id(),
            name,
            last_modified: self.next_stamp(),
            version: ordinal,
            is_version: true,
            original_id: Some(original_id),
            imported_at: None,
            snapshot: source.snapshot,
        };
        self.write(&record)?;
        info!(id = %record.id, source = id, version = ordinal, "场景版本已创建");
        Ok(record.id)
    }

    /// 指定原始记录的全部历史版本。
    pub fn list_versions(&self, original_id: &str) -> Result<Vec<StoredScene>, StoreError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|record| record.is_version && record.original_id.as_deref() == Some(original_id))
            .collect())
    }

    pub fn export_to_text(&self, id: &str) -> Result<String, StoreError> {
        let record = self
            .load(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(serde_json::to_string_pretty(&record)?)
    }

    /// 导入 JSON 文本。内容先经实体图校验，派生缓存重新计算后以新 id 保存。
    pub fn import_from_text(&mut self, text: &str) -> Result<String, StoreError> {
        let imported: ImportedScene = serde_json::from_str(text)?;
        let mut graph = EntityGraph::with_precision(self.decimals);
        graph.deserialize(&imported.snapshot)?;
        let stamp = self.next_stamp();
        let record = StoredScene {
            id: new_id(),
            name: imported
                .name
                .unwrap_or_else(|| DEFAULT_SCENE_NAME.to_string()),
            last_modified: stamp,
            version: 1,
            is_version: false,
            original_id: None,
            imported_at: Some(stamp),
            snapshot: graph.serialize(),
        };
        self.write(&record)?;
        info!(id = %record.id, entities = graph.len(), "场景已导入");
        Ok(record.id)
    }

    fn load(&self, id: &str) -> Result<Option<StoredScene>, StoreError> {
        validate_id(id)?;
        let bytes = match self.backend.load_raw(id) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let record: StoredScene = serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::Corrupt(format!("{id}: {err}")))?;
        if record.id != id {
            return Err(StoreError::Corrupt(format!(
                "{id}: record carries id {}",
                record.id
            )));
        }
        Ok(Some(record))
    }

    fn write(&mut self, record: &StoredScene) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(record)?;
        self.backend.save_raw(&record.id, &data)?;
        debug!(id = %record.id, bytes = data.len(), "场景记录已写入后端");
        Ok(())
    }

    /// 严格递增的毫秒时间戳。
    fn next_stamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let stamp = now.max(self.last_stamp + 1);
        self.last_stamp = stamp;
        stamp
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// id 会成为文件名，只允许字母、数字、`-` 与 `_`。
pub(crate) fn validate_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

fn sort_records(records: &mut [StoredScene]) {
    records.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| a.id.cmp(&b.id))
    });
}
