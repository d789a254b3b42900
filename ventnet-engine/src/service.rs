//! 编辑会话的唯一变更入口。
//!
//! 每个外部意图都经过同一流程：回放期间直接拒绝，实体图在暂存层上完成并提交变更，
//! 随后恰好记录一条历史并派发事件。实体图拒绝的操作不写历史，图保持原样。

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info, warn};
use ventnet_core::entity::{CreateRequest, EntityId, ParamValue, Patch, SceneSettings};
use ventnet_core::graph::Mutation;
use ventnet_core::snapshot::SceneSnapshot;
use ventnet_core::{EntityGraph, GraphError};
use ventnet_io::{SnapshotStore, StoreError};

use crate::action::{Action, ActionKind};
use crate::errors::{ActionError, HistoryError};
use crate::events::{EventBus, ListenerId, SceneEvent};
use crate::history::CommandHistory;

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Add(CreateRequest),
    Update {
        id: EntityId,
        patch: Patch,
    },
    UpdateBatch(Vec<(EntityId, Patch)>),
    Remove(EntityId),
    RemoveBatch(Vec<EntityId>),
    SetParameters {
        entity_id: EntityId,
        values: BTreeMap<String, ParamValue>,
    },
    ClearParameters(EntityId),
    UpdateSettings(SceneSettings),
    /// 移除全部实体与参数集，保留场景设置。
    Clear,
}

/// 一次操作的结果。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// `Add` 新建的实体 id。
    pub created: Option<EntityId>,
    pub affected: Vec<EntityId>,
    pub removed: Vec<EntityId>,
    /// 无实际变化的操作不会写入历史。
    pub recorded: bool,
}

pub struct ActionService {
    graph: EntityGraph,
    history: CommandHistory,
    store: SnapshotStore,
    events: EventBus,
    selected: Option<EntityId>,
    hidden: HashSet<EntityId>,
    scene_id: Option<String>,
    default_name: String,
}

impl ActionService {
    pub fn new(graph: EntityGraph, history: CommandHistory, store: SnapshotStore) -> Self {
        Self {
            graph,
            history,
            store,
            events: EventBus::new(),
            selected: None,
            hidden: HashSet::new(),
            scene_id: None,
            default_name: ventnet_io::DEFAULT_SCENE_NAME.to_string(),
        }
    }

    /// 首次保存未命名场景时使用的名称。
    pub fn with_default_name(mut self, name: impl Into<String>) -> Self {
        self.default_name = name.into();
        self
    }

    #[inline]
    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    #[inline]
    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    #[inline]
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// 当前会话绑定的场景记录 id（尚未保存或载入时为 `None`）。
    #[inline]
    pub fn scene_id(&self) -> Option<&str> {
        self.scene_id.as_deref()
    }

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&SceneEvent) + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }

    // -----------------------------------------------------------------------
    // 变更
    // -----------------------------------------------------------------------

    pub fn perform(&mut self, operation: Operation) -> Result<Outcome, ActionError> {
        self.ensure_not_replaying()?;
        let mut created = None;
        let (kind, mutation) = match operation {
            Operation::Add(request) => {
                let kind = request.kind();
                let (id, mutation) = self.graph.add(request)?;
                created = Some(id);
                (ActionKind::Add(kind), mutation)
            }
            Operation::Update { id, patch } => {
                let kind = self.kind_of(id)?;
                (ActionKind::Update(kind), self.graph.update(id, patch)?)
            }
            Operation::UpdateBatch(patches) => {
                (ActionKind::UpdateBatch, self.graph.update_batch(patches)?)
            }
            Operation::Remove(id) => {
                let kind = self.kind_of(id)?;
                (ActionKind::Remove(kind), self.graph.remove(id)?)
            }
            Operation::RemoveBatch(ids) => {
                (ActionKind::RemoveBatch, self.graph.remove_batch(&ids)?)
            }
            Operation::SetParameters { entity_id, values } => (
                ActionKind::SetParameters,
                self.graph.set_parameters(entity_id, values)?,
            ),
            Operation::ClearParameters(entity_id) => (
                ActionKind::ClearParameters,
                self.graph.clear_parameters(entity_id)?,
            ),
            Operation::UpdateSettings(settings) => (
                ActionKind::UpdateSettings,
                self.graph.set_settings(settings)?,
            ),
            Operation::Clear => {
                let settings = self.graph.settings();
                let empty = SceneSnapshot {
                    scene_center: settings.scene_center,
                    scale: settings.scale,
                    ..SceneSnapshot::default()
                };
                (ActionKind::ClearScene, self.graph.replace(&empty)?)
            }
        };
        let mut outcome = self.commit(kind, mutation)?;
        outcome.created = created;
        Ok(outcome)
    }

    pub fn add(&mut self, request: CreateRequest) -> Result<EntityId, ActionError> {
        let outcome = self.perform(Operation::Add(request))?;
        outcome
            .created
            .ok_or_else(|| ActionError::Graph(GraphError::Integrity("entity was not created".into())))
    }

    pub fn update(&mut self, id: EntityId, patch: Patch) -> Result<Vec<EntityId>, ActionError> {
        Ok(self.perform(Operation::Update { id, patch })?.affected)
    }

    pub fn update_batch(
        &mut self,
        patches: Vec<(EntityId, Patch)>,
    ) -> Result<Vec<EntityId>, ActionError> {
        Ok(self.perform(Operation::UpdateBatch(patches))?.affected)
    }

    /// 返回被删除的全部 id（含级联）。
    pub fn remove(&mut self, id: EntityId) -> Result<Vec<EntityId>, ActionError> {
        Ok(self.perform(Operation::Remove(id))?.removed)
    }

    pub fn remove_batch(&mut self, ids: Vec<EntityId>) -> Result<Vec<EntityId>, ActionError> {
        Ok(self.perform(Operation::RemoveBatch(ids))?.removed)
    }

    pub fn set_parameters(
        &mut self,
        entity_id: EntityId,
        values: BTreeMap<String, ParamValue>,
    ) -> Result<(), ActionError> {
        self.perform(Operation::SetParameters { entity_id, values })
            .map(|_| ())
    }

    pub fn clear_parameters(&mut self, entity_id: EntityId) -> Result<(), ActionError> {
        self.perform(Operation::ClearParameters(entity_id)).map(|_| ())
    }

    pub fn update_settings(&mut self, settings: SceneSettings) -> Result<(), ActionError> {
        self.perform(Operation::UpdateSettings(settings)).map(|_| ())
    }

    pub fn clear_scene(&mut self) -> Result<Vec<EntityId>, ActionError> {
        Ok(self.perform(Operation::Clear)?.removed)
    }

    // -----------------------------------------------------------------------
    // 撤销 / 重做
    // -----------------------------------------------------------------------

    /// 返回是否存在可撤销的记录。
    pub fn handle_undo(&mut self) -> Result<bool, ActionError> {
        let Some(delta) = self.history.begin_undo()? else {
            return Ok(false);
        };
        self.replay(|graph| graph.apply(&delta))
    }

    pub fn handle_redo(&mut self) -> Result<bool, ActionError> {
        let Some(delta) = self.history.begin_redo()? else {
            return Ok(false);
        };
        self.replay(|graph| graph.apply(&delta))
    }

    fn replay<F>(&mut self, apply: F) -> Result<bool, ActionError>
    where
        F: FnOnce(&mut EntityGraph) -> Result<(), GraphError>,
    {
        let result = apply(&mut self.graph);
        let committed = result.is_ok();
        let touched = self
            .history
            .finish_replay(committed)
            .map(|action| (action.kind, action.entity_ids.clone()));
        if let Err(err) = result {
            warn!(error = %err, "历史回放失败，实体图保持不变");
            return Err(HistoryError::Replay(err).into());
        }
        if let Some((kind, ids)) = touched {
            debug!(action = %kind, entities = ids.len(), "历史已回放");
            self.forget_missing(&ids);
            self.events.emit(&SceneEvent::Updated(ids));
        }
        self.emit_history();
        Ok(true)
    }

    pub fn clear_history(&mut self) -> Result<(), ActionError> {
        self.ensure_not_replaying()?;
        self.history.clear();
        self.emit_history();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 持久化
    // -----------------------------------------------------------------------

    /// 保存当前场景并返回记录 id。先序列化为不可变快照再写入；失败不影响实体图与历史。
    pub fn save(&mut self, name: Option<&str>) -> Result<String, ActionError> {
        let snapshot = self.graph.serialize();
        let name = match (name, &self.scene_id) {
            (Some(name), _) => Some(name),
            (None, None) => Some(self.default_name.as_str()),
            (None, Some(_)) => None,
        };
        let id = self
            .store
            .persist(self.scene_id.as_deref(), name, &snapshot)?;
        self.scene_id = Some(id.clone());
        Ok(id)
    }

    /// 载入已存场景，作为一条可撤销的 `LoadScene` 记录替换当前图。
    pub fn load_scene(&mut self, id: &str) -> Result<(), ActionError> {
        self.ensure_not_replaying()?;
        let record = self
            .store
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.replace_scene(ActionKind::LoadScene, record.id, &record.snapshot)
    }

    /// 载入最近修改的在用场景；存储为空时返回 `None`。
    pub fn load_latest(&mut self) -> Result<Option<String>, ActionError> {
        self.ensure_not_replaying()?;
        let Some(record) = self.store.get_latest()? else {
            return Ok(None);
        };
        let id = record.id.clone();
        self.replace_scene(ActionKind::LoadScene, record.id, &record.snapshot)?;
        Ok(Some(id))
    }

    /// 先保存当前状态，再为其创建不可变版本，返回版本 id。
    pub fn create_version(&mut self, name: Option<&str>) -> Result<String, ActionError> {
        let scene_id = self.save(None)?;
        Ok(self.store.create_version(&scene_id, name)?)
    }

    pub fn export_scene(&self, id: &str) -> Result<String, ActionError> {
        Ok(self.store.export_to_text(id)?)
    }

    /// 导入 JSON 文本：存为新记录，并作为可撤销的 `ImportScene` 记录替换当前图。
    pub fn import_scene(&mut self, text: &str) -> Result<String, ActionError> {
        self.ensure_not_replaying()?;
        let id = self.store.import_from_text(text)?;
        let record = self
            .store
            .get(&id)?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        self.replace_scene(ActionKind::ImportScene, record.id, &record.snapshot)?;
        Ok(id)
    }

    fn replace_scene(
        &mut self,
        kind: ActionKind,
        scene_id: String,
        snapshot: &SceneSnapshot,
    ) -> Result<(), ActionError> {
        let mutation = self.graph.replace(snapshot)?;
        self.commit(kind, mutation)?;
        self.hidden.clear();
        if self.selected.take().is_some() {
            self.events.emit(&SceneEvent::Selected(None));
        }
        info!(scene = %scene_id, entities = self.graph.len(), "场景已载入");
        self.scene_id = Some(scene_id.clone());
        self.events.emit(&SceneEvent::SceneLoaded(scene_id));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 选择与可见性（视图状态，不进入历史）
    // -----------------------------------------------------------------------

    #[inline]
    pub fn selected(&self) -> Option<EntityId> {
        self.selected
    }

    /// 选中实体；`None` 清空选择。实体不存在时返回错误。
    pub fn select(&mut self, id: Option<EntityId>) -> Result<(), ActionError> {
        if let Some(id) = id {
            if !self.graph.contains(id) {
                return Err(GraphError::NotFound(id).into());
            }
        }
        self.selected = id;
        self.events.emit(&SceneEvent::Selected(id));
        Ok(())
    }

    /// 批量设置可见性；任一 id 不存在则整体拒绝。
    pub fn set_visibility(&mut self, ids: Vec<EntityId>, visible: bool) -> Result<(), ActionError> {
        if let Some(missing) = ids.iter().find(|id| !self.graph.contains(**id)) {
            return Err(GraphError::NotFound(*missing).into());
        }
        for id in &ids {
            if visible {
                self.hidden.remove(id);
            } else {
                self.hidden.insert(*id);
            }
        }
        self.events
            .emit(&SceneEvent::VisibilityChanged { ids, visible });
        Ok(())
    }

    #[inline]
    pub fn is_visible(&self, id: EntityId) -> bool {
        self.graph.contains(id) && !self.hidden.contains(&id)
    }

    // -----------------------------------------------------------------------
    // 内部
    // -----------------------------------------------------------------------

    fn ensure_not_replaying(&self) -> Result<(), ActionError> {
        if self.history.is_replaying() {
            warn!("回放期间拒绝新的变更");
            return Err(HistoryError::ReentrantRecording.into());
        }
        Ok(())
    }

    fn kind_of(&self, id: EntityId) -> Result<ventnet_core::entity::EntityKind, ActionError> {
        self.graph
            .kind_of(id)
            .ok_or_else(|| GraphError::NotFound(id).into())
    }

    /// 记录已提交的变更并派发事件。历史拒绝记录时回退实体图。
    fn commit(&mut self, kind: ActionKind, mutation: Mutation) -> Result<Outcome, ActionError> {
        if mutation.is_empty() {
            debug!(action = %kind, "操作未产生变化，不写入历史");
            return Ok(Outcome::default());
        }
        let removed = mutation.removed_ids();
        let rollback = mutation.previous.clone();
        let action = Action::from_mutation(kind, mutation);
        let affected = action.entity_ids.clone();

        if let Err(err) = self.history.record(action) {
            if let Err(rollback_err) = self.graph.apply(&rollback) {
                warn!(error = %rollback_err, "回退实体图失败");
            }
            return Err(err.into());
        }
        debug!(action = %kind, affected = affected.len(), "操作已提交");

        self.forget_missing(&removed);
        self.events.emit(&SceneEvent::Updated(affected.clone()));
        self.emit_history();
        Ok(Outcome {
            created: None,
            affected,
            removed,
            recorded: true,
        })
    }

    /// 清理已不存在实体的视图状态。
    fn forget_missing(&mut self, ids: &[EntityId]) {
        for id in ids {
            if self.graph.contains(*id) {
                continue;
            }
            self.hidden.remove(id);
            if self.selected == Some(*id) {
                self.selected = None;
                self.events.emit(&SceneEvent::Selected(None));
            }
        }
    }

    fn emit_history(&mut self) {
        self.events
            .emit(&SceneEvent::HistoryChanged(self.history.stats()));
    }
}

impl std::fmt::Debug for ActionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionService")
            .field("entities", &self.graph.len())
            .field("history", &self.history.stats())
            .field("scene_id", &self.scene_id)
            .finish()
    }
}
