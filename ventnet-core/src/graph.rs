//! 实体图：持有全部实体集合、分配 id、维护引用与级联不变量，并负责整图快照。
//!
//! 所有变更先在 [`Staging`] 覆盖层上计算，校验通过后才一次性提交，
//! 因此任何失败都不会留下部分生效的级联。每次提交产出一个 [`Mutation`]，
//! 其中的前后增量足以让调用方构造一条可撤销的历史记录。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::mem;

use tracing::debug;

use crate::entity::{
    Attachment, AttachmentPatch, AttachmentPayload, AttachmentSpec, CreateRequest, EntityId,
    EntityKind, EntityRef, FreePoint, FreePointPatch, FreePointSpec, JunctionPatch,
    JunctionPoint, JunctionSpec, LiningOverlay, LiningPatch, LiningSpec, ParamValue,
    ParameterSet, Patch, Record, RecordKey, SceneSettings, Segment, SegmentPatch, SegmentSpec,
};
use crate::errors::GraphError;
use crate::geometry::{Bounds3, Point3};
use crate::resolver;
use crate::snapshot::{SceneData, SceneItem, SceneSnapshot};

pub const DEFAULT_DECIMALS: u32 = 6;
const MIN_SEGMENT_LENGTH: f64 = 1e-9;
/// 坐标与尺寸的绝对值上限，保证派生几何与 JSON 输出都保持有限。
pub const MAX_COORDINATE: f64 = 1.0e12;

/// 单条记录在某一时刻的完整状态，`None` 表示该记录不存在。
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEntry {
    pub key: RecordKey,
    pub state: Option<Record>,
}

/// 一组记录状态，按顺序整体应用。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateDelta {
    entries: Vec<DeltaEntry>,
}

impl StateDelta {
    #[inline]
    pub fn entries(&self) -> &[DeltaEntry] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 一次已提交变更的前后状态。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mutation {
    pub previous: StateDelta,
    pub current: StateDelta,
    pub affected: Vec<EntityId>,
}

impl Mutation {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// 本次变更中被删除的实体 id（含级联）。
    pub fn removed_ids(&self) -> Vec<EntityId> {
        self.current
            .entries
            .iter()
            .filter_map(|entry| match (entry.key, &entry.state) {
                (RecordKey::Entity(id), None) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// 本次变更中新建或修改后仍存在的实体 id。
    pub fn written_ids(&self) -> Vec<EntityId> {
        self.current
            .entries
            .iter()
            .filter_map(|entry| match (entry.key, &entry.state) {
                (RecordKey::Entity(id), Some(_)) => Some(id),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct EntityGraph {
    settings: SceneSettings,
    segments: BTreeMap<EntityId, Segment>,
    attachments: BTreeMap<EntityId, Attachment>,
    linings: BTreeMap<EntityId, LiningOverlay>,
    free_points: BTreeMap<EntityId, FreePoint>,
    junctions: BTreeMap<EntityId, JunctionPoint>,
    parameters: BTreeMap<EntityId, ParameterSet>,
    kinds: HashMap<EntityId, EntityKind>,
    /// 巷道 id → 依附其上的依附物与风筒 id。
    dependents: HashMap<EntityId, BTreeSet<EntityId>>,
    /// 节点 id → 引用该节点的巷道 id。
    junction_refs: HashMap<EntityId, BTreeSet<EntityId>>,
    next_id: u64,
    retired: HashSet<EntityId>,
    decimals: u32,
}

impl Default for EntityGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::with_precision(DEFAULT_DECIMALS)
    }

    /// 指定坐标写入时保留的小数位数。
    pub fn with_precision(decimals: u32) -> Self {
        Self {
            settings: SceneSettings::default(),
            segments: BTreeMap::new(),
            attachments: BTreeMap::new(),
            linings: BTreeMap::new(),
            free_points: BTreeMap::new(),
            junctions: BTreeMap::new(),
            parameters: BTreeMap::new(),
            kinds: HashMap::new(),
            dependents: HashMap::new(),
            junction_refs: HashMap::new(),
            next_id: 1,
            retired: HashSet::new(),
            decimals,
        }
    }

    /// 从快照重建实体图，派生位置全部重新计算。
    pub fn from_snapshot(snapshot: &SceneSnapshot) -> Result<Self, GraphError> {
        build_from_snapshot(snapshot, DEFAULT_DECIMALS)
    }

    #[inline]
    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    #[inline]
    pub fn settings(&self) -> SceneSettings {
        self.settings
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: EntityId) -> bool {
        self.kinds.contains_key(&id)
    }

    #[inline]
    pub fn kind_of(&self, id: EntityId) -> Option<EntityKind> {
        self.kinds.get(&id).copied()
    }

    pub fn find_by_id(&self, id: EntityId) -> Option<EntityRef<'_>> {
        match self.kinds.get(&id)? {
            EntityKind::Segment => self.segments.get(&id).map(EntityRef::Segment),
            EntityKind::Fan | EntityKind::Structure | EntityKind::Decoration => {
                self.attachments.get(&id).map(EntityRef::Attachment)
            }
            EntityKind::Lining => self.linings.get(&id).map(EntityRef::Lining),
            EntityKind::FreePoint => self.free_points.get(&id).map(EntityRef::FreePoint),
            EntityKind::Junction => self.junctions.get(&id).map(EntityRef::Junction),
        }
    }

    #[inline]
    pub fn segment(&self, id: EntityId) -> Option<&Segment> {
        self.segments.get(&id)
    }

    #[inline]
    pub fn attachment(&self, id: EntityId) -> Option<&Attachment> {
        self.attachments.get(&id)
    }

    #[inline]
    pub fn lining(&self, id: EntityId) -> Option<&LiningOverlay> {
        self.linings.get(&id)
    }

    #[inline]
    pub fn parameters(&self, entity_id: EntityId) -> Option<&ParameterSet> {
        self.parameters.get(&entity_id)
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    pub fn attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.values()
    }

    pub fn linings(&self) -> impl Iterator<Item = &LiningOverlay> {
        self.linings.values()
    }

    pub fn free_points(&self) -> impl Iterator<Item = &FreePoint> {
        self.free_points.values()
    }

    pub fn junctions(&self) -> impl Iterator<Item = &JunctionPoint> {
        self.junctions.values()
    }

    pub fn parameter_sets(&self) -> impl Iterator<Item = &ParameterSet> {
        self.parameters.values()
    }

    /// 依附在指定巷道上的依附物（不含风筒）。
    pub fn attachments_of(&self, segment_id: EntityId) -> Vec<&Attachment> {
        self.dependents
            .get(&segment_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.attachments.get(id))
            .collect()
    }

    pub fn lining_of(&self, segment_id: EntityId) -> Option<&LiningOverlay> {
        self.dependents
            .get(&segment_id)
            .into_iter()
            .flatten()
            .find_map(|id| self.linings.get(id))
    }

    pub fn segments_at_junction(&self, junction_id: EntityId) -> Vec<&Segment> {
        self.junction_refs
            .get(&junction_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.segments.get(id))
            .collect()
    }

    pub fn bounds(&self) -> Option<Bounds3> {
        let mut bounds = Bounds3::empty();
        for segment in self.segments.values() {
            bounds.include_point(segment.start);
            bounds.include_point(segment.end);
        }
        for point in self.free_points.values() {
            bounds.include_point(point.position);
        }
        for junction in self.junctions.values() {
            bounds.include_point(junction.position);
        }
        if bounds.is_empty() { None } else { Some(bounds) }
    }

    // -----------------------------------------------------------------------
    // 变更操作
    // -----------------------------------------------------------------------

    /// 新建实体。依附物/风筒的所属巷道必须存在；相对位置会被夹紧到 [0, 1]。
    pub fn add(&mut self, request: CreateRequest) -> Result<(EntityId, Mutation), GraphError> {
        let id = self.allocate_id(request.requested_id())?;
        let decimals = self.decimals;
        let mut staging = Staging::new(self);

        let record = match request {
            CreateRequest::Segment(spec) => {
                Record::Segment(sanitize_segment(segment_from_spec(id, spec), decimals)?)
            }
            CreateRequest::Attachment(spec) => {
                let segment = staging.segment(spec.segment_id).ok_or_else(|| {
                    GraphError::integrity(format!(
                        "attachment references missing segment {}",
                        spec.segment_id
                    ))
                })?;
                let mut attachment = sanitize_attachment(attachment_from_spec(id, spec))?;
                refresh_attachment(&mut attachment, &segment, decimals);
                Record::Attachment(attachment)
            }
            CreateRequest::Lining(spec) => {
                let segment = staging.segment(spec.segment_id).ok_or_else(|| {
                    GraphError::integrity(format!(
                        "lining references missing segment {}",
                        spec.segment_id
                    ))
                })?;
                if let Some(existing) = staging.lining_for(spec.segment_id) {
                    return Err(GraphError::integrity(format!(
                        "segment {} already carries lining {}",
                        spec.segment_id, existing
                    )));
                }
                let mut lining = sanitize_lining(lining_from_spec(id, spec))?;
                refresh_lining(&mut lining, &segment, decimals);
                Record::Lining(lining)
            }
            CreateRequest::FreePoint(spec) => {
                Record::FreePoint(sanitize_free_point(free_point_from_spec(id, spec), decimals)?)
            }
            CreateRequest::Junction(spec) => {
                Record::Junction(sanitize_junction(junction_from_spec(id, spec), decimals)?)
            }
        };

        staging.put(record);
        let mutation = staging.finish(vec![id])?;
        self.commit(&mutation.current);
        debug!(id = id.get(), "实体已创建");
        Ok((id, mutation))
    }

    pub fn update(&mut self, id: EntityId, patch: Patch) -> Result<Mutation, GraphError> {
        self.update_batch(vec![(id, patch)])
    }

    /// 批量更新：任一目标缺失则整体拒绝。巷道几何变化会在同一变更内重算全部依附物。
    pub fn update_batch(
        &mut self,
        patches: Vec<(EntityId, Patch)>,
    ) -> Result<Mutation, GraphError> {
        if let Some((missing, _)) = patches.iter().find(|(id, _)| !self.contains(*id)) {
            return Err(GraphError::NotFound(*missing));
        }

        let decimals = self.decimals;
        let mut staging = Staging::new(self);
        let mut affected = Vec::with_capacity(patches.len());
        let mut moved_segments = BTreeSet::new();
        let mut moved_dependents = BTreeSet::new();

        for (id, patch) in patches {
            affected.push(id);
            let record = staging.record(RecordKey::Entity(id)).ok_or(GraphError::NotFound(id))?;
            match (record, patch) {
                (Record::Segment(mut segment), Patch::Segment(patch)) => {
                    if patch_segment(&mut segment, patch, decimals)? {
                        moved_segments.insert(id);
                    }
                    staging.put(Record::Segment(segment));
                }
                (Record::Attachment(mut attachment), Patch::Attachment(patch)) => {
                    patch_attachment(&mut attachment, patch)?;
                    if staging.segment(attachment.segment_id).is_none() {
                        return Err(GraphError::integrity(format!(
                            "attachment {id} cannot move to missing segment {}",
                            attachment.segment_id
                        )));
                    }
                    moved_dependents.insert(id);
                    staging.put(Record::Attachment(attachment));
                }
                (Record::Lining(mut lining), Patch::Lining(patch)) => {
                    patch_lining(&mut lining, patch)?;
                    moved_dependents.insert(id);
                    staging.put(Record::Lining(lining));
                }
                (Record::FreePoint(mut point), Patch::FreePoint(patch)) => {
                    patch_free_point(&mut point, patch, decimals)?;
                    staging.put(Record::FreePoint(point));
                }
                (Record::Junction(mut junction), Patch::Junction(patch)) => {
                    let moved = patch_junction(&mut junction, patch, decimals)?;
                    let position = junction.position;
                    staging.put(Record::Junction(junction));
                    if moved {
                        for segment_id in staging.segments_at_junction(id) {
                            let Some(mut segment) = staging.segment(segment_id) else {
                                continue;
                            };
                            if segment.start_junction == Some(id) {
                                segment.start = position;
                            }
                            if segment.end_junction == Some(id) {
                                segment.end = position;
                            }
                            let segment = sanitize_segment(segment, decimals)?;
                            staging.put(Record::Segment(segment));
                            moved_segments.insert(segment_id);
                            affected.push(segment_id);
                        }
                    }
                }
                (record, patch) => {
                    return Err(GraphError::validation(format!(
                        "patch {} does not match entity {id} of kind {}",
                        patch_name(&patch),
                        record
                            .entity_kind()
                            .map(|kind| kind.to_string())
                            .unwrap_or_default()
                    )));
                }
            }
        }

        for segment_id in &moved_segments {
            for dependent in staging.dependents_of(*segment_id) {
                moved_dependents.insert(dependent);
            }
        }
        for dependent in moved_dependents {
            if staging.refresh_dependent(dependent, decimals) {
                affected.push(dependent);
            }
        }

        let mutation = staging.finish(affected)?;
        self.commit(&mutation.current);
        debug!(
            affected = mutation.affected.len(),
            records = mutation.current.len(),
            "实体已更新"
        );
        Ok(mutation)
    }

    /// 删除单个实体。巷道级联删除其依附物、风筒与参数集；节点删除会解除巷道引用。
    pub fn remove(&mut self, id: EntityId) -> Result<Mutation, GraphError> {
        self.remove_batch(&[id])
    }

    pub fn remove_batch(&mut self, ids: &[EntityId]) -> Result<Mutation, GraphError> {
        if let Some(missing) = ids.iter().find(|id| !self.contains(**id)) {
            return Err(GraphError::NotFound(*missing));
        }

        let decimals = self.decimals;
        let mut staging = Staging::new(self);
        let targets: BTreeSet<EntityId> = ids.iter().copied().collect();
        let mut affected = Vec::new();

        for &id in &targets {
            if staging.record(RecordKey::Entity(id)).is_none() {
                // 已被同批次内的级联删除
                continue;
            }
            let kind = staging.graph.kinds[&id];
            if kind == EntityKind::Segment {
                for dependent in staging.dependents_of(id) {
                    staging.remove_entity(dependent);
                    affected.push(dependent);
                }
            }
            if kind == EntityKind::Junction {
                for segment_id in staging.segments_at_junction(id) {
                    if targets.contains(&segment_id) {
                        continue;
                    }
                    let Some(mut segment) = staging.segment(segment_id) else {
                        continue;
                    };
                    if segment.start_junction == Some(id) {
                        segment.start_junction = None;
                    }
                    if segment.end_junction == Some(id) {
                        segment.end_junction = None;
                    }
                    staging.put(Record::Segment(sanitize_segment(segment, decimals)?));
                    affected.push(segment_id);
                }
            }
            staging.remove_entity(id);
            affected.push(id);
        }

        let mutation = staging.finish(affected)?;
        self.commit(&mutation.current);
        debug!(removed = mutation.removed_ids().len(), "实体已删除");
        Ok(mutation)
    }

    /// 为实体挂载（或整体替换）参数集。
    pub fn set_parameters(
        &mut self,
        entity_id: EntityId,
        values: BTreeMap<String, ParamValue>,
    ) -> Result<Mutation, GraphError> {
        if !self.contains(entity_id) {
            return Err(GraphError::NotFound(entity_id));
        }
        for (name, value) in &values {
            if let ParamValue::Number(number) = value {
                require_finite(name, *number)?;
            }
        }
        let mut staging = Staging::new(self);
        staging.put(Record::Parameters(ParameterSet { entity_id, values }));
        let mutation = staging.finish(vec![entity_id])?;
        self.commit(&mutation.current);
        Ok(mutation)
    }

    /// 移除参数集；实体没有参数集时返回空变更。
    pub fn clear_parameters(&mut self, entity_id: EntityId) -> Result<Mutation, GraphError> {
        if !self.contains(entity_id) {
            return Err(GraphError::NotFound(entity_id));
        }
        let mut staging = Staging::new(self);
        staging.delete(RecordKey::Parameters(entity_id));
        let mutation = staging.finish(vec![entity_id])?;
        self.commit(&mutation.current);
        Ok(mutation)
    }

    pub fn set_settings(&mut self, settings: SceneSettings) -> Result<Mutation, GraphError> {
        require_point("scene center", settings.scene_center)?;
        if !settings.scale.is_finite() || settings.scale <= 0.0 {
            return Err(GraphError::validation("scale must be a positive number"));
        }
        let settings = SceneSettings {
            scene_center: settings.scene_center.rounded(self.decimals),
            scale: settings.scale,
        };
        let mut staging = Staging::new(self);
        staging.put(Record::Settings(settings));
        let mutation = staging.finish(Vec::new())?;
        self.commit(&mutation.current);
        Ok(mutation)
    }

    /// 以快照整体替换当前场景，返回可整体撤销的变更。
    pub fn replace(&mut self, snapshot: &SceneSnapshot) -> Result<Mutation, GraphError> {
        let target = build_from_snapshot(snapshot, self.decimals)?;
        let mut keys: BTreeSet<RecordKey> = self.record_keys().into_iter().collect();
        keys.extend(target.record_keys());

        let mut staging = Staging::new(self);
        let mut affected = Vec::new();
        for key in keys {
            match target.record(key) {
                Some(record) => staging.put(record),
                None => staging.delete(key),
            }
            if let RecordKey::Entity(id) = key {
                affected.push(id);
            }
        }
        let mutation = staging.finish(affected)?;
        self.commit(&mutation.current);
        debug!(records = mutation.current.len(), "场景已整体替换");
        Ok(mutation)
    }

    /// 应用一组记录状态（撤销/重做回放）。结果不满足引用完整性时整体拒绝。
    pub fn apply(&mut self, delta: &StateDelta) -> Result<(), GraphError> {
        let mut staging = Staging::new(self);
        for entry in &delta.entries {
            if let Some(record) = &entry.state {
                if record.key() != entry.key {
                    return Err(GraphError::integrity(format!(
                        "delta entry {:?} carries record for {:?}",
                        entry.key,
                        record.key()
                    )));
                }
            }
            match &entry.state {
                Some(record) => staging.put(record.clone()),
                None => staging.delete(entry.key),
            }
        }
        staging.validate()?;
        self.commit(delta);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 序列化
    // -----------------------------------------------------------------------

    /// 深拷贝整图为快照。
    pub fn serialize(&self) -> SceneSnapshot {
        SceneSnapshot {
            segments: self.segments.values().cloned().collect(),
            attachments: self.attachments.values().cloned().collect(),
            lining_overlays: self.linings.values().cloned().collect(),
            free_points: self.free_points.values().cloned().collect(),
            junctions: self.junctions.values().cloned().collect(),
            parameter_sets: self.parameters.values().cloned().collect(),
            scene_center: self.settings.scene_center,
            scale: self.settings.scale,
        }
    }

    /// 以快照内容替换当前图（不产生历史）。失败时当前图保持不变。
    pub fn deserialize(&mut self, snapshot: &SceneSnapshot) -> Result<(), GraphError> {
        let mut rebuilt = build_from_snapshot(snapshot, self.decimals)?;
        rebuilt.next_id = rebuilt.next_id.max(self.next_id);
        rebuilt.retired = mem::take(&mut self.retired);
        rebuilt.retired.extend(self.kinds.keys().copied());
        let live: Vec<EntityId> = rebuilt.kinds.keys().copied().collect();
        for id in live {
            rebuilt.retired.remove(&id);
        }
        *self = rebuilt;
        debug!(entities = self.len(), "快照已载入实体图");
        Ok(())
    }

    /// 面向渲染/UI 的扁平只读投影。
    pub fn scene_data(&self) -> SceneData {
        let mut items = Vec::with_capacity(self.kinds.len());
        let has_params = |id: &EntityId| self.parameters.contains_key(id);
        for segment in self.segments.values() {
            items.push(SceneItem {
                id: segment.id,
                kind: EntityKind::Segment,
                name: segment.name.clone(),
                position: Point3::from_vec((segment.start.as_vec3() + segment.end.as_vec3()) * 0.5),
                segment_id: None,
                length: Some(segment.length()),
                angle: Some(segment.angle()),
                has_parameters: has_params(&segment.id),
            });
        }
        for attachment in self.attachments.values() {
            items.push(SceneItem {
                id: attachment.id,
                kind: attachment.kind(),
                name: attachment.name.clone(),
                position: attachment.position,
                segment_id: Some(attachment.segment_id),
                length: None,
                angle: None,
                has_parameters: has_params(&attachment.id),
            });
        }
        for lining in self.linings.values() {
            items.push(SceneItem {
                id: lining.id,
                kind: EntityKind::Lining,
                name: lining.name.clone(),
                position: Point3::from_vec((lining.start.as_vec3() + lining.end.as_vec3()) * 0.5),
                segment_id: Some(lining.segment_id),
                length: Some(lining.start.distance(lining.end)),
                angle: None,
                has_parameters: has_params(&lining.id),
            });
        }
        for point in self.free_points.values() {
            items.push(SceneItem {
                id: point.id,
                kind: EntityKind::FreePoint,
                name: point.name.clone(),
                position: point.position,
                segment_id: None,
                length: None,
                angle: None,
                has_parameters: has_params(&point.id),
            });
        }
        for junction in self.junctions.values() {
            items.push(SceneItem {
                id: junction.id,
                kind: EntityKind::Junction,
                name: junction.name.clone(),
                position: junction.position,
                segment_id: None,
                length: None,
                angle: None,
                has_parameters: has_params(&junction.id),
            });
        }
        SceneData {
            items,
            scene_center: self.settings.scene_center,
            scale: self.settings.scale,
        }
    }

    // -----------------------------------------------------------------------
    // 内部：记录访问与提交
    // -----------------------------------------------------------------------

    fn allocate_id(&self, requested: Option<EntityId>) -> Result<EntityId, GraphError> {
        match requested {
            Some(id) if self.kinds.contains_key(&id) => Err(GraphError::validation(format!(
                "id {id} is already in use"
            ))),
            Some(id) if self.retired.contains(&id) => Err(GraphError::validation(format!(
                "id {id} belonged to a deleted entity and cannot be reused"
            ))),
            Some(id) => check_id_range(id).map(|()| id),
            None if self.next_id == EntityId::MAX.get() => {
                Err(GraphError::validation("entity id space is exhausted"))
            }
            None => Ok(EntityId::new(self.next_id)),
        }
    }

    fn record(&self, key: RecordKey) -> Option<Record> {
        match key {
            RecordKey::Settings => Some(Record::Settings(self.settings)),
            RecordKey::Parameters(id) => self.parameters.get(&id).cloned().map(Record::Parameters),
            RecordKey::Entity(id) => match self.kinds.get(&id)? {
                EntityKind::Segment => self.segments.get(&id).cloned().map(Record::Segment),
                EntityKind::Fan | EntityKind::Structure | EntityKind::Decoration => {
                    self.attachments.get(&id).cloned().map(Record::Attachment)
                }
                EntityKind::Lining => self.linings.get(&id).cloned().map(Record::Lining),
                EntityKind::FreePoint => self.free_points.get(&id).cloned().map(Record::FreePoint),
                EntityKind::Junction => self.junctions.get(&id).cloned().map(Record::Junction),
            },
        }
    }

    fn record_keys(&self) -> Vec<RecordKey> {
        let mut keys = Vec::with_capacity(self.kinds.len() + self.parameters.len() + 1);
        keys.push(RecordKey::Settings);
        keys.extend(self.kinds.keys().map(|id| RecordKey::Entity(*id)));
        keys.extend(self.parameters.keys().map(|id| RecordKey::Parameters(*id)));
        keys
    }

    /// 提交已校验的增量：先摘除旧记录再写入新记录，保证索引一致。
    fn commit(&mut self, delta: &StateDelta) {
        for entry in &delta.entries {
            self.detach(entry.key);
        }
        for entry in &delta.entries {
            if let Some(record) = &entry.state {
                self.attach(record.clone());
            }
        }
    }

    fn detach(&mut self, key: RecordKey) {
        let id = match key {
            RecordKey::Settings => return,
            RecordKey::Parameters(id) => {
                self.parameters.remove(&id);
                return;
            }
            RecordKey::Entity(id) => id,
        };
        let Some(kind) = self.kinds.remove(&id) else {
            return;
        };
        match kind {
            EntityKind::Segment => {
                if let Some(segment) = self.segments.remove(&id) {
                    for junction in segment.junctions() {
                        unlink(&mut self.junction_refs, junction, id);
                    }
                }
            }
            EntityKind::Fan | EntityKind::Structure | EntityKind::Decoration => {
                if let Some(attachment) = self.attachments.remove(&id) {
                    unlink(&mut self.dependents, attachment.segment_id, id);
                }
            }
            EntityKind::Lining => {
                if let Some(lining) = self.linings.remove(&id) {
                    unlink(&mut self.dependents, lining.segment_id, id);
                }
            }
            EntityKind::FreePoint => {
                self.free_points.remove(&id);
            }
            EntityKind::Junction => {
                self.junctions.remove(&id);
            }
        }
        self.retired.insert(id);
    }

    fn attach(&mut self, record: Record) {
        let id = match record {
            Record::Settings(settings) => {
                self.settings = settings;
                return;
            }
            Record::Parameters(params) => {
                self.parameters.insert(params.entity_id, params);
                return;
            }
            Record::Segment(segment) => {
                let id = segment.id;
                for junction in segment.junctions() {
                    self.junction_refs.entry(junction).or_default().insert(id);
                }
                self.kinds.insert(id, EntityKind::Segment);
                self.segments.insert(id, segment);
                id
            }
            Record::Attachment(attachment) => {
                let id = attachment.id;
                self.dependents
                    .entry(attachment.segment_id)
                    .or_default()
                    .insert(id);
                self.kinds.insert(id, attachment.kind());
                self.attachments.insert(id, attachment);
                id
            }
            Record::Lining(lining) => {
                let id = lining.id;
                self.dependents.entry(lining.segment_id).or_default().insert(id);
                self.kinds.insert(id, EntityKind::Lining);
                self.linings.insert(id, lining);
                id
            }
            Record::FreePoint(point) => {
                let id = point.id;
                self.kinds.insert(id, EntityKind::FreePoint);
                self.free_points.insert(id, point);
                id
            }
            Record::Junction(junction) => {
                let id = junction.id;
                self.kinds.insert(id, EntityKind::Junction);
                self.junctions.insert(id, junction);
                id
            }
        };
        self.retired.remove(&id);
        if let Some(next) = id.get().checked_add(1) {
            self.next_id = self.next_id.max(next);
        }
    }
}

fn unlink(index: &mut HashMap<EntityId, BTreeSet<EntityId>>, owner: EntityId, id: EntityId) {
    if let Some(set) = index.get_mut(&owner) {
        set.remove(&id);
        if set.is_empty() {
            index.remove(&owner);
        }
    }
}

// ---------------------------------------------------------------------------
// Staging：写时复制的变更覆盖层
// ---------------------------------------------------------------------------

struct Staging<'g> {
    graph: &'g EntityGraph,
    pending: HashMap<RecordKey, Option<Record>>,
    order: Vec<RecordKey>,
}

impl<'g> Staging<'g> {
    fn new(graph: &'g EntityGraph) -> Self {
        Self {
            graph,
            pending: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn record(&self, key: RecordKey) -> Option<Record> {
        match self.pending.get(&key) {
            Some(state) => state.clone(),
            None => self.graph.record(key),
        }
    }

    fn contains_entity(&self, id: EntityId) -> bool {
        match self.pending.get(&RecordKey::Entity(id)) {
            Some(state) => state.is_some(),
            None => self.graph.contains(id),
        }
    }

    fn segment(&self, id: EntityId) -> Option<Segment> {
        match self.record(RecordKey::Entity(id)) {
            Some(Record::Segment(segment)) => Some(segment),
            _ => None,
        }
    }

    fn put(&mut self, record: Record) {
        let key = record.key();
        self.touch(key);
        self.pending.insert(key, Some(record));
    }

    fn delete(&mut self, key: RecordKey) {
        self.touch(key);
        self.pending.insert(key, None);
    }

    /// 删除实体及其参数集。
    fn remove_entity(&mut self, id: EntityId) {
        self.delete(RecordKey::Entity(id));
        if self.record(RecordKey::Parameters(id)).is_some() {
            self.delete(RecordKey::Parameters(id));
        }
    }

    fn touch(&mut self, key: RecordKey) {
        if !self.pending.contains_key(&key) {
            self.order.push(key);
        }
    }

    fn dependents_of(&self, segment_id: EntityId) -> Vec<EntityId> {
        let mut ids = self
            .graph
            .dependents
            .get(&segment_id)
            .cloned()
            .unwrap_or_default();
        for (key, state) in &self.pending {
            let RecordKey::Entity(id) = *key else {
                continue;
            };
            let owner = match state {
                Some(Record::Attachment(attachment)) => Some(attachment.segment_id),
                Some(Record::Lining(lining)) => Some(lining.segment_id),
                _ => None,
            };
            if owner == Some(segment_id) {
                ids.insert(id);
            } else {
                ids.remove(&id);
            }
        }
        ids.into_iter().collect()
    }

    fn lining_for(&self, segment_id: EntityId) -> Option<EntityId> {
        self.dependents_of(segment_id)
            .into_iter()
            .find(|id| matches!(self.record(RecordKey::Entity(*id)), Some(Record::Lining(_))))
    }

    fn segments_at_junction(&self, junction_id: EntityId) -> Vec<EntityId> {
        let mut ids = self
            .graph
            .junction_refs
            .get(&junction_id)
            .cloned()
            .unwrap_or_default();
        for (key, state) in &self.pending {
            let RecordKey::Entity(id) = *key else {
                continue;
            };
            match state {
                Some(Record::Segment(segment)) if segment.junctions().any(|j| j == junction_id) => {
                    ids.insert(id);
                }
                _ => {
                    ids.remove(&id);
                }
            }
        }
        ids.into_iter().collect()
    }

    /// 按暂存中的巷道重算依附物/风筒缓存，返回是否找到了该依附实体。
    fn refresh_dependent(&mut self, id: EntityId, decimals: u32) -> bool {
        match self.record(RecordKey::Entity(id)) {
            Some(Record::Attachment(mut attachment)) => {
                let Some(segment) = self.segment(attachment.segment_id) else {
                    return false;
                };
                refresh_attachment(&mut attachment, &segment, decimals);
                self.put(Record::Attachment(attachment));
                true
            }
            Some(Record::Lining(mut lining)) => {
                let Some(segment) = self.segment(lining.segment_id) else {
                    return false;
                };
                refresh_lining(&mut lining, &segment, decimals);
                self.put(Record::Lining(lining));
                true
            }
            _ => false,
        }
    }

    /// 校验暂存结果的引用完整性。
    fn validate(&self) -> Result<(), GraphError> {
        for key in &self.order {
            let state = &self.pending[key];
            match (*key, state) {
                (RecordKey::Entity(id), state) => {
                    // 原为巷道/节点的记录被删除或换成其他类型时，引用方必须一并处理
                    let still_segment = matches!(state, Some(Record::Segment(_)));
                    let still_junction = matches!(state, Some(Record::Junction(_)));
                    match self.graph.record(*key) {
                        Some(Record::Segment(_))
                            if !still_segment && !self.dependents_of(id).is_empty() =>
                        {
                            return Err(GraphError::integrity(format!(
                                "segment {id} cannot be removed while dependents remain"
                            )));
                        }
                        Some(Record::Junction(_))
                            if !still_junction && !self.segments_at_junction(id).is_empty() =>
                        {
                            return Err(GraphError::integrity(format!(
                                "junction {id} is still referenced by segments"
                            )));
                        }
                        _ => {}
                    }
                    match state {
                        Some(record) => self.validate_references(id, record)?,
                        None if self.record(RecordKey::Parameters(id)).is_some() => {
                            return Err(GraphError::integrity(format!(
                                "parameter set of entity {id} would be orphaned"
                            )));
                        }
                        None => {}
                    }
                }
                (RecordKey::Parameters(id), Some(_)) => {
                    if !self.contains_entity(id) {
                        return Err(GraphError::integrity(format!(
                            "parameter set references missing entity {id}"
                        )));
                    }
                }
                (RecordKey::Settings, None) => {
                    return Err(GraphError::integrity("scene settings cannot be removed"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn validate_references(&self, id: EntityId, record: &Record) -> Result<(), GraphError> {
        match record {
            Record::Attachment(attachment) => {
                if self.segment(attachment.segment_id).is_none() {
                    return Err(GraphError::integrity(format!(
                        "attachment {id} references missing segment {}",
                        attachment.segment_id
                    )));
                }
            }
            Record::Lining(lining) => {
                if self.segment(lining.segment_id).is_none() {
                    return Err(GraphError::integrity(format!(
                        "lining {id} references missing segment {}",
                        lining.segment_id
                    )));
                }
                let others = self
                    .dependents_of(lining.segment_id)
                    .into_iter()
                    .filter(|other| *other != id)
                    .any(|other| {
                        matches!(self.record(RecordKey::Entity(other)), Some(Record::Lining(_)))
                    });
                if others {
                    return Err(GraphError::integrity(format!(
                        "segment {} carries more than one lining",
                        lining.segment_id
                    )));
                }
            }
            Record::Segment(segment) => {
                for junction in segment.junctions() {
                    if !matches!(
                        self.record(RecordKey::Entity(junction)),
                        Some(Record::Junction(_))
                    ) {
                        return Err(GraphError::integrity(format!(
                            "segment {id} references missing junction {junction}"
                        )));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// 校验并折叠为变更；前后状态相同的记录被剔除。
    fn finish(self, affected: Vec<EntityId>) -> Result<Mutation, GraphError> {
        self.validate()?;
        let mut previous = Vec::new();
        let mut current = Vec::new();
        for key in &self.order {
            let after = self.pending[key].clone();
            let before = self.graph.record(*key);
            if before == after {
                continue;
            }
            previous.push(DeltaEntry {
                key: *key,
                state: before,
            });
            current.push(DeltaEntry {
                key: *key,
                state: after,
            });
        }
        previous.reverse();

        let mut seen = HashSet::new();
        let changed: HashSet<RecordKey> = current.iter().map(|entry| entry.key).collect();
        let affected = affected
            .into_iter()
            .filter(|id| {
                changed.contains(&RecordKey::Entity(*id))
                    || changed.contains(&RecordKey::Parameters(*id))
            })
            .filter(|id| seen.insert(*id))
            .collect();

        Ok(Mutation {
            previous: StateDelta { entries: previous },
            current: StateDelta { entries: current },
            affected,
        })
    }
}

// ---------------------------------------------------------------------------
// 构建、校验与补丁
// ---------------------------------------------------------------------------

fn build_from_snapshot(snapshot: &SceneSnapshot, decimals: u32) -> Result<EntityGraph, GraphError> {
    let mut graph = EntityGraph::with_precision(decimals);
    let mut staging = Staging::new(&graph);
    let mut seen = HashSet::new();
    let mut claim = |id: EntityId| {
        check_id_range(id)?;
        if seen.insert(id) {
            Ok(())
        } else {
            Err(GraphError::integrity(format!("duplicate entity id {id}")))
        }
    };

    for segment in &snapshot.segments {
        claim(segment.id)?;
        staging.put(Record::Segment(sanitize_segment(segment.clone(), decimals)?));
    }
    for junction in &snapshot.junctions {
        claim(junction.id)?;
        staging.put(Record::Junction(sanitize_junction(junction.clone(), decimals)?));
    }
    for point in &snapshot.free_points {
        claim(point.id)?;
        staging.put(Record::FreePoint(sanitize_free_point(point.clone(), decimals)?));
    }
    for attachment in &snapshot.attachments {
        claim(attachment.id)?;
        let segment = staging.segment(attachment.segment_id).ok_or_else(|| {
            GraphError::integrity(format!(
                "attachment {} references missing segment {}",
                attachment.id, attachment.segment_id
            ))
        })?;
        let mut attachment = sanitize_attachment(attachment.clone())?;
        refresh_attachment(&mut attachment, &segment, decimals);
        staging.put(Record::Attachment(attachment));
    }
    for lining in &snapshot.lining_overlays {
        claim(lining.id)?;
        let segment = staging.segment(lining.segment_id).ok_or_else(|| {
            GraphError::integrity(format!(
                "lining {} references missing segment {}",
                lining.id, lining.segment_id
            ))
        })?;
        let mut lining = sanitize_lining(lining.clone())?;
        refresh_lining(&mut lining, &segment, decimals);
        staging.put(Record::Lining(lining));
    }
    let mut param_owners = HashSet::new();
    for params in &snapshot.parameter_sets {
        if !param_owners.insert(params.entity_id) {
            return Err(GraphError::integrity(format!(
                "duplicate parameter set for entity {}",
                params.entity_id
            )));
        }
        staging.put(Record::Parameters(params.clone()));
    }
    require_point("scene center", snapshot.scene_center)?;
    if !snapshot.scale.is_finite() || snapshot.scale <= 0.0 {
        return Err(GraphError::validation("scale must be a positive number"));
    }
    staging.put(Record::Settings(SceneSettings {
        scene_center: snapshot.scene_center.rounded(decimals),
        scale: snapshot.scale,
    }));

    let mutation = staging.finish(Vec::new())?;
    graph.commit(&mutation.current);
    Ok(graph)
}

fn refresh_attachment(attachment: &mut Attachment, segment: &Segment, decimals: u32) {
    let placement = resolver::position_of(
        segment,
        attachment.relative_position,
        attachment.side,
        attachment.lateral_offset,
    );
    attachment.position = placement.position.rounded(decimals);
    attachment.forward = placement.forward.rounded(decimals);
}

fn refresh_lining(lining: &mut LiningOverlay, segment: &Segment, decimals: u32) {
    let span = resolver::lining_span(segment, lining.clearance);
    lining.start = span.start.rounded(decimals);
    lining.end = span.end.rounded(decimals);
    lining.radius = crate::geometry::round_to(span.radius, decimals);
}

/// `EntityId::MAX` 保留为计数器上界，不能分配给实体。
fn check_id_range(id: EntityId) -> Result<(), GraphError> {
    if id == EntityId::MAX {
        Err(GraphError::validation(format!("id {id} is out of range")))
    } else {
        Ok(())
    }
}

fn require_finite(name: &str, value: f64) -> Result<(), GraphError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(GraphError::validation(format!("{name} must be finite")))
    }
}

fn require_non_negative(name: &str, value: f64) -> Result<(), GraphError> {
    require_finite(name, value)?;
    if value > MAX_COORDINATE {
        return Err(GraphError::validation(format!(
            "{name} exceeds {MAX_COORDINATE:e}"
        )));
    }
    if value < 0.0 {
        Err(GraphError::validation(format!("{name} must not be negative")))
    } else {
        Ok(())
    }
}

fn require_point(name: &str, point: Point3) -> Result<(), GraphError> {
    if !point.is_finite() {
        return Err(GraphError::validation(format!("{name} must be finite")));
    }
    if [point.x(), point.y(), point.z()]
        .iter()
        .any(|value| value.abs() > MAX_COORDINATE)
    {
        return Err(GraphError::validation(format!(
            "{name} is outside ±{MAX_COORDINATE:e}"
        )));
    }
    Ok(())
}

fn sanitize_segment(mut segment: Segment, decimals: u32) -> Result<Segment, GraphError> {
    require_point("segment start", segment.start)?;
    require_point("segment end", segment.end)?;
    require_non_negative("width", segment.width)?;
    require_non_negative("height", segment.height)?;
    require_non_negative("size", segment.size)?;
    require_finite("airflow", segment.airflow)?;
    require_finite("key area", segment.key_area)?;
    segment.start = segment.start.rounded(decimals);
    segment.end = segment.end.rounded(decimals);
    if segment.length() <= MIN_SEGMENT_LENGTH {
        return Err(GraphError::validation(format!(
            "segment {} has coincident endpoints",
            segment.id
        )));
    }
    Ok(segment)
}

fn sanitize_attachment(mut attachment: Attachment) -> Result<Attachment, GraphError> {
    if attachment.relative_position.is_nan() {
        return Err(GraphError::validation("relative position must be a number"));
    }
    attachment.relative_position = resolver::clamp_relative(attachment.relative_position);
    require_non_negative("lateral offset", attachment.lateral_offset)?;
    match &attachment.payload {
        AttachmentPayload::Fan(fan) => {
            require_finite("fan velocity", fan.velocity)?;
            require_finite("fan pressure", fan.pressure)?;
        }
        AttachmentPayload::Structure(structure) => {
            for value in &structure.numbers {
                require_finite("structure number", *value)?;
            }
        }
        AttachmentPayload::Decoration(_) => {}
    }
    Ok(attachment)
}

fn sanitize_lining(lining: LiningOverlay) -> Result<LiningOverlay, GraphError> {
    require_non_negative("lining clearance", lining.clearance)?;
    Ok(lining)
}

fn sanitize_free_point(mut point: FreePoint, decimals: u32) -> Result<FreePoint, GraphError> {
    require_point("free point position", point.position)?;
    require_finite("distance", point.distance)?;
    require_finite("radian", point.radian)?;
    require_finite("angle", point.angle)?;
    point.position = point.position.rounded(decimals);
    Ok(point)
}

fn sanitize_junction(mut junction: JunctionPoint, decimals: u32) -> Result<JunctionPoint, GraphError> {
    require_point("junction position", junction.position)?;
    junction.position = junction.position.rounded(decimals);
    Ok(junction)
}

fn segment_from_spec(id: EntityId, spec: SegmentSpec) -> Segment {
    Segment {
        id,
        name: spec.name,
        start: spec.start,
        end: spec.end,
        width: spec.width,
        height: spec.height,
        size: spec.size,
        color: spec.color,
        airflow: spec.airflow,
        key_area: spec.key_area,
        start_junction: spec.start_junction,
        end_junction: spec.end_junction,
        node_id: spec.node_id,
        group_id: spec.group_id,
    }
}

fn attachment_from_spec(id: EntityId, spec: AttachmentSpec) -> Attachment {
    Attachment {
        id,
        name: spec.name,
        segment_id: spec.segment_id,
        relative_position: spec.relative_position,
        side: spec.side,
        lateral_offset: spec.lateral_offset,
        payload: spec.payload,
        position: Point3::ORIGIN,
        forward: Default::default(),
    }
}

fn lining_from_spec(id: EntityId, spec: LiningSpec) -> LiningOverlay {
    LiningOverlay {
        id,
        name: spec.name,
        segment_id: spec.segment_id,
        color: spec.color,
        clearance: spec.clearance,
        start: Point3::ORIGIN,
        end: Point3::ORIGIN,
        radius: 0.0,
    }
}

fn free_point_from_spec(id: EntityId, spec: FreePointSpec) -> FreePoint {
    FreePoint {
        id,
        name: spec.name,
        position: spec.position,
        distance: spec.distance,
        radian: spec.radian,
        angle: spec.angle,
    }
}

fn junction_from_spec(id: EntityId, spec: JunctionSpec) -> JunctionPoint {
    JunctionPoint {
        id,
        name: spec.name,
        position: spec.position,
    }
}

fn patch_name(patch: &Patch) -> &'static str {
    match patch {
        Patch::Segment(_) => "segment",
        Patch::Attachment(_) => "attachment",
        Patch::Lining(_) => "lining",
        Patch::FreePoint(_) => "freePoint",
        Patch::Junction(_) => "junction",
    }
}

/// 应用巷道补丁，返回几何（端点或断面）是否发生变化。
fn patch_segment(
    segment: &mut Segment,
    patch: SegmentPatch,
    decimals: u32,
) -> Result<bool, GraphError> {
    let before = (segment.start, segment.end, segment.width, segment.height);
    if let Some(name) = patch.name {
        segment.name = name;
    }
    if let Some(start) = patch.start {
        segment.start = start;
    }
    if let Some(end) = patch.end {
        segment.end = end;
    }
    if let Some(width) = patch.width {
        segment.width = width;
    }
    if let Some(height) = patch.height {
        segment.height = height;
    }
    if let Some(size) = patch.size {
        segment.size = size;
    }
    if let Some(color) = patch.color {
        segment.color = color;
    }
    if let Some(airflow) = patch.airflow {
        segment.airflow = airflow;
    }
    if let Some(key_area) = patch.key_area {
        segment.key_area = key_area;
    }
    if let Some(start_junction) = patch.start_junction {
        segment.start_junction = start_junction;
    }
    if let Some(end_junction) = patch.end_junction {
        segment.end_junction = end_junction;
    }
    if let Some(node_id) = patch.node_id {
        segment.node_id = node_id;
    }
    if let Some(group_id) = patch.group_id {
        segment.group_id = group_id;
    }
    *segment = sanitize_segment(segment.clone(), decimals)?;
    Ok(before != (segment.start, segment.end, segment.width, segment.height))
}

fn patch_attachment(attachment: &mut Attachment, patch: AttachmentPatch) -> Result<(), GraphError> {
    if let Some(payload) = patch.payload {
        if payload.kind() != attachment.kind() {
            return Err(GraphError::validation(format!(
                "attachment {} is a {} and cannot become a {}",
                attachment.id,
                attachment.kind(),
                payload.kind()
            )));
        }
        attachment.payload = payload;
    }
    if let Some(name) = patch.name {
        attachment.name = name;
    }
    if let Some(segment_id) = patch.segment_id {
        attachment.segment_id = segment_id;
    }
    if let Some(relative_position) = patch.relative_position {
        attachment.relative_position = relative_position;
    }
    if let Some(side) = patch.side {
        attachment.side = side;
    }
    if let Some(lateral_offset) = patch.lateral_offset {
        attachment.lateral_offset = lateral_offset;
    }
    *attachment = sanitize_attachment(attachment.clone())?;
    Ok(())
}

fn patch_lining(lining: &mut LiningOverlay, patch: LiningPatch) -> Result<(), GraphError> {
    if let Some(name) = patch.name {
        lining.name = name;
    }
    if let Some(color) = patch.color {
        lining.color = color;
    }
    if let Some(clearance) = patch.clearance {
        lining.clearance = clearance;
    }
    *lining = sanitize_lining(lining.clone())?;
    Ok(())
}

fn patch_free_point(
    point: &mut FreePoint,
    patch: FreePointPatch,
    decimals: u32,
) -> Result<(), GraphError> {
    if let Some(name) = patch.name {
        point.name = name;
    }
    if let Some(position) = patch.position {
        point.position = position;
    }
    if let Some(distance) = patch.distance {
        point.distance = distance;
    }
    if let Some(radian) = patch.radian {
        point.radian = radian;
    }
    if let Some(angle) = patch.angle {
        point.angle = angle;
    }
    *point = sanitize_free_point(point.clone(), decimals)?;
    Ok(())
}

/// 应用节点补丁，返回位置是否变化。
fn patch_junction(
    junction: &mut JunctionPoint,
    patch: JunctionPatch,
    decimals: u32,
) -> Result<bool, GraphError> {
    let before = junction.position;
    if let Some(name) = patch.name {
        junction.name = name;
    }
    if let Some(position) = patch.position {
        junction.position = position;
    }
    *junction = sanitize_junction(junction.clone(), decimals)?;
    Ok(before != junction.position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{FanProps, Side};

    fn horizontal(graph: &mut EntityGraph, length: f64) -> EntityId {
        let spec = SegmentSpec::new(Point3::new(0.0, 0.0, 0.0), Point3::new(length, 0.0, 0.0));
        graph.add(CreateRequest::Segment(spec)).expect("add segment").0
    }

    fn fan(graph: &mut EntityGraph, segment: EntityId, t: f64) -> EntityId {
        graph
            .add(CreateRequest::Attachment(AttachmentSpec::fan(segment, t)))
            .expect("add fan")
            .0
    }

    #[test]
    fn ids_are_unique_across_kinds_and_never_reused() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        let fan_id = fan(&mut graph, seg, 0.5);
        let (junction, _) = graph
            .add(CreateRequest::Junction(JunctionSpec::new(Point3::new(0.0, 0.0, 0.0))))
            .unwrap();
        assert_ne!(seg, fan_id);
        assert_ne!(fan_id, junction);

        graph.remove(fan_id).unwrap();
        let again = fan(&mut graph, seg, 0.2);
        assert!(again.get() > junction.get());

        let reuse = graph.add(CreateRequest::Attachment(
            AttachmentSpec::fan(seg, 0.1).with_id(fan_id),
        ));
        assert!(matches!(reuse, Err(GraphError::Validation(_))));
    }

    #[test]
    fn caller_supplied_id_advances_counter() {
        let mut graph = EntityGraph::new();
        let spec = SegmentSpec::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0))
            .with_id(EntityId::new(100));
        let (id, _) = graph.add(CreateRequest::Segment(spec)).unwrap();
        assert_eq!(id, EntityId::new(100));
        let next = horizontal(&mut graph, 2.0);
        assert_eq!(next, EntityId::new(101));

        let duplicate = SegmentSpec::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0))
            .with_id(EntityId::new(100));
        assert!(matches!(
            graph.add(CreateRequest::Segment(duplicate)),
            Err(GraphError::Validation(_))
        ));
    }

    #[test]
    fn reserved_max_id_is_rejected_without_touching_counter() {
        let mut graph = EntityGraph::new();
        let spec = SegmentSpec::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0));
        let result = graph.add(CreateRequest::Segment(spec.clone().with_id(EntityId::MAX)));
        assert!(matches!(result, Err(GraphError::Validation(_))));
        assert!(graph.is_empty());
        assert_eq!(horizontal(&mut graph, 1.0), EntityId::new(1));

        let (last, _) = graph
            .add(CreateRequest::Segment(
                spec.clone().with_id(EntityId::new(u64::MAX - 1)),
            ))
            .expect("largest usable id");
        assert_eq!(last.get(), u64::MAX - 1);
        let exhausted = graph.add(CreateRequest::Segment(spec));
        assert!(matches!(exhausted, Err(GraphError::Validation(_))));
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn snapshot_with_reserved_id_is_rejected() {
        let mut source = EntityGraph::new();
        horizontal(&mut source, 3.0);
        let mut snapshot = source.serialize();
        snapshot.segments[0].id = EntityId::MAX;

        assert!(matches!(
            EntityGraph::from_snapshot(&snapshot),
            Err(GraphError::Validation(_))
        ));
        let before = source.serialize();
        assert!(source.replace(&snapshot).is_err());
        assert_eq!(source.serialize(), before);
    }

    #[test]
    fn oversized_coordinates_are_rejected_and_stored_values_stay_finite() {
        let mut graph = EntityGraph::new();
        let huge = graph.add(CreateRequest::Segment(SegmentSpec::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1e305, 0.0, 0.0),
        )));
        assert!(matches!(huge, Err(GraphError::Validation(_))));
        let wide = graph.add(CreateRequest::FreePoint(FreePointSpec::new(Point3::new(
            0.0,
            -2.0 * MAX_COORDINATE,
            0.0,
        ))));
        assert!(matches!(wide, Err(GraphError::Validation(_))));
        assert!(graph.is_empty());

        let far = MAX_COORDINATE;
        let (seg, _) = graph
            .add(CreateRequest::Segment(SegmentSpec::new(
                Point3::new(-far, 0.0, 0.0),
                Point3::new(far, 0.0, 0.0),
            )))
            .expect("segment at the coordinate limit");
        fan(&mut graph, seg, 0.75);

        let json = serde_json::to_string(&graph.serialize()).expect("serialize snapshot");
        let parsed: SceneSnapshot = serde_json::from_str(&json).expect("reparse snapshot");
        let restored = EntityGraph::from_snapshot(&parsed).expect("restore graph");
        assert_eq!(restored.serialize(), graph.serialize());
    }

    #[test]
    fn find_by_id_resolves_every_kind() {
        let mut graph = EntityGraph::new();
        let (junction, _) = graph
            .add(CreateRequest::Junction(JunctionSpec::new(Point3::new(10.0, 0.0, 0.0))))
            .unwrap();
        let seg = horizontal(&mut graph, 10.0);
        let fan_id = fan(&mut graph, seg, 0.5);
        let (door, _) = graph
            .add(CreateRequest::Attachment(AttachmentSpec::structure(seg, 0.2, "door")))
            .unwrap();
        let (lining, _) = graph
            .add(CreateRequest::Lining(LiningSpec::new(seg)))
            .unwrap();
        let (point, _) = graph
            .add(CreateRequest::FreePoint(FreePointSpec::new(Point3::new(1.0, 1.0, 0.0))))
            .unwrap();

        let expect = [
            (junction, EntityKind::Junction),
            (seg, EntityKind::Segment),
            (fan_id, EntityKind::Fan),
            (door, EntityKind::Structure),
            (lining, EntityKind::Lining),
            (point, EntityKind::FreePoint),
        ];
        for (id, kind) in expect {
            let found = graph.find_by_id(id).expect("entity should be found");
            assert_eq!(found.id(), id);
            assert_eq!(found.kind(), kind);
        }
        assert!(matches!(graph.find_by_id(seg), Some(EntityRef::Segment(s)) if s.end.x() == 10.0));
        assert!(matches!(
            graph.find_by_id(lining),
            Some(EntityRef::Lining(l)) if l.segment_id == seg
        ));
        assert_eq!(graph.lining_of(seg).map(|l| l.id), Some(lining));
        assert!(graph.find_by_id(EntityId::new(999)).is_none());

        graph.remove(seg).unwrap();
        assert!(graph.find_by_id(fan_id).is_none());
        assert!(graph.find_by_id(lining).is_none());
        assert!(graph.lining_of(seg).is_none());
        assert!(graph.find_by_id(junction).is_some());
    }

    #[test]
    fn attachment_requires_existing_segment_and_clamps_position() {
        let mut graph = EntityGraph::new();
        let missing = graph.add(CreateRequest::Attachment(AttachmentSpec::fan(
            EntityId::new(42),
            0.5,
        )));
        assert!(matches!(missing, Err(GraphError::Integrity(_))));
        assert!(graph.is_empty());

        let seg = horizontal(&mut graph, 10.0);
        let fan_id = fan(&mut graph, seg, 1.7);
        let attachment = graph.attachment(fan_id).unwrap();
        assert_eq!(attachment.relative_position, 1.0);
        assert_eq!(attachment.position, Point3::new(10.0, 0.0, 0.0));

        let nan = graph.add(CreateRequest::Attachment(AttachmentSpec::fan(seg, f64::NAN)));
        assert!(matches!(nan, Err(GraphError::Validation(_))));
    }

    #[test]
    fn degenerate_segment_is_rejected() {
        let mut graph = EntityGraph::new();
        let spec = SegmentSpec::new(Point3::new(1.0, 1.0, 1.0), Point3::new(1.0, 1.0, 1.0));
        assert!(matches!(
            graph.add(CreateRequest::Segment(spec)),
            Err(GraphError::Validation(_))
        ));
    }

    #[test]
    fn moving_segment_recomputes_dependents_in_one_mutation() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        let fan_id = fan(&mut graph, seg, 0.5);
        let (lining, _) = graph
            .add(CreateRequest::Lining(LiningSpec::new(seg)))
            .unwrap();
        assert_eq!(
            graph.attachment(fan_id).unwrap().position,
            Point3::new(5.0, 0.0, 0.0)
        );

        let mutation = graph
            .update(
                seg,
                Patch::Segment(SegmentPatch {
                    end: Some(Point3::new(20.0, 0.0, 0.0)),
                    ..SegmentPatch::default()
                }),
            )
            .unwrap();

        assert_eq!(
            graph.attachment(fan_id).unwrap().position,
            Point3::new(10.0, 0.0, 0.0)
        );
        assert_eq!(graph.lining(lining).unwrap().end, Point3::new(20.0, 0.0, 0.0));
        let written = mutation.written_ids();
        assert!(written.contains(&seg));
        assert!(written.contains(&fan_id));
        assert!(written.contains(&lining));
        assert_eq!(mutation.current.len(), 3);
    }

    #[test]
    fn renaming_segment_does_not_touch_dependents() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        fan(&mut graph, seg, 0.5);
        let mutation = graph
            .update(
                seg,
                Patch::Segment(SegmentPatch {
                    name: Some("main".into()),
                    ..SegmentPatch::default()
                }),
            )
            .unwrap();
        assert_eq!(mutation.affected, vec![seg]);
        assert_eq!(mutation.current.len(), 1);
    }

    #[test]
    fn removing_segment_cascades() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        let other = horizontal(&mut graph, 5.0);
        let fans: Vec<_> = (0..3).map(|i| fan(&mut graph, seg, i as f64 * 0.3)).collect();
        let (lining, _) = graph
            .add(CreateRequest::Lining(LiningSpec::new(seg)))
            .unwrap();
        graph
            .set_parameters(seg, BTreeMap::from([("tunnelAlpha".into(), ParamValue::Number(0.01))]))
            .unwrap();
        graph
            .set_parameters(fans[0], BTreeMap::from([("workerCount".into(), ParamValue::Number(4.0))]))
            .unwrap();

        let mutation = graph.remove(seg).unwrap();
        let removed = mutation.removed_ids();
        assert_eq!(removed.len(), fans.len() + 2);
        assert!(removed.contains(&lining));
        assert!(graph.parameters(seg).is_none());
        assert!(graph.parameters(fans[0]).is_none());
        assert_eq!(graph.len(), 1);
        assert!(graph.contains(other));
    }

    #[test]
    fn batch_remove_is_all_or_nothing() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        let fan_id = fan(&mut graph, seg, 0.5);
        let before = graph.serialize();

        let result = graph.remove_batch(&[fan_id, EntityId::new(999)]);
        assert_eq!(result, Err(GraphError::NotFound(EntityId::new(999))));
        assert_eq!(graph.serialize(), before);

        // 同批次删除巷道与其依附物不会重复计数
        let mutation = graph.remove_batch(&[fan_id, seg, fan_id]).unwrap();
        assert_eq!(mutation.removed_ids().len(), 2);
        assert!(graph.is_empty());
    }

    #[test]
    fn batch_update_rejects_missing_ids_without_effect() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        let before = graph.serialize();
        let result = graph.update_batch(vec![
            (
                seg,
                Patch::Segment(SegmentPatch {
                    width: Some(9.0),
                    ..SegmentPatch::default()
                }),
            ),
            (EntityId::new(77), Patch::Junction(JunctionPatch::default())),
        ]);
        assert_eq!(result, Err(GraphError::NotFound(EntityId::new(77))));
        assert_eq!(graph.serialize(), before);
    }

    #[test]
    fn invalid_patch_rolls_back_whole_batch() {
        let mut graph = EntityGraph::new();
        let a = horizontal(&mut graph, 10.0);
        let b = horizontal(&mut graph, 4.0);
        let before = graph.serialize();
        let result = graph.update_batch(vec![
            (
                a,
                Patch::Segment(SegmentPatch {
                    width: Some(2.0),
                    ..SegmentPatch::default()
                }),
            ),
            (
                b,
                Patch::Segment(SegmentPatch {
                    height: Some(-1.0),
                    ..SegmentPatch::default()
                }),
            ),
        ]);
        assert!(matches!(result, Err(GraphError::Validation(_))));
        assert_eq!(graph.serialize(), before);
    }

    #[test]
    fn patch_kind_mismatch_is_validation_error() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        let fan_id = fan(&mut graph, seg, 0.5);
        let result = graph.update(fan_id, Patch::Segment(SegmentPatch::default()));
        assert!(matches!(result, Err(GraphError::Validation(_))));

        let result = graph.update(
            fan_id,
            Patch::Attachment(AttachmentPatch {
                payload: Some(AttachmentPayload::Decoration(Default::default())),
                ..AttachmentPatch::default()
            }),
        );
        assert!(matches!(result, Err(GraphError::Validation(_))));
    }

    #[test]
    fn attachment_can_move_to_another_segment() {
        let mut graph = EntityGraph::new();
        let a = horizontal(&mut graph, 10.0);
        let spec = SegmentSpec::new(Point3::new(0.0, 0.0, 5.0), Point3::new(0.0, 0.0, 15.0));
        let (b, _) = graph.add(CreateRequest::Segment(spec)).unwrap();
        let fan_id = fan(&mut graph, a, 0.5);

        graph
            .update(
                fan_id,
                Patch::Attachment(AttachmentPatch {
                    segment_id: Some(b),
                    ..AttachmentPatch::default()
                }),
            )
            .unwrap();
        assert_eq!(graph.attachments_of(a).len(), 0);
        assert_eq!(graph.attachments_of(b).len(), 1);
        assert_eq!(
            graph.attachment(fan_id).unwrap().position,
            Point3::new(0.0, 0.0, 10.0)
        );

        let to_missing = graph.update(
            fan_id,
            Patch::Attachment(AttachmentPatch {
                segment_id: Some(EntityId::new(500)),
                ..AttachmentPatch::default()
            }),
        );
        assert!(matches!(to_missing, Err(GraphError::Integrity(_))));
    }

    #[test]
    fn second_lining_on_segment_is_rejected() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        graph.add(CreateRequest::Lining(LiningSpec::new(seg))).unwrap();
        let second = graph.add(CreateRequest::Lining(LiningSpec::new(seg)));
        assert!(matches!(second, Err(GraphError::Integrity(_))));
    }

    #[test]
    fn junction_move_drags_segment_ends_and_dependents() {
        let mut graph = EntityGraph::new();
        let (j, _) = graph
            .add(CreateRequest::Junction(JunctionSpec::new(Point3::new(10.0, 0.0, 0.0))))
            .unwrap();
        let spec = SegmentSpec::new(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0))
            .with_junctions(None, Some(j));
        let (seg, _) = graph.add(CreateRequest::Segment(spec)).unwrap();
        let fan_id = fan(&mut graph, seg, 0.5);

        let mutation = graph
            .update(
                j,
                Patch::Junction(JunctionPatch {
                    position: Some(Point3::new(20.0, 0.0, 0.0)),
                    ..JunctionPatch::default()
                }),
            )
            .unwrap();
        assert_eq!(graph.segment(seg).unwrap().end, Point3::new(20.0, 0.0, 0.0));
        assert_eq!(
            graph.attachment(fan_id).unwrap().position,
            Point3::new(10.0, 0.0, 0.0)
        );
        assert_eq!(mutation.written_ids().len(), 3);
    }

    #[test]
    fn removing_junction_detaches_segments() {
        let mut graph = EntityGraph::new();
        let (j, _) = graph
            .add(CreateRequest::Junction(JunctionSpec::new(Point3::new(0.0, 0.0, 0.0))))
            .unwrap();
        let spec = SegmentSpec::new(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0))
            .with_junctions(Some(j), None);
        let (seg, _) = graph.add(CreateRequest::Segment(spec)).unwrap();

        let mutation = graph.remove(j).unwrap();
        assert_eq!(mutation.removed_ids(), vec![j]);
        assert!(mutation.written_ids().contains(&seg));
        assert_eq!(graph.segment(seg).unwrap().start_junction, None);
        assert!(graph.segments_at_junction(j).is_empty());
    }

    #[test]
    fn segment_with_unknown_junction_is_integrity_error() {
        let mut graph = EntityGraph::new();
        let spec = SegmentSpec::new(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0))
            .with_junctions(Some(EntityId::new(9)), None);
        assert!(matches!(
            graph.add(CreateRequest::Segment(spec)),
            Err(GraphError::Integrity(_))
        ));
    }

    #[test]
    fn apply_previous_delta_restores_state() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        for t in [0.1, 0.4, 0.9] {
            fan(&mut graph, seg, t);
        }
        let before = graph.serialize();
        let mutation = graph.remove(seg).unwrap();
        let after = graph.serialize();

        graph.apply(&mutation.previous).unwrap();
        assert_eq!(graph.serialize(), before);
        assert_eq!(graph.attachments_of(seg).len(), 3);
        graph.apply(&mutation.current).unwrap();
        assert_eq!(graph.serialize(), after);
    }

    #[test]
    fn apply_rejects_orphaning_delta() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        let fan_id = fan(&mut graph, seg, 0.5);
        let remove_fan = graph.remove(fan_id).unwrap();
        let remove_seg = graph.remove(seg).unwrap();
        // 巷道已不存在时恢复依附物必须失败
        let before = graph.serialize();
        assert!(matches!(
            graph.apply(&remove_fan.previous),
            Err(GraphError::Integrity(_))
        ));
        assert_eq!(graph.serialize(), before);
        graph.apply(&remove_seg.previous).unwrap();
        graph.apply(&remove_fan.previous).unwrap();
        assert!(graph.contains(fan_id));
    }

    #[test]
    fn serialize_round_trip_recomputes_caches() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        let fan_id = graph
            .add(CreateRequest::Attachment(
                AttachmentSpec::fan(seg, 0.25).on_side(Side::Left, 0.5),
            ))
            .unwrap()
            .0;
        graph.add(CreateRequest::Lining(LiningSpec::new(seg))).unwrap();
        graph
            .add(CreateRequest::FreePoint(FreePointSpec::new(Point3::new(1.0, 2.0, 3.0))))
            .unwrap();

        let mut snapshot = graph.serialize();
        let expected = snapshot.clone();
        // 人为篡改缓存位置
        snapshot.attachments[0].position = Point3::new(99.0, 99.0, 99.0);
        snapshot.lining_overlays[0].radius = 123.0;

        let rebuilt = EntityGraph::from_snapshot(&snapshot).unwrap();
        assert_eq!(rebuilt.serialize(), expected);
        assert_eq!(rebuilt.attachment(fan_id).unwrap().kind(), EntityKind::Fan);

        let json = serde_json::to_string(&expected).unwrap();
        let parsed: SceneSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn deserialize_fails_on_orphan_and_keeps_graph() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        fan(&mut graph, seg, 0.5);
        let mut snapshot = graph.serialize();
        snapshot.segments.clear();

        let before = graph.serialize();
        let result = graph.deserialize(&snapshot);
        assert!(matches!(result, Err(GraphError::Integrity(_))));
        assert_eq!(graph.serialize(), before);
    }

    #[test]
    fn deserialize_rejects_duplicate_ids() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        let mut snapshot = graph.serialize();
        snapshot.free_points.push(FreePoint {
            id: seg,
            name: String::new(),
            position: Point3::ORIGIN,
            distance: 0.0,
            radian: 0.0,
            angle: 0.0,
        });
        assert!(matches!(
            EntityGraph::from_snapshot(&snapshot),
            Err(GraphError::Integrity(_))
        ));
    }

    #[test]
    fn deserialize_keeps_id_counter_monotonic() {
        let mut graph = EntityGraph::new();
        for _ in 0..5 {
            horizontal(&mut graph, 1.0);
        }
        graph.deserialize(&SceneSnapshot::default()).unwrap();
        assert!(graph.is_empty());
        let id = horizontal(&mut graph, 1.0);
        assert!(id.get() > 5);
    }

    #[test]
    fn replace_produces_reversible_mutation() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        fan(&mut graph, seg, 0.5);
        let original = graph.serialize();

        let mut other = EntityGraph::new();
        let spec = SegmentSpec::new(Point3::new(0.0, 5.0, 0.0), Point3::new(0.0, 5.0, 8.0))
            .with_id(EntityId::new(50));
        other.add(CreateRequest::Segment(spec)).unwrap();
        let target = other.serialize();

        let mutation = graph.replace(&target).unwrap();
        assert_eq!(graph.serialize(), target);
        graph.apply(&mutation.previous).unwrap();
        assert_eq!(graph.serialize(), original);
    }

    #[test]
    fn coordinates_are_rounded_on_write() {
        let mut graph = EntityGraph::with_precision(3);
        let spec = SegmentSpec::new(
            Point3::new(0.123456, 0.0, 0.0),
            Point3::new(10.987654, 0.0, 0.0),
        );
        let (seg, _) = graph.add(CreateRequest::Segment(spec)).unwrap();
        let segment = graph.segment(seg).unwrap();
        assert_eq!(segment.start.x(), 0.123);
        assert_eq!(segment.end.x(), 10.988);
    }

    #[test]
    fn parameters_require_existing_entity() {
        let mut graph = EntityGraph::new();
        let result = graph.set_parameters(EntityId::new(3), BTreeMap::new());
        assert_eq!(result, Err(GraphError::NotFound(EntityId::new(3))));

        let seg = horizontal(&mut graph, 1.0);
        let empty = graph.clear_parameters(seg).unwrap();
        assert!(empty.is_empty());
        graph
            .set_parameters(seg, BTreeMap::from([("isBlockage".into(), ParamValue::Flag(true))]))
            .unwrap();
        assert!(graph.parameters(seg).is_some());
        let cleared = graph.clear_parameters(seg).unwrap();
        assert!(!cleared.is_empty());
        assert!(graph.parameters(seg).is_none());
    }

    #[test]
    fn scene_data_projects_derived_values() {
        let mut graph = EntityGraph::new();
        let seg = horizontal(&mut graph, 10.0);
        let fan_id = graph
            .add(CreateRequest::Attachment(AttachmentSpec::new(
                seg,
                0.5,
                AttachmentPayload::Fan(FanProps {
                    velocity: 2.0,
                    pressure: 300.0,
                    reversed: false,
                }),
            )))
            .unwrap()
            .0;
        let data = graph.scene_data();
        let segment_item = data.of_kind(EntityKind::Segment).next().unwrap();
        assert_eq!(segment_item.length, Some(10.0));
        assert_eq!(segment_item.position, Point3::new(5.0, 0.0, 0.0));
        let fan_item = data.of_kind(EntityKind::Fan).next().unwrap();
        assert_eq!(fan_item.id, fan_id);
        assert_eq!(fan_item.segment_id, Some(seg));
    }
}
