//! 通风网络实体：巷道段、依附物（风机/构筑物/装饰）、风筒、自由点、节点以及参数集。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::geometry::{Point3, UP, Vector3};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    /// 保留值，不会分配给任何实体。
    pub const MAX: EntityId = EntityId(u64::MAX);

    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 提供原始数值，便于序列化或日志输出。
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Segment,
    Fan,
    Structure,
    Decoration,
    Lining,
    FreePoint,
    Junction,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Segment => "segment",
            EntityKind::Fan => "fan",
            EntityKind::Structure => "structure",
            EntityKind::Decoration => "decoration",
            EntityKind::Lining => "lining",
            EntityKind::FreePoint => "freePoint",
            EntityKind::Junction => "junction",
        };
        f.write_str(name)
    }
}

/// 巷道段。长度、方向与倾角均由端点推导，不单独存储。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    pub start: Point3,
    pub end: Point3,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub size: f64,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub airflow: f64,
    #[serde(default)]
    pub key_area: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_junction: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_junction: Option<EntityId>,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub group_id: String,
}

impl Segment {
    #[inline]
    pub fn length(&self) -> f64 {
        self.start.distance(self.end)
    }

    /// 单位方向向量；退化线段回退到 +X。
    pub fn direction(&self) -> Vector3 {
        self.start
            .vector_to(self.end)
            .normalize()
            .unwrap_or(Vector3::X)
    }

    /// 相对水平面的倾角（度），上坡为正。
    pub fn angle(&self) -> f64 {
        let dir = self.direction().as_vec3();
        dir.dot(UP).clamp(-1.0, 1.0).asin().to_degrees()
    }

    pub fn junctions(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.start_junction.into_iter().chain(self.end_junction)
    }
}

/// 依附物相对巷道中心线的偏移方位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[default]
    Center,
    Left,
    Right,
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanProps {
    #[serde(default)]
    pub velocity: f64,
    #[serde(default)]
    pub pressure: f64,
    /// 风机反转（逆向送风）。
    #[serde(default)]
    pub reversed: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureProps {
    /// 构筑物类别，如风门、风窗、传感器。
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub sensors: Vec<String>,
    #[serde(default)]
    pub texts: Vec<String>,
    #[serde(default)]
    pub numbers: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecorationProps {
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AttachmentPayload {
    Fan(FanProps),
    Structure(StructureProps),
    Decoration(DecorationProps),
}

impl AttachmentPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            AttachmentPayload::Fan(_) => EntityKind::Fan,
            AttachmentPayload::Structure(_) => EntityKind::Structure,
            AttachmentPayload::Decoration(_) => EntityKind::Decoration,
        }
    }
}

/// 依附在巷道段上的点状实体。`position`/`forward` 为派生缓存，由实体图重算。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    pub segment_id: EntityId,
    pub relative_position: f64,
    #[serde(default)]
    pub side: Side,
    #[serde(default)]
    pub lateral_offset: f64,
    pub payload: AttachmentPayload,
    #[serde(default)]
    pub position: Point3,
    #[serde(default)]
    pub forward: Vector3,
}

impl Attachment {
    #[inline]
    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }
}

/// 风筒覆盖层，与巷道段一一对应。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiningOverlay {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    pub segment_id: EntityId,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub clearance: f64,
    #[serde(default)]
    pub start: Point3,
    #[serde(default)]
    pub end: Point3,
    #[serde(default)]
    pub radius: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreePoint {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    pub position: Point3,
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub radian: f64,
    #[serde(default)]
    pub angle: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JunctionPoint {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    pub position: Point3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

/// 工程参数，按实体 id 一对一挂载。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSet {
    pub entity_id: EntityId,
    #[serde(default)]
    pub values: BTreeMap<String, ParamValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneSettings {
    pub scene_center: Point3,
    pub scale: f64,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            scene_center: Point3::ORIGIN,
            scale: 1.0,
        }
    }
}

/// 增量中的记录键。设置、实体与参数集各自独立寻址。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Settings,
    Entity(EntityId),
    Parameters(EntityId),
}

/// 单条记录的完整状态。
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Settings(SceneSettings),
    Segment(Segment),
    Attachment(Attachment),
    Lining(LiningOverlay),
    FreePoint(FreePoint),
    Junction(JunctionPoint),
    Parameters(ParameterSet),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Settings(_) => RecordKey::Settings,
            Record::Segment(segment) => RecordKey::Entity(segment.id),
            Record::Attachment(attachment) => RecordKey::Entity(attachment.id),
            Record::Lining(lining) => RecordKey::Entity(lining.id),
            Record::FreePoint(point) => RecordKey::Entity(point.id),
            Record::Junction(junction) => RecordKey::Entity(junction.id),
            Record::Parameters(params) => RecordKey::Parameters(params.entity_id),
        }
    }

    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            Record::Segment(_) => Some(EntityKind::Segment),
            Record::Attachment(attachment) => Some(attachment.kind()),
            Record::Lining(_) => Some(EntityKind::Lining),
            Record::FreePoint(_) => Some(EntityKind::FreePoint),
            Record::Junction(_) => Some(EntityKind::Junction),
            Record::Settings(_) | Record::Parameters(_) => None,
        }
    }
}

/// 对外查询返回的只读借用视图。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityRef<'a> {
    Segment(&'a Segment),
    Attachment(&'a Attachment),
    Lining(&'a LiningOverlay),
    FreePoint(&'a FreePoint),
    Junction(&'a JunctionPoint),
}

impl EntityRef<'_> {
    pub fn id(&self) -> EntityId {
        match self {
            EntityRef::Segment(segment) => segment.id,
            EntityRef::Attachment(attachment) => attachment.id,
            EntityRef::Lining(lining) => lining.id,
            EntityRef::FreePoint(point) => point.id,
            EntityRef::Junction(junction) => junction.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Segment(_) => EntityKind::Segment,
            EntityRef::Attachment(attachment) => attachment.kind(),
            EntityRef::Lining(_) => EntityKind::Lining,
            EntityRef::FreePoint(_) => EntityKind::FreePoint,
            EntityRef::Junction(_) => EntityKind::Junction,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EntityRef::Segment(segment) => &segment.name,
            EntityRef::Attachment(attachment) => &attachment.name,
            EntityRef::Lining(lining) => &lining.name,
            EntityRef::FreePoint(point) => &point.name,
            EntityRef::Junction(junction) => &junction.name,
        }
    }
}

// ---------------------------------------------------------------------------
// 创建请求：导入/布局协作方提交的纯属性记录，可选自带 id。
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CreateRequest {
    Segment(SegmentSpec),
    Attachment(AttachmentSpec),
    Lining(LiningSpec),
    FreePoint(FreePointSpec),
    Junction(JunctionSpec),
}

impl CreateRequest {
    pub fn requested_id(&self) -> Option<EntityId> {
        match self {
            CreateRequest::Segment(spec) => spec.id,
            CreateRequest::Attachment(spec) => spec.id,
            CreateRequest::Lining(spec) => spec.id,
            CreateRequest::FreePoint(spec) => spec.id,
            CreateRequest::Junction(spec) => spec.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            CreateRequest::Segment(_) => EntityKind::Segment,
            CreateRequest::Attachment(spec) => spec.payload.kind(),
            CreateRequest::Lining(_) => EntityKind::Lining,
            CreateRequest::FreePoint(_) => EntityKind::FreePoint,
            CreateRequest::Junction(_) => EntityKind::Junction,
        }
    }
}

pub const DEFAULT_SEGMENT_WIDTH: f64 = 4.0;
pub const DEFAULT_SEGMENT_HEIGHT: f64 = 3.0;
pub const DEFAULT_SEGMENT_COLOR: u32 = 0x00ff_00;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSpec {
    #[serde(default)]
    pub id: Option<EntityId>,
    #[serde(default)]
    pub name: String,
    pub start: Point3,
    pub end: Point3,
    #[serde(default = "SegmentSpec::default_width")]
    pub width: f64,
    #[serde(default = "SegmentSpec::default_height")]
    pub height: f64,
    #[serde(default)]
    pub size: f64,
    #[serde(default = "SegmentSpec::default_color")]
    pub color: u32,
    #[serde(default)]
    pub airflow: f64,
    #[serde(default)]
    pub key_area: f64,
    #[serde(default)]
    pub start_junction: Option<EntityId>,
    #[serde(default)]
    pub end_junction: Option<EntityId>,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub group_id: String,
}

impl SegmentSpec {
    pub fn new(start: Point3, end: Point3) -> Self {
        Self {
            id: None,
            name: String::new(),
            start,
            end,
            width: DEFAULT_SEGMENT_WIDTH,
            height: DEFAULT_SEGMENT_HEIGHT,
            size: 0.0,
            color: DEFAULT_SEGMENT_COLOR,
            airflow: 0.0,
            key_area: 0.0,
            start_junction: None,
            end_junction: None,
            node_id: String::new(),
            group_id: String::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_id(mut self, id: EntityId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_junctions(mut self, start: Option<EntityId>, end: Option<EntityId>) -> Self {
        self.start_junction = start;
        self.end_junction = end;
        self
    }

    fn default_width() -> f64 {
        DEFAULT_SEGMENT_WIDTH
    }

    fn default_height() -> f64 {
        DEFAULT_SEGMENT_HEIGHT
    }

    fn default_color() -> u32 {
        DEFAULT_SEGMENT_COLOR
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentSpec {
    #[serde(default)]
    pub id: Option<EntityId>,
    #[serde(default)]
    pub name: String,
    pub segment_id: EntityId,
    pub relative_position: f64,
    #[serde(default)]
    pub side: Side,
    #[serde(default)]
    pub lateral_offset: f64,
    pub payload: AttachmentPayload,
}

impl AttachmentSpec {
    pub fn new(segment_id: EntityId, relative_position: f64, payload: AttachmentPayload) -> Self {
        Self {
            id: None,
            name: String::new(),
            segment_id,
            relative_position,
            side: Side::Center,
            lateral_offset: 0.0,
            payload,
        }
    }

    pub fn fan(segment_id: EntityId, relative_position: f64) -> Self {
        Self::new(
            segment_id,
            relative_position,
            AttachmentPayload::Fan(FanProps::default()),
        )
    }

    pub fn structure(
        segment_id: EntityId,
        relative_position: f64,
        category: impl Into<String>,
    ) -> Self {
        Self::new(
            segment_id,
            relative_position,
            AttachmentPayload::Structure(StructureProps {
                category: category.into(),
                ..StructureProps::default()
            }),
        )
    }

    pub fn decoration(
        segment_id: EntityId,
        relative_position: f64,
        icon: impl Into<String>,
    ) -> Self {
        Self::new(
            segment_id,
            relative_position,
            AttachmentPayload::Decoration(DecorationProps {
                icon: icon.into(),
                label: String::new(),
            }),
        )
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_id(mut self, id: EntityId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn on_side(mut self, side: Side, lateral_offset: f64) -> Self {
        self.side = side;
        self.lateral_offset = lateral_offset;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiningSpec {
    #[serde(default)]
    pub id: Option<EntityId>,
    #[serde(default)]
    pub name: String,
    pub segment_id: EntityId,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub clearance: f64,
}

impl LiningSpec {
    pub fn new(segment_id: EntityId) -> Self {
        Self {
            id: None,
            name: String::new(),
            segment_id,
            color: 0,
            clearance: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreePointSpec {
    #[serde(default)]
    pub id: Option<EntityId>,
    #[serde(default)]
    pub name: String,
    pub position: Point3,
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub radian: f64,
    #[serde(default)]
    pub angle: f64,
}

impl FreePointSpec {
    pub fn new(position: Point3) -> Self {
        Self {
            id: None,
            name: String::new(),
            position,
            distance: 0.0,
            radian: 0.0,
            angle: 0.0,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JunctionSpec {
    #[serde(default)]
    pub id: Option<EntityId>,
    #[serde(default)]
    pub name: String,
    pub position: Point3,
}

impl JunctionSpec {
    pub fn new(position: Point3) -> Self {
        Self {
            id: None,
            name: String::new(),
            position,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

// ---------------------------------------------------------------------------
// 类型化的局部属性补丁：`None` 表示保持原值。
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    Segment(SegmentPatch),
    Attachment(AttachmentPatch),
    Lining(LiningPatch),
    FreePoint(FreePointPatch),
    Junction(JunctionPatch),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentPatch {
    pub name: Option<String>,
    pub start: Option<Point3>,
    pub end: Option<Point3>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub size: Option<f64>,
    pub color: Option<u32>,
    pub airflow: Option<f64>,
    pub key_area: Option<f64>,
    /// `Some(None)` 表示解除节点引用。
    pub start_junction: Option<Option<EntityId>>,
    pub end_junction: Option<Option<EntityId>>,
    pub node_id: Option<String>,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentPatch {
    pub name: Option<String>,
    pub segment_id: Option<EntityId>,
    pub relative_position: Option<f64>,
    pub side: Option<Side>,
    pub lateral_offset: Option<f64>,
    /// 必须与原有依附物类型一致。
    pub payload: Option<AttachmentPayload>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiningPatch {
    pub name: Option<String>,
    pub color: Option<u32>,
    pub clearance: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FreePointPatch {
    pub name: Option<String>,
    pub position: Option<Point3>,
    pub distance: Option<f64>,
    pub radian: Option<f64>,
    pub angle: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JunctionPatch {
    pub name: Option<String>,
    pub position: Option<Point3>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_derives_length_direction_and_angle() {
        let mut spec = SegmentSpec::new(Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 4.0, 0.0));
        spec.name = "ramp".into();
        let segment = Segment {
            id: EntityId::new(1),
            name: spec.name.clone(),
            start: spec.start,
            end: spec.end,
            width: spec.width,
            height: spec.height,
            size: spec.size,
            color: spec.color,
            airflow: 0.0,
            key_area: 0.0,
            start_junction: None,
            end_junction: None,
            node_id: String::new(),
            group_id: String::new(),
        };
        assert!((segment.length() - 5.0).abs() < 1e-12);
        let dir = segment.direction();
        assert!((dir.as_vec3().x - 0.6).abs() < 1e-12);
        assert!((dir.as_vec3().y - 0.8).abs() < 1e-12);
        assert!((segment.angle() - 0.8f64.asin().to_degrees()).abs() < 1e-9);
    }

    #[test]
    fn create_request_parses_from_plain_json() {
        let json = r#"{
            "kind": "attachment",
            "segmentId": 7,
            "relativePosition": 0.25,
            "side": "left",
            "payload": { "type": "fan", "velocity": 3.5 }
        }"#;
        let request: CreateRequest = serde_json::from_str(json).expect("parse request");
        assert_eq!(request.kind(), EntityKind::Fan);
        match request {
            CreateRequest::Attachment(spec) => {
                assert_eq!(spec.segment_id, EntityId::new(7));
                assert_eq!(spec.side, Side::Left);
                assert!(spec.id.is_none());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn param_values_keep_their_shape() {
        let json = r#"{"entityId": 3, "values": {"isBlockage": true, "tunnelAlpha": 0.02, "tunnelType": "main"}}"#;
        let params: ParameterSet = serde_json::from_str(json).expect("parse params");
        assert_eq!(params.values["isBlockage"], ParamValue::Flag(true));
        assert_eq!(params.values["tunnelAlpha"], ParamValue::Number(0.02));
        assert_eq!(params.values["tunnelType"], ParamValue::Text("main".into()));
    }
}
