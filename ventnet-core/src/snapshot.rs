//! 场景快照：实体图的完整、无别名序列化形态，以及面向渲染/UI 的只读投影。

use serde::{Deserialize, Serialize};

use crate::entity::{
    Attachment, EntityId, EntityKind, FreePoint, JunctionPoint, LiningOverlay, ParameterSet,
    Segment,
};
use crate::geometry::Point3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneSnapshot {
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub lining_overlays: Vec<LiningOverlay>,
    #[serde(default)]
    pub free_points: Vec<FreePoint>,
    #[serde(default)]
    pub junctions: Vec<JunctionPoint>,
    #[serde(default)]
    pub parameter_sets: Vec<ParameterSet>,
    #[serde(default)]
    pub scene_center: Point3,
    #[serde(default = "SceneSnapshot::default_scale")]
    pub scale: f64,
}

impl SceneSnapshot {
    fn default_scale() -> f64 {
        1.0
    }

    pub fn entity_count(&self) -> usize {
        self.segments.len()
            + self.attachments.len()
            + self.lining_overlays.len()
            + self.free_points.len()
            + self.junctions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count() == 0 && self.parameter_sets.is_empty()
    }
}

impl Default for SceneSnapshot {
    fn default() -> Self {
        Self {
            segments: Vec::new(),
            attachments: Vec::new(),
            lining_overlays: Vec::new(),
            free_points: Vec::new(),
            junctions: Vec::new(),
            parameter_sets: Vec::new(),
            scene_center: Point3::ORIGIN,
            scale: Self::default_scale(),
        }
    }
}

/// 扁平化的只读场景条目。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneItem {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: String,
    /// 巷道取中点，其余实体取自身（派生）位置。
    pub position: Point3,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<EntityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
    pub has_parameters: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneData {
    pub items: Vec<SceneItem>,
    pub scene_center: Point3,
    pub scale: f64,
}

impl SceneData {
    pub fn of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &SceneItem> {
        self.items.iter().filter(move |item| item.kind == kind)
    }
}
