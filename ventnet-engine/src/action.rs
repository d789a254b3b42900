use std::fmt;

use ventnet_core::entity::{EntityId, EntityKind};
use ventnet_core::graph::{Mutation, StateDelta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Add(EntityKind),
    Update(EntityKind),
    Remove(EntityKind),
    UpdateBatch,
    RemoveBatch,
    SetParameters,
    ClearParameters,
    UpdateSettings,
    LoadScene,
    ImportScene,
    ClearScene,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Add(kind) => write!(f, "add {kind}"),
            ActionKind::Update(kind) => write!(f, "update {kind}"),
            ActionKind::Remove(kind) => write!(f, "remove {kind}"),
            ActionKind::UpdateBatch => f.write_str("update batch"),
            ActionKind::RemoveBatch => f.write_str("remove batch"),
            ActionKind::SetParameters => f.write_str("set parameters"),
            ActionKind::ClearParameters => f.write_str("clear parameters"),
            ActionKind::UpdateSettings => f.write_str("update settings"),
            ActionKind::LoadScene => f.write_str("load scene"),
            ActionKind::ImportScene => f.write_str("import scene"),
            ActionKind::ClearScene => f.write_str("clear scene"),
        }
    }
}

/// 一条可逆的历史记录。复合操作（级联删除、批量更新、随巷道移动的依附物重算）
/// 共用一条记录，撤销与重做整体生效。
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub entity_ids: Vec<EntityId>,
    /// 撤销时应用。
    pub previous: StateDelta,
    /// 重做时应用。
    pub current: StateDelta,
}

impl Action {
    pub fn from_mutation(kind: ActionKind, mutation: Mutation) -> Self {
        Self {
            kind,
            entity_ids: mutation.affected,
            previous: mutation.previous,
            current: mutation.current,
        }
    }

    pub fn label(&self) -> String {
        match self.entity_ids.as_slice() {
            [] => self.kind.to_string(),
            [id] => format!("{} #{id}", self.kind),
            ids => format!("{} ({} entities)", self.kind, ids.len()),
        }
    }
}
