//! 有界线性撤销/重做历史。
//!
//! 历史本身不持有实体图：回放分两步完成，`begin_undo`/`begin_redo` 设置防重入标志并
//! 交出待应用的增量，调用方应用后以 `finish_replay` 报告结果。标志存续期间任何记录或
//! 再次回放都会被拒绝，游标保持不变。

use std::collections::VecDeque;

use tracing::debug;
use ventnet_core::graph::StateDelta;

use crate::action::Action;
use crate::errors::HistoryError;

pub const DEFAULT_MAX_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryStats {
    pub total: usize,
    /// 已生效的记录数，即游标位置。
    pub current: usize,
    pub can_undo: bool,
    pub can_redo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replaying {
    Undo,
    Redo,
}

#[derive(Debug, Clone)]
pub struct CommandHistory {
    actions: VecDeque<Action>,
    index: usize,
    max_size: usize,
    replaying: Option<Replaying>,
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl CommandHistory {
    /// `max_size` 为 0 时按 1 处理。
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            actions: VecDeque::with_capacity(max_size),
            index: 0,
            max_size,
            replaying: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[inline]
    pub fn is_undoing(&self) -> bool {
        self.replaying == Some(Replaying::Undo)
    }

    #[inline]
    pub fn is_redoing(&self) -> bool {
        self.replaying == Some(Replaying::Redo)
    }

    #[inline]
    pub fn is_replaying(&self) -> bool {
        self.replaying.is_some()
    }

    #[inline]
    pub fn can_undo(&self) -> bool {
        self.index > 0
    }

    #[inline]
    pub fn can_redo(&self) -> bool {
        self.index < self.actions.len()
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            total: self.actions.len(),
            current: self.index,
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
        }
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    /// 追加一条记录：丢弃游标之后的重做分支，超出容量时从最旧一端淘汰。
    pub fn record(&mut self, action: Action) -> Result<(), HistoryError> {
        if self.is_replaying() {
            return Err(HistoryError::ReentrantRecording);
        }
        self.actions.truncate(self.index);
        self.actions.push_back(action);
        self.index += 1;
        while self.actions.len() > self.max_size {
            self.actions.pop_front();
            self.index -= 1;
        }
        debug!(total = self.actions.len(), index = self.index, "历史记录已追加");
        Ok(())
    }

    /// 开始撤销：无可撤销记录时返回 `None`，否则返回需应用的前状态。
    pub fn begin_undo(&mut self) -> Result<Option<StateDelta>, HistoryError> {
        if self.is_replaying() {
            return Err(HistoryError::ReentrantRecording);
        }
        if !self.can_undo() {
            return Ok(None);
        }
        self.replaying = Some(Replaying::Undo);
        Ok(Some(self.actions[self.index - 1].previous.clone()))
    }

    /// 开始重做：无可重做记录时返回 `None`，否则返回需应用的后状态。
    pub fn begin_redo(&mut self) -> Result<Option<StateDelta>, HistoryError> {
        if self.is_replaying() {
            return Err(HistoryError::ReentrantRecording);
        }
        if !self.can_redo() {
            return Ok(None);
        }
        self.replaying = Some(Replaying::Redo);
        Ok(Some(self.actions[self.index].current.clone()))
    }

    /// 结束回放并清除标志。`committed` 为真时移动游标并返回被回放的记录。
    pub fn finish_replay(&mut self, committed: bool) -> Option<&Action> {
        let replaying = self.replaying.take()?;
        if !committed {
            return None;
        }
        match replaying {
            Replaying::Undo => {
                self.index -= 1;
                self.actions.get(self.index)
            }
            Replaying::Redo => {
                self.index += 1;
                self.actions.get(self.index - 1)
            }
        }
    }

    /// 撤销最近一条记录。`replay` 负责把增量应用到实体图；失败时游标不动并返回错误。
    pub fn undo<F>(&mut self, replay: F) -> Result<Option<&Action>, HistoryError>
    where
        F: FnOnce(&StateDelta) -> Result<(), ventnet_core::GraphError>,
    {
        let Some(delta) = self.begin_undo()? else {
            return Ok(None);
        };
        self.complete(replay(&delta))
    }

    pub fn redo<F>(&mut self, replay: F) -> Result<Option<&Action>, HistoryError>
    where
        F: FnOnce(&StateDelta) -> Result<(), ventnet_core::GraphError>,
    {
        let Some(delta) = self.begin_redo()? else {
            return Ok(None);
        };
        self.complete(replay(&delta))
    }

    fn complete(
        &mut self,
        result: Result<(), ventnet_core::GraphError>,
    ) -> Result<Option<&Action>, HistoryError> {
        match result {
            Ok(()) => Ok(self.finish_replay(true)),
            Err(err) => {
                self.finish_replay(false);
                Err(HistoryError::Replay(err))
            }
        }
    }

    /// 清空历史，不触碰实体图。
    pub fn clear(&mut self) {
        self.actions.clear();
        self.index = 0;
        self.replaying = None;
    }
}
