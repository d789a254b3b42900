pub mod action;
pub mod command;
pub mod events;
pub mod history;
pub mod service;

pub mod errors {
    use thiserror::Error;
    use ventnet_core::GraphError;
    use ventnet_io::StoreError;

    #[derive(Debug, Clone, PartialEq, Error)]
    pub enum HistoryError {
        #[error("history cannot be changed while an undo/redo is being replayed")]
        ReentrantRecording,
        #[error("failed to replay history action: {0}")]
        Replay(#[from] GraphError),
    }

    /// 失败类别，供协作方按类型分支处理。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ErrorKind {
        NotFound,
        Integrity,
        ReentrantRecording,
        Validation,
        Persistence,
    }

    #[derive(Debug, Error)]
    pub enum ActionError {
        #[error(transparent)]
        Graph(#[from] GraphError),
        #[error(transparent)]
        History(#[from] HistoryError),
        #[error(transparent)]
        Store(#[from] StoreError),
    }

    impl ActionError {
        pub fn kind(&self) -> ErrorKind {
            match self {
                ActionError::Graph(err) => graph_kind(err),
                ActionError::History(HistoryError::ReentrantRecording) => {
                    ErrorKind::ReentrantRecording
                }
                ActionError::History(HistoryError::Replay(err)) => graph_kind(err),
                ActionError::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
                ActionError::Store(StoreError::Rejected(err)) => graph_kind(err),
                ActionError::Store(StoreError::InvalidId(_)) => ErrorKind::Validation,
                ActionError::Store(_) => ErrorKind::Persistence,
            }
        }
    }

    fn graph_kind(err: &GraphError) -> ErrorKind {
        match err {
            GraphError::NotFound(_) => ErrorKind::NotFound,
            GraphError::Integrity(_) => ErrorKind::Integrity,
            GraphError::Validation(_) => ErrorKind::Validation,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use ventnet_core::EntityId;

        #[test]
        fn kinds_follow_the_underlying_failure() {
            let missing: ActionError = GraphError::NotFound(EntityId::new(4)).into();
            assert_eq!(missing.kind(), ErrorKind::NotFound);

            let reentrant: ActionError = HistoryError::ReentrantRecording.into();
            assert_eq!(reentrant.kind(), ErrorKind::ReentrantRecording);

            let replay: ActionError =
                HistoryError::Replay(GraphError::Integrity("orphan".into())).into();
            assert_eq!(replay.kind(), ErrorKind::Integrity);

            let corrupt: ActionError = StoreError::Corrupt("bad".into()).into();
            assert_eq!(corrupt.kind(), ErrorKind::Persistence);
        }
    }
}

pub use action::{Action, ActionKind};
pub use errors::{ActionError, ErrorKind, HistoryError};
pub use events::{EventBus, ListenerId, SceneEvent};
pub use history::{CommandHistory, HistoryStats};
pub use service::{ActionService, Operation, Outcome};
