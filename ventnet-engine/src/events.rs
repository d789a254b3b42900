//! 面向 UI 协作方的同步事件通知。事件在触发操作提交之后派发，监听器无返回值。

use ventnet_core::EntityId;

use crate::history::HistoryStats;

#[derive(Debug, Clone, PartialEq)]
pub enum SceneEvent {
    Selected(Option<EntityId>),
    Updated(Vec<EntityId>),
    VisibilityChanged { ids: Vec<EntityId>, visible: bool },
    HistoryChanged(HistoryStats),
    /// 载入或导入场景后派发，携带场景 id。
    SceneLoaded(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&SceneEvent)>;

#[derive(Default)]
pub struct EventBus {
    listeners: Vec<(ListenerId, Listener)>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&SceneEvent) + 'static,
    {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// 返回监听器此前是否已注册。
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    #[inline]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn emit(&mut self, event: &SceneEvent) {
        for (_, listener) in &mut self.listeners {
            listener(event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn listeners_receive_events_until_unsubscribed() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut bus = EventBus::new();
        let sink = Rc::clone(&seen);
        let id = bus.subscribe(move |event| sink.borrow_mut().push(event.clone()));

        bus.emit(&SceneEvent::Selected(Some(EntityId::new(3))));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&SceneEvent::Selected(None));

        assert_eq!(
            *seen.borrow(),
            vec![SceneEvent::Selected(Some(EntityId::new(3)))]
        );
        assert_eq!(bus.listener_count(), 0);
    }
}
