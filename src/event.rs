use crate::config::Model;

use tracing::debug;

/// How a session ended, as far as the host can tell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectStatus {
    /// The device sent `Done` and the boot sequence finished.
    Success,
    /// The manager was torn down before the gadget finished booting.
    Failure,
    /// The device went away (unplugged or re-enumerated).
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected {
        model: Model,
        serial_number: Option<String>,
    },
    Disconnected(DisconnectStatus),
}

/// Handle returned by [`EventBus::subscribe`], given back to unsubscribe
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// Synchronous publish/subscribe for a single event type
pub struct EventBus<E> {
    next_id: u64,
    listeners: Vec<(u64, Box<dyn FnMut(&E)>)>,
}
impl<E: std::fmt::Debug> EventBus<E> {
    pub fn new() -> Self {
        EventBus {
            next_id: 0,
            listeners: vec![],
        }
    }

    pub fn subscribe<F: FnMut(&E) + 'static>(&mut self, callback: F) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.push((id, Box::new(callback)));
        Subscription(id)
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(id, _)| *id != subscription.0);
        self.listeners.len() != before
    }

    /// Calls every listener in subscription order.
    pub fn publish(&mut self, event: &E) {
        debug!("publishing {:?} to {} listeners", event, self.listeners.len());
        for (_, listener) in self.listeners.iter_mut() {
            listener(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}
impl<E: std::fmt::Debug> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn delivers_to_all_subscribers() {
        let mut bus = EventBus::new();
        let seen = Rc::new(RefCell::new(vec![]));

        let a = seen.clone();
        bus.subscribe(move |e: &SessionEvent| a.borrow_mut().push(("a", e.clone())));
        let b = seen.clone();
        bus.subscribe(move |e: &SessionEvent| b.borrow_mut().push(("b", e.clone())));
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(&SessionEvent::Disconnected(DisconnectStatus::Success));
        assert_eq!(
            *seen.borrow(),
            vec![
                ("a", SessionEvent::Disconnected(DisconnectStatus::Success)),
                ("b", SessionEvent::Disconnected(DisconnectStatus::Success)),
            ]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));

        let c = count.clone();
        let sub = bus.subscribe(move |_: &SessionEvent| *c.borrow_mut() += 1);
        bus.publish(&SessionEvent::Disconnected(DisconnectStatus::Unknown));
        assert!(bus.unsubscribe(sub));
        bus.publish(&SessionEvent::Disconnected(DisconnectStatus::Unknown));

        assert_eq!(*count.borrow(), 1);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!bus.unsubscribe(Subscription(42)));
    }
}
