//! Push-based notification primitives on top of crossbeam channels.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// Current value plus change broadcast. A new subscriber receives the
/// current value immediately, then every subsequent distinct value.
pub struct Watch<T> {
    inner: Mutex<WatchInner<T>>,
}

struct WatchInner<T> {
    value: T,
    subscribers: Vec<Sender<T>>,
}

impl<T: Clone + PartialEq + Send> Watch<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Mutex::new(WatchInner { value: initial, subscribers: Vec::new() }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.lock().value.clone()
    }

    /// Stores `value` and notifies subscribers. Returns false, without
    /// notifying, when it equals the current value.
    pub fn set(&self, value: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.value == value {
            return false;
        }
        inner.value = value.clone();
        inner.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        true
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded();
        let mut inner = self.inner.lock();
        // The receiver is alive, so this cannot fail
        let _ = tx.send(inner.value.clone());
        inner.subscribers.push(tx);
        rx
    }

    /// Subscribers still attached as of the last broadcast. Dropped receivers
    /// are pruned when the next distinct value is sent.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Fan-out of events without replay.
pub struct EventBus<T> {
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone + Send> EventBus<T> {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()) }
    }

    pub fn publish(&self, event: T) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }
}

impl<T: Clone + Send> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_get_latest_then_distinct_changes() {
        let watch = Watch::new(1);
        watch.set(2);
        let rx = watch.subscribe();
        assert!(!watch.set(2));
        assert!(watch.set(3));
        assert!(!watch.set(3));
        assert!(watch.set(2));
        let seen: Vec<i32> = rx.try_iter().collect();
        assert_eq!(seen, vec![2, 3, 2]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let watch = Watch::new("a".to_string());
        let keep = watch.subscribe();
        drop(watch.subscribe());
        assert_eq!(watch.subscriber_count(), 2);
        watch.set("b".into());
        assert_eq!(watch.subscriber_count(), 1);
        assert_eq!(keep.try_iter().last().as_deref(), Some("b"));
    }

    #[test]
    fn event_bus_has_no_replay() {
        let bus = EventBus::new();
        bus.publish(1);
        let rx = bus.subscribe();
        bus.publish(2);
        bus.publish(2);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![2, 2]);
    }
}
