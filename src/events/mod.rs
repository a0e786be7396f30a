//! Per-instance listener tables.
//!
//! Every `Connection` and every `Channel` owns its own `EventEmitter`; no
//! listener table is shared between instances.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// A listener callback. Identity is the allocation: clones of the same
/// `Listener` compare equal, two `Listener::new` calls never do.
#[derive(Clone)]
pub struct Listener(Arc<dyn Fn(&Value) + Send + Sync>);

impl Listener {
    pub fn new(callback: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        Self(Arc::new(callback))
    }

    fn call(&self, data: &Value) {
        (self.0)(data)
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({:p})", Arc::as_ptr(&self.0))
    }
}

/// event name -> listeners
#[derive(Default)]
pub struct EventEmitter {
    listeners: DashMap<String, Vec<Listener>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Binding the same listener twice is a no-op.
    pub fn bind(&self, event: &str, listener: &Listener) {
        let mut entry = self.listeners.entry(event.to_string()).or_default();
        if !entry.contains(listener) {
            entry.push(listener.clone());
        }
    }

    /// Remove a listener if present.
    pub fn unbind(&self, event: &str, listener: &Listener) {
        if let Some(mut entry) = self.listeners.get_mut(event) {
            entry.retain(|l| l != listener);
            if entry.is_empty() {
                drop(entry);
                self.listeners.remove_if(event, |_, v| v.is_empty());
            }
        }
    }

    /// Invoke every listener bound to `event` on the caller's task.
    ///
    /// The listener list is snapshotted before the first call, so callbacks
    /// may bind or unbind freely; such changes apply to the next broadcast.
    pub fn broadcast(&self, event: &str, data: &Value) {
        let snapshot = match self.listeners.get(event) {
            Some(entry) => entry.value().clone(),
            None => return,
        };

        for listener in &snapshot {
            listener.call(data);
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map(|e| e.len()).unwrap_or(0)
    }

    /// Drop every listener of every event
    pub fn clear(&self) {
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_listener(counter: &Arc<AtomicUsize>) -> Listener {
        let counter = counter.clone();
        Listener::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_broadcast_reaches_each_listener_once() {
        let emitter = EventEmitter::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let la = counting_listener(&a);
        let lb = counting_listener(&b);

        emitter.bind("update", &la);
        emitter.bind("update", &lb);
        emitter.broadcast("update", &json!({"n": 1}));

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bind_is_idempotent() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let listener = counting_listener(&count);

        emitter.bind("update", &listener);
        emitter.bind("update", &listener.clone());
        assert_eq!(emitter.listener_count("update"), 1);

        emitter.broadcast("update", &Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unbind_stops_delivery() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let listener = counting_listener(&count);

        emitter.bind("update", &listener);
        emitter.broadcast("update", &Value::Null);
        emitter.unbind("update", &listener);
        emitter.broadcast("update", &Value::Null);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count("update"), 0);
    }

    #[test]
    fn test_unbind_unknown_is_noop() {
        let emitter = EventEmitter::new();
        let listener = Listener::new(|_| {});
        emitter.unbind("missing", &listener);
        emitter.broadcast("missing", &Value::Null);
    }

    #[test]
    fn test_events_are_isolated_by_name() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        emitter.bind("a", &counting_listener(&count));
        emitter.broadcast("b", &Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_emitters_do_not_share_listeners() {
        let first = EventEmitter::new();
        let second = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        first.bind("update", &counting_listener(&count));

        second.broadcast("update", &Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unbind_from_inside_callback() {
        let emitter = Arc::new(EventEmitter::new());
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<std::sync::Mutex<Option<Listener>>> = Arc::new(std::sync::Mutex::new(None));

        let listener = {
            let emitter = emitter.clone();
            let count = count.clone();
            let slot = slot.clone();
            Listener::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = slot.lock().unwrap().as_ref() {
                    emitter.unbind("once", me);
                }
            })
        };
        *slot.lock().unwrap() = Some(listener.clone());
        emitter.bind("once", &listener);

        emitter.broadcast("once", &Value::Null);
        emitter.broadcast("once", &Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bind_from_inside_callback() {
        let emitter = Arc::new(EventEmitter::new());
        let late = Arc::new(AtomicUsize::new(0));
        let late_listener = counting_listener(&late);

        let binder = {
            let emitter = emitter.clone();
            Listener::new(move |_| emitter.bind("grow", &late_listener))
        };
        emitter.bind("grow", &binder);

        emitter.broadcast("grow", &Value::Null);
        emitter.broadcast("grow", &Value::Null);
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }
}
