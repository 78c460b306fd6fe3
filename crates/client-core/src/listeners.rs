use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use crate::lock;

/// Handle returned by [`ListenerRegistry::add`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered list of observer callbacks.
///
/// Dispatch works on a snapshot taken when the pass starts, so a listener
/// removed mid-pass is still called for that pass and skipped afterwards.
pub struct ListenerRegistry<F: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Arc<F>)>>,
}

impl<F: ?Sized> Default for ListenerRegistry<F> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> ListenerRegistry<F> {
    pub fn add(&self, listener: Arc<F>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.entries).push((id, listener));
        id
    }

    /// Returns `false` when the id was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Listeners in registration order.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        lock(&self.entries)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Callback = dyn Fn(u32) + Send + Sync;

    #[test]
    fn dispatches_in_registration_order() {
        let registry = ListenerRegistry::<Callback>::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            registry.add(Arc::new(move |value| {
                seen.lock().unwrap().push(format!("{tag}{value}"));
            }));
        }

        for listener in registry.snapshot() {
            listener(1);
        }
        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn removal_during_dispatch_only_affects_later_passes() {
        let registry = Arc::new(ListenerRegistry::<Callback>::default());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let second_id = Arc::new(Mutex::new(None));

        {
            let inner = registry.clone();
            let second_id = second_id.clone();
            let calls = calls.clone();
            registry.add(Arc::new(move |pass| {
                calls.lock().unwrap().push(("first", pass));
                if let Some(id) = *second_id.lock().unwrap() {
                    inner.remove(id);
                }
            }));
        }
        {
            let calls = calls.clone();
            let id = registry.add(Arc::new(move |pass| {
                calls.lock().unwrap().push(("second", pass));
            }));
            *second_id.lock().unwrap() = Some(id);
        }

        for pass in 1..=2 {
            for listener in registry.snapshot() {
                listener(pass);
            }
        }

        assert_eq!(
            *calls.lock().unwrap(),
            vec![("first", 1), ("second", 1), ("first", 2)]
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removing_unknown_listener_is_reported() {
        let registry = ListenerRegistry::<Callback>::default();
        let id = registry.add(Arc::new(|_| {}));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }
}
