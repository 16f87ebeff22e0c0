//! Publish/subscribe registry with disposable subscriptions
//!
//! Listeners run synchronously, in registration order, on whichever task
//! fires the event. The listener list is snapshotted before dispatch so a
//! listener may subscribe or dispose without deadlocking.

use std::sync::{Arc, Mutex, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

/// An event source with zero or more listeners
pub struct Emitter<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register a listener; it stays attached until the subscription is disposed
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));
        drop(registry);

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            dispose: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).listeners.retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    /// Invoke every listener with `event`
    pub fn fire(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = lock(&self.registry)
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    /// Detach every listener
    pub fn clear(&self) {
        lock(&self.registry).listeners.clear();
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`Emitter::subscribe`]
///
/// Dropping the handle does not detach the listener; call [`dispose`](Self::dispose).
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn dispose(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}

/// Lock a std mutex, recovering the data if a listener panicked while holding it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listeners_fire_in_registration_order() {
        let emitter = Emitter::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            emitter.subscribe(move |value: &u32| seen.lock().unwrap().push((tag, *value)));
        }

        emitter.fire(&7);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn test_dispose_detaches_only_that_listener() {
        let emitter = Emitter::<()>::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let hits = hits.clone();
            emitter.subscribe(move |_| hits.lock().unwrap().push("a"))
        };
        let _b = {
            let hits = hits.clone();
            emitter.subscribe(move |_| hits.lock().unwrap().push("b"))
        };

        a.dispose();
        emitter.fire(&());
        assert_eq!(*hits.lock().unwrap(), vec!["b"]);
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn test_listener_may_subscribe_during_fire() {
        let emitter = Arc::new(Emitter::<()>::new());
        let inner = emitter.clone();
        emitter.subscribe(move |_| {
            inner.subscribe(|_| {});
        });

        emitter.fire(&());
        assert_eq!(emitter.listener_count(), 2);
    }
}
