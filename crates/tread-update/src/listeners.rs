//! Update-available subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

/// Details passed to update listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    /// Generation that is waiting or already took control.
    pub version: String,
}

/// Handle returned by `on_update_available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

pub type UpdateCallback = Arc<dyn Fn(&UpdateInfo) + Send + Sync + 'static>;

#[derive(Default)]
pub(crate) struct Listeners {
    entries: Mutex<Vec<(ListenerId, UpdateCallback)>>,
}

impl Listeners {
    pub fn add(&self, callback: UpdateCallback) -> ListenerId {
        let id = ListenerId::new();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, callback));
        trace!(?id, "Update listener added");
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        before != entries.len()
    }

    /// Call every listener. The registry is not locked while callbacks run,
    /// so a callback may add or remove listeners.
    pub fn fire(&self, info: &UpdateInfo) -> usize {
        let callbacks: Vec<UpdateCallback> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in &callbacks {
            callback(info);
        }
        callbacks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fire_and_remove() {
        let listeners = Listeners::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let first = listeners.add(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = calls.clone();
        listeners.add(Arc::new(move |_| {
            counter.fetch_add(10, Ordering::SeqCst);
        }));

        let info = UpdateInfo {
            version: "B".to_string(),
        };
        assert_eq!(listeners.fire(&info), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 11);

        assert!(listeners.remove(first));
        assert!(!listeners.remove(first));
        listeners.fire(&info);
        assert_eq!(calls.load(Ordering::SeqCst), 21);
    }
}
