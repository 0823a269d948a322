// Local state stores
//
// Each store holds an immutable snapshot of its state. Setters build the next
// snapshot from the current one, publish it, then run the change listeners; the
// persistence listener writes the declared subset of fields to on-device storage.

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;

pub mod app;
pub mod booking;
pub mod search;
pub mod storage;
pub mod user;

pub use app::{AppState, UserMode};
pub use booking::BookingState;
pub use search::SearchHistory;
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use user::UserState;

/// Errors from reading or writing persisted state
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Stored state has version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// A state type that can live in a `Store`
pub trait PersistedState: Default + Clone + PartialEq + Send + Sync + 'static {
    /// Storage key the persisted fields are written under
    const STORAGE_KEY: &'static str;
    /// Bumped whenever `Persisted` changes shape; older payloads are discarded
    const VERSION: u32 = 0;

    type Persisted: Serialize + DeserializeOwned;

    fn persisted(&self) -> Self::Persisted;

    /// Rebuild a state from its persisted fields; the rest take their defaults
    fn restore(persisted: Self::Persisted) -> Self;
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    state: T,
    version: u32,
}

/// Read the persisted fields of `S`. `Ok(None)` when nothing was stored yet.
pub fn load<S: PersistedState>(storage: &dyn KeyValueStorage) -> Result<Option<S>, StoreError> {
    let Some(raw) = storage.get(S::STORAGE_KEY)? else {
        return Ok(None);
    };
    let envelope: Envelope<S::Persisted> = serde_json::from_str(&raw)?;
    if envelope.version != S::VERSION {
        return Err(StoreError::VersionMismatch {
            found: envelope.version,
            expected: S::VERSION,
        });
    }
    Ok(Some(S::restore(envelope.state)))
}

/// Write the persisted fields of `state`
pub fn save<S: PersistedState>(storage: &dyn KeyValueStorage, state: &S) -> Result<(), StoreError> {
    let envelope = Envelope {
        state: state.persisted(),
        version: S::VERSION,
    };
    storage.set(S::STORAGE_KEY, &serde_json::to_string(&envelope)?)
}

pub type Listener<S> = Box<dyn Fn(&S) -> Result<(), StoreError> + Send + Sync>;

pub struct Store<S: PersistedState> {
    state: watch::Sender<Arc<S>>,
    storage: Arc<dyn KeyValueStorage>,
    listeners: Mutex<Vec<Listener<S>>>,
    // Serializes whole updates so listeners observe snapshots in commit order
    write_lock: Mutex<()>,
}

impl<S: PersistedState> Store<S> {
    /// Rehydrate from storage, falling back to defaults, and start persisting changes
    pub fn open(storage: Arc<dyn KeyValueStorage>) -> Self {
        let initial = match load::<S>(storage.as_ref()) {
            Ok(Some(state)) => {
                info!("Rehydrated {} from storage", S::STORAGE_KEY);
                state
            }
            Ok(None) => S::default(),
            Err(e) => {
                warn!("Could not rehydrate {}, using defaults: {}", S::STORAGE_KEY, e);
                S::default()
            }
        };

        let (state, _) = watch::channel(Arc::new(initial));
        let store = Store {
            state,
            storage: storage.clone(),
            listeners: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
        };
        store.add_listener(Box::new(move |state: &S| save(storage.as_ref(), state)));
        store
    }

    pub fn add_listener(&self, listener: Listener<S>) {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn snapshot(&self) -> Arc<S> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<S>> {
        self.state.subscribe()
    }

    /// Commit `f(current)` and run the listeners. An update that changes nothing
    /// is neither published nor saved. On `Err` the new state is still committed;
    /// the error only reports a failed listener.
    pub fn update(&self, f: impl FnOnce(&S) -> S) -> Result<Arc<S>, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut committed: Option<Arc<S>> = None;
        self.state.send_if_modified(|current| {
            let next = f(current);
            if next == **current {
                return false;
            }
            let next = Arc::new(next);
            *current = next.clone();
            committed = Some(next);
            true
        });

        match committed {
            Some(snapshot) => {
                debug!("{} changed", S::STORAGE_KEY);
                self.notify(&snapshot)?;
                Ok(snapshot)
            }
            None => Ok(self.snapshot()),
        }
    }

    /// Back to the documented defaults
    pub fn reset(&self) -> Result<Arc<S>, StoreError> {
        self.update(|_| S::default())
    }

    /// Drop the persisted copy without touching the in-memory state
    pub fn clear_persisted(&self) -> Result<(), StoreError> {
        self.storage.remove(S::STORAGE_KEY)
    }

    fn notify(&self, state: &S) -> Result<(), StoreError> {
        let listeners = self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut first_error = None;
        for listener in listeners.iter() {
            if let Err(e) = listener(state) {
                error!("Listener for {} failed: {}", S::STORAGE_KEY, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
        #[serde(skip)]
        scratch: u32,
    }

    impl PersistedState for Counter {
        const STORAGE_KEY: &'static str = "counter";
        const VERSION: u32 = 2;
        type Persisted = Counter;

        fn persisted(&self) -> Counter {
            Counter { value: self.value, scratch: 0 }
        }

        fn restore(persisted: Counter) -> Self {
            persisted
        }
    }

    #[test]
    fn test_update_persists_declared_fields() {
        let storage = Arc::new(MemoryStorage::new());
        let store: Store<Counter> = Store::open(storage.clone());

        store.update(|c| Counter { value: c.value + 1, scratch: 9 }).unwrap();

        let reopened: Store<Counter> = Store::open(storage);
        assert_eq!(*reopened.snapshot(), Counter { value: 1, scratch: 0 });
    }

    #[test]
    fn test_unchanged_update_skips_listeners() {
        let storage = Arc::new(MemoryStorage::new());
        let store: Store<Counter> = Store::open(storage);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        store.add_listener(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        store.update(|c| c.clone()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        store.update(|c| Counter { value: c.value + 1, ..c.clone() }).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_failure_is_returned_but_state_commits() {
        let storage = Arc::new(MemoryStorage::new());
        let store: Store<Counter> = Store::open(storage.clone());
        storage.set_fail_writes(true);

        let result = store.update(|c| Counter { value: c.value + 5, ..c.clone() });
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.snapshot().value, 5);
    }

    #[test]
    fn test_corrupt_or_outdated_payload_falls_back_to_defaults() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set("counter", "not json").unwrap();
        let store: Store<Counter> = Store::open(storage.clone());
        assert_eq!(*store.snapshot(), Counter::default());

        storage.set("counter", r#"{"state":{"value":7},"version":1}"#).unwrap();
        assert!(matches!(
            load::<Counter>(storage.as_ref()),
            Err(StoreError::VersionMismatch { found: 1, expected: 2 })
        ));
        let store: Store<Counter> = Store::open(storage);
        assert_eq!(store.snapshot().value, 0);
    }

    #[test]
    fn test_subscribers_see_new_snapshots() {
        let store: Store<Counter> = Store::open(Arc::new(MemoryStorage::new()));
        let rx = store.subscribe();

        store.update(|c| Counter { value: 3, ..c.clone() }).unwrap();
        assert_eq!(rx.borrow().value, 3);
        assert!(rx.has_changed().unwrap());
    }
}
