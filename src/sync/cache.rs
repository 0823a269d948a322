// Process-wide query cache
// Entries are keyed by (resource, parameters). Each key also carries its refresh
// mode, which any holder of the cache may change.

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::backend::BackendError;

const INVALIDATION_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub resource: String,
    pub params: Vec<String>,
}

impl QueryKey {
    pub fn new(resource: &str, params: &[&str]) -> Self {
        QueryKey {
            resource: resource.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.resource, self.params.join(","))
    }
}

/// Whether scheduled refreshes may run for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshMode {
    /// The owner's own policy decides
    #[default]
    Auto,
    /// No scheduled refresh fires until the mode goes back to Auto
    Disabled,
}

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    data: Option<Value>,
    error: Option<BackendError>,
    refresh: RefreshMode,
}

/// Shared handle; clones see the same entries
#[derive(Clone)]
pub struct QueryCache {
    entries: Arc<Mutex<HashMap<QueryKey, CacheEntry>>>,
    invalidations: broadcast::Sender<QueryKey>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_CAPACITY);
        QueryCache {
            entries: Arc::new(Mutex::new(HashMap::new())),
            invalidations,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached value for `key`, if present and decodable as `T`
    pub fn get<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        let value = self.lock().get(key).and_then(|entry| entry.data.clone())?;
        match serde_json::from_value(value) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Cached value for {} has an unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// Store fresh data and clear any previous error
    pub fn set<T: Serialize>(&self, key: &QueryKey, data: &T) {
        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                warn!("Could not cache {}: {}", key, e);
                return;
            }
        };
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_default();
        entry.data = Some(value);
        entry.error = None;
    }

    /// Record a failed fetch; previously cached data stays in place
    pub fn set_error(&self, key: &QueryKey, error: BackendError) {
        self.lock().entry(key.clone()).or_default().error = Some(error);
    }

    pub fn error(&self, key: &QueryKey) -> Option<BackendError> {
        self.lock().get(key).and_then(|entry| entry.error.clone())
    }

    pub fn refresh_mode(&self, key: &QueryKey) -> RefreshMode {
        self.lock().get(key).map(|entry| entry.refresh).unwrap_or_default()
    }

    pub fn set_refresh_mode(&self, key: &QueryKey, mode: RefreshMode) {
        debug!("Refresh mode for {} -> {:?}", key, mode);
        self.lock().entry(key.clone()).or_default().refresh = mode;
    }

    /// Tell every observer of `key` that its data is stale
    pub fn invalidate(&self, key: &QueryKey) {
        debug!("Invalidating {}", key);
        // No receivers just means nobody is watching this key right now
        let _ = self.invalidations.send(key.clone());
    }

    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<QueryKey> {
        self.invalidations.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_and_error_keep_stale_data() {
        let cache = QueryCache::new();
        let key = QueryKey::new("messages", &["req-1"]);

        cache.set(&key, &vec!["a".to_string()]);
        cache.set_error(&key, BackendError::Fetch("offline".to_string()));

        assert_eq!(cache.get::<Vec<String>>(&key), Some(vec!["a".to_string()]));
        assert_eq!(cache.error(&key), Some(BackendError::Fetch("offline".to_string())));

        cache.set(&key, &vec!["a".to_string(), "b".to_string()]);
        assert!(cache.error(&key).is_none());
    }

    #[test]
    fn test_refresh_mode_is_shared_between_clones() {
        let cache = QueryCache::new();
        let other = cache.clone();
        let key = QueryKey::new("service_request", &["r1"]);

        assert_eq!(cache.refresh_mode(&key), RefreshMode::Auto);
        other.set_refresh_mode(&key, RefreshMode::Disabled);
        assert_eq!(cache.refresh_mode(&key), RefreshMode::Disabled);
    }

    #[tokio::test]
    async fn test_invalidation_is_broadcast() {
        let cache = QueryCache::new();
        let mut rx = cache.subscribe_invalidations();
        let key = QueryKey::new("messages", &["req-1"]);

        cache.invalidate(&key);
        assert_eq!(rx.recv().await.unwrap(), key);
    }
}
