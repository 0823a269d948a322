// Recent searches, newest first.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{PersistedState, Store, StoreError};

pub const MAX_RECENT_SEARCHES: usize = 10;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchHistory {
    pub terms: Vec<String>,
}

impl SearchHistory {
    /// Moves `term` to the front. Matching ignores case; blank terms are ignored.
    pub fn with_search(&self, term: &str) -> Self {
        let term = term.trim();
        if term.is_empty() {
            return self.clone();
        }
        let mut terms: Vec<String> = self
            .terms
            .iter()
            .filter(|t| !t.eq_ignore_ascii_case(term))
            .cloned()
            .collect();
        terms.insert(0, term.to_string());
        terms.truncate(MAX_RECENT_SEARCHES);
        SearchHistory { terms }
    }

    pub fn without_search(&self, term: &str) -> Self {
        let term = term.trim();
        SearchHistory {
            terms: self.terms.iter().filter(|t| !t.eq_ignore_ascii_case(term)).cloned().collect(),
        }
    }
}

impl PersistedState for SearchHistory {
    const STORAGE_KEY: &'static str = "recent-searches";
    type Persisted = SearchHistory;

    fn persisted(&self) -> SearchHistory {
        self.clone()
    }

    fn restore(persisted: SearchHistory) -> Self {
        let mut restored = persisted;
        restored.terms.truncate(MAX_RECENT_SEARCHES);
        restored
    }
}

impl Store<SearchHistory> {
    pub fn add_search(&self, term: &str) -> Result<Arc<SearchHistory>, StoreError> {
        self.update(|s| s.with_search(term))
    }

    pub fn remove_search(&self, term: &str) -> Result<Arc<SearchHistory>, StoreError> {
        self.update(|s| s.without_search(term))
    }

    pub fn clear(&self) -> Result<Arc<SearchHistory>, StoreError> {
        self.reset()
    }
}
