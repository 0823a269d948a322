// User profile slice: where the user is, the addresses they saved, and their language.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{PersistedState, Store, StoreError};
use crate::models::{Location, SavedAddress};

pub const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserState {
    pub current_location: Option<Location>,
    pub saved_addresses: Vec<SavedAddress>,
    pub language: String,
}

impl Default for UserState {
    fn default() -> Self {
        UserState {
            current_location: None,
            saved_addresses: Vec::new(),
            language: DEFAULT_LANGUAGE.to_string(),
        }
    }
}

impl UserState {
    pub fn with_current_location(&self, location: Option<Location>) -> Self {
        UserState { current_location: location, ..self.clone() }
    }

    /// Adds the address, or replaces the saved one with the same id
    pub fn with_saved_address(&self, address: SavedAddress) -> Self {
        let mut next = self.clone();
        match next.saved_addresses.iter_mut().find(|a| a.id == address.id) {
            Some(existing) => *existing = address,
            None => next.saved_addresses.push(address),
        }
        next
    }

    pub fn without_saved_address(&self, address_id: &str) -> Self {
        let mut next = self.clone();
        next.saved_addresses.retain(|a| a.id != address_id);
        next
    }

    pub fn with_language(&self, language: &str) -> Self {
        UserState { language: language.trim().to_ascii_lowercase(), ..self.clone() }
    }

    pub fn saved_address(&self, address_id: &str) -> Option<&SavedAddress> {
        self.saved_addresses.iter().find(|a| a.id == address_id)
    }
}

impl PersistedState for UserState {
    const STORAGE_KEY: &'static str = "user-storage";
    type Persisted = UserState;

    fn persisted(&self) -> UserState {
        self.clone()
    }

    fn restore(persisted: UserState) -> Self {
        persisted
    }
}

impl Store<UserState> {
    pub fn set_current_location(&self, location: Location) -> Result<Arc<UserState>, StoreError> {
        self.update(|s| s.with_current_location(Some(location)))
    }

    pub fn clear_current_location(&self) -> Result<Arc<UserState>, StoreError> {
        self.update(|s| s.with_current_location(None))
    }

    pub fn add_saved_address(&self, address: SavedAddress) -> Result<Arc<UserState>, StoreError> {
        self.update(|s| s.with_saved_address(address))
    }

    pub fn remove_saved_address(&self, address_id: &str) -> Result<Arc<UserState>, StoreError> {
        self.update(|s| s.without_saved_address(address_id))
    }

    pub fn set_language(&self, language: &str) -> Result<Arc<UserState>, StoreError> {
        self.update(|s| s.with_language(language))
    }
}
