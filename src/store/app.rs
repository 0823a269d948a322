// App-wide mode flags: which side of the marketplace the user is on, presence, onboarding.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::{PersistedState, Store, StoreError};
use crate::models::SenderRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserMode {
    #[default]
    Customer,
    Barber,
}

impl UserMode {
    pub fn toggled(self) -> Self {
        match self {
            UserMode::Customer => UserMode::Barber,
            UserMode::Barber => UserMode::Customer,
        }
    }

    /// How messages sent in this mode are attributed in chat
    pub fn sender_role(self) -> SenderRole {
        match self {
            UserMode::Customer => SenderRole::Customer,
            UserMode::Barber => SenderRole::Barber,
        }
    }
}

impl fmt::Display for UserMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserMode::Customer => f.write_str("customer"),
            UserMode::Barber => f.write_str("barber"),
        }
    }
}

impl FromStr for UserMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "customer" => Ok(UserMode::Customer),
            "barber" => Ok(UserMode::Barber),
            other => Err(format!("unknown mode '{}', expected customer or barber", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppState {
    pub user_mode: UserMode,
    pub is_online: bool,
    pub has_completed_onboarding: bool,
}

impl AppState {
    pub fn with_user_mode(&self, user_mode: UserMode) -> Self {
        AppState { user_mode, ..self.clone() }
    }

    pub fn with_user_mode_toggled(&self) -> Self {
        self.with_user_mode(self.user_mode.toggled())
    }

    pub fn with_online(&self, is_online: bool) -> Self {
        AppState { is_online, ..self.clone() }
    }

    pub fn with_onboarding_complete(&self, has_completed_onboarding: bool) -> Self {
        AppState { has_completed_onboarding, ..self.clone() }
    }
}

/// Presence is per session and is not written to storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedApp {
    pub user_mode: UserMode,
    pub has_completed_onboarding: bool,
}

impl PersistedState for AppState {
    const STORAGE_KEY: &'static str = "app-storage";
    type Persisted = PersistedApp;

    fn persisted(&self) -> PersistedApp {
        PersistedApp {
            user_mode: self.user_mode,
            has_completed_onboarding: self.has_completed_onboarding,
        }
    }

    fn restore(persisted: PersistedApp) -> Self {
        AppState {
            user_mode: persisted.user_mode,
            has_completed_onboarding: persisted.has_completed_onboarding,
            ..AppState::default()
        }
    }
}

impl Store<AppState> {
    pub fn set_user_mode(&self, mode: UserMode) -> Result<Arc<AppState>, StoreError> {
        self.update(|s| s.with_user_mode(mode))
    }

    pub fn toggle_user_mode(&self) -> Result<Arc<AppState>, StoreError> {
        self.update(AppState::with_user_mode_toggled)
    }

    pub fn set_online(&self, is_online: bool) -> Result<Arc<AppState>, StoreError> {
        self.update(|s| s.with_online(is_online))
    }

    pub fn toggle_online(&self) -> Result<Arc<AppState>, StoreError> {
        self.update(|s| s.with_online(!s.is_online))
    }

    pub fn set_onboarding_complete(&self, complete: bool) -> Result<Arc<AppState>, StoreError> {
        self.update(|s| s.with_onboarding_complete(complete))
    }
}
