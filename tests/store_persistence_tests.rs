// Persisted store tests
// Stores written through FileStorage and reopened, as a restarted app would.

// Import common test utilities
mod common;
use common::{service, setup_logging};

// External crate imports
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

// Import the crate functionality
use barberline::models::{Location, SavedAddress, SelectedBarber};
use barberline::store::{
    AppState, BookingState, FileStorage, KeyValueStorage, MemoryStorage, SearchHistory, Store, StoreError,
    UserMode, UserState,
};
use barberline::LocalStores;

fn open_stores(dir: &TempDir) -> LocalStores {
    setup_logging();
    LocalStores::open(Arc::new(FileStorage::new(dir.path())))
}

#[test]
fn test_app_mode_survives_restart_but_presence_does_not() {
    let dir = TempDir::new().unwrap();
    {
        let stores = open_stores(&dir);
        stores.app.set_user_mode(UserMode::Barber).unwrap();
        stores.app.set_online(true).unwrap();
        stores.app.set_onboarding_complete(true).unwrap();
    }

    let stores = open_stores(&dir);
    let app = stores.app.snapshot();
    assert_eq!(app.user_mode, UserMode::Barber);
    assert!(app.has_completed_onboarding);
    assert!(!app.is_online);

    let toggled = stores.app.toggle_user_mode().unwrap();
    assert_eq!(toggled.user_mode, UserMode::Customer);
}

#[test]
fn test_booking_draft_survives_restart_without_sheet_state() {
    let dir = TempDir::new().unwrap();
    {
        let stores = open_stores(&dir);
        stores.booking.add_service(service("svc-cut", "Haircut", 3000)).unwrap();
        stores.booking.add_service(service("svc-cut", "Haircut", 3000)).unwrap();
        stores.booking.add_service(service("svc-beard", "Beard trim", 1500)).unwrap();
        stores
            .booking
            .set_selected_barber(SelectedBarber {
                id: "b-ana".to_string(),
                name: "Ana's Chair".to_string(),
                rating: Some(4.9),
            })
            .unwrap();
        stores.booking.set_notes(Some("side door".to_string())).unwrap();
        stores.booking.set_sheet_open(true).unwrap();
        stores.booking.set_sheet_snap_index(2).unwrap();
    }

    let stores = open_stores(&dir);
    let booking = stores.booking.snapshot();
    assert_eq!(booking.selected_services.len(), 2);
    assert_eq!(booking.total_price_cents(), 4500);
    assert_eq!(booking.selected_barber.as_ref().map(|b| b.id.as_str()), Some("b-ana"));
    assert_eq!(booking.notes.as_deref(), Some("side door"));
    assert!(!booking.is_sheet_open);
    assert_eq!(booking.sheet_snap_index, 0);

    stores.booking.reset_booking().unwrap();
    drop(stores);
    let stores = open_stores(&dir);
    assert_eq!(*stores.booking.snapshot(), BookingState::default());
}

#[test]
fn test_user_profile_and_searches_survive_restart() {
    let dir = TempDir::new().unwrap();
    let home = Location {
        latitude: 40.7128,
        longitude: -74.0060,
        label: Some("Home".to_string()),
    };
    {
        let stores = open_stores(&dir);
        stores.user.set_current_location(home.clone()).unwrap();
        stores
            .user
            .add_saved_address(SavedAddress {
                id: "home".to_string(),
                label: "Home".to_string(),
                address: "1 Centre St".to_string(),
                location: home.clone(),
            })
            .unwrap();
        stores.user.set_language(" ES ").unwrap();
        stores.searches.add_search("fade").unwrap();
        stores.searches.add_search("beard").unwrap();
    }

    let stores = open_stores(&dir);
    let user = stores.user.snapshot();
    assert_eq!(user.current_location.as_ref(), Some(&home));
    assert_eq!(user.saved_addresses.len(), 1);
    assert_eq!(user.language, "es");
    assert_eq!(stores.searches.snapshot().terms, vec!["beard", "fade"]);
}

#[test]
fn test_persisted_payload_is_a_versioned_envelope() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir);
    stores.app.set_user_mode(UserMode::Barber).unwrap();
    stores.app.set_online(true).unwrap();

    let raw = fs::read_to_string(dir.path().join("app-storage.json")).unwrap();
    let payload: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(payload["version"], 0);
    assert_eq!(payload["state"]["user_mode"], "barber");
    assert!(payload["state"].get("is_online").is_none());
}

#[test]
fn test_unreadable_payloads_fall_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let storage = FileStorage::new(dir.path());
    storage.set("booking-storage", "{not json").unwrap();
    storage
        .set("user-storage", r#"{"state": {"language": "fr"}, "version": 7}"#)
        .unwrap();

    let stores = open_stores(&dir);
    assert_eq!(*stores.booking.snapshot(), BookingState::default());
    assert_eq!(*stores.user.snapshot(), UserState::default());
    assert_eq!(*stores.app.snapshot(), AppState::default());
    assert_eq!(*stores.searches.snapshot(), SearchHistory::default());
}

#[test]
fn test_failed_save_is_reported_after_commit() {
    setup_logging();
    let storage = Arc::new(MemoryStorage::new());
    let app: Store<AppState> = Store::open(storage.clone());
    storage.set_fail_writes(true);

    let result = app.set_user_mode(UserMode::Barber);
    assert!(matches!(result, Err(StoreError::Unavailable(_))));
    assert_eq!(app.snapshot().user_mode, UserMode::Barber);

    storage.set_fail_writes(false);
    let reopened: Store<AppState> = Store::open(storage.clone());
    assert_eq!(reopened.snapshot().user_mode, UserMode::Customer);
}

#[test]
fn test_cleared_payload_reopens_to_defaults() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir);
    stores.searches.add_search("taper").unwrap();
    stores.searches.clear_persisted().unwrap();

    // In-memory state is untouched
    assert_eq!(stores.searches.snapshot().terms, vec!["taper"]);
    drop(stores);

    let stores = open_stores(&dir);
    assert!(stores.searches.snapshot().terms.is_empty());
}
