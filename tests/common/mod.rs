// Common test utilities for integration tests
// This module contains shared code for all integration tests
#![allow(dead_code)]

// Standard library imports
use std::sync::{Arc, Once};
use std::time::Duration;

// External crate imports
use log::LevelFilter;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::timeout;

// Import the crate functionality
use barberline::{
    models::{AuthUser, SelectedService, TABLE_BARBERS, TABLE_BARBER_RESPONSES, TABLE_MESSAGES, TABLE_SERVICE_REQUESTS},
    store::MemoryStorage,
    BookingClient, ClientConfig, MemoryBackend,
};

pub const CUSTOMER_ID: &str = "u-customer";
pub const BARBER_ID: &str = "b-ana";

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub fn customer() -> AuthUser {
    AuthUser {
        id: CUSTOMER_ID.to_string(),
        email: Some("customer@example.com".to_string()),
    }
}

pub fn barber() -> AuthUser {
    AuthUser {
        id: BARBER_ID.to_string(),
        email: None,
    }
}

/// Memory backend with the customer signed in
pub fn signed_in_backend() -> MemoryBackend {
    setup_logging();
    MemoryBackend::with_user(customer())
}

/// Client over `backend` with in-memory stores
pub fn client_for(backend: &MemoryBackend, config: ClientConfig) -> BookingClient {
    BookingClient::new(Arc::new(backend.clone()), Arc::new(MemoryStorage::new()), config)
}

pub fn request_row(id: &str, status: &str) -> Value {
    json!({
        "id": id,
        "customer_id": CUSTOMER_ID,
        "status": status,
        "services": ["Haircut"],
        "latitude": 40.7128,
        "longitude": -74.0060,
        "created_at": "2024-05-01T10:00:00Z",
    })
}

pub fn seed_request(backend: &MemoryBackend, id: &str, status: &str) {
    backend.seed(TABLE_SERVICE_REQUESTS, vec![request_row(id, status)]);
}

pub fn seed_response(backend: &MemoryBackend, id: &str, request_id: &str, price_cents: i64, created_at: &str) {
    backend.seed(
        TABLE_BARBER_RESPONSES,
        vec![json!({
            "id": id,
            "request_id": request_id,
            "barber_id": BARBER_ID,
            "price_cents": price_cents,
            "eta_minutes": 15,
            "created_at": created_at,
        })],
    );
}

pub fn message_row(id: &str, request_id: &str, content: &str, created_at: &str) -> Value {
    json!({
        "id": id,
        "request_id": request_id,
        "sender_id": CUSTOMER_ID,
        "sender_role": "customer",
        "kind": "text",
        "content": content,
        "created_at": created_at,
    })
}

pub fn seed_barbers(backend: &MemoryBackend) {
    backend.seed(
        TABLE_BARBERS,
        vec![
            json!({"id": "b-lee", "name": "Lee Cuts", "rating": 4.7, "latitude": 40.7410, "longitude": -73.9890}),
            json!({"id": BARBER_ID, "name": "Ana's Chair", "rating": 4.9, "latitude": 40.7150, "longitude": -74.0090}),
            json!({"id": "b-far", "name": "Upstate Shears", "latitude": 42.6526, "longitude": -73.7562}),
        ],
    );
}

pub fn service(id: &str, name: &str, price_cents: i64) -> SelectedService {
    SelectedService {
        id: id.to_string(),
        name: name.to_string(),
        price_cents,
        duration_minutes: 30,
    }
}

pub fn message_count(backend: &MemoryBackend, request_id: &str) -> usize {
    backend
        .rows(TABLE_MESSAGES)
        .iter()
        .filter(|row| row["request_id"] == request_id)
        .count()
}

/// Wait until the watched value satisfies `predicate`, failing the test after five seconds
pub async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, predicate: impl FnMut(&T) -> bool) -> T {
    let value = timeout(Duration::from_secs(5), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("watch channel closed");
    (*value).clone()
}
