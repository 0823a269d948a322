// Booking workflow tests
// Posting a service request from the local booking draft and finding nearby barbers.

// Import common test utilities
mod common;
use common::{client_for, seed_barbers, service, signed_in_backend, wait_for, BARBER_ID, CUSTOMER_ID};

// External crate imports
use std::time::Duration;

// Import the crate functionality
use barberline::models::{Location, RequestStatus, SelectedBarber, TABLE_SERVICE_REQUESTS};
use barberline::sync::PollState;
use barberline::{BackendError, ClientConfig, MemoryBackend};

fn city_hall() -> Location {
    Location {
        latitude: 40.7128,
        longitude: -74.0060,
        label: Some("City Hall".to_string()),
    }
}

#[tokio::test]
async fn test_create_request_requires_sign_in() {
    let backend = MemoryBackend::new();
    let client = client_for(&backend, ClientConfig::default());
    client.stores().user.set_current_location(city_hall()).unwrap();
    client.stores().booking.add_service(service("svc-cut", "Haircut", 3000)).unwrap();

    let result = client.create_request(None).await;
    assert!(matches!(result, Err(BackendError::AuthRequired(_))), "{:?}", result);
    assert!(backend.rows(TABLE_SERVICE_REQUESTS).is_empty());
}

#[tokio::test]
async fn test_create_request_needs_location_and_services() {
    let backend = signed_in_backend();
    let client = client_for(&backend, ClientConfig::default());

    let no_location = client.create_request(None).await;
    assert!(matches!(no_location, Err(BackendError::Configuration(_))));

    client.stores().user.set_current_location(city_hall()).unwrap();
    client
        .stores()
        .booking
        .set_selected_barber(SelectedBarber {
            id: BARBER_ID.to_string(),
            name: "Ana's Chair".to_string(),
            rating: None,
        })
        .unwrap();
    let no_services = client.create_request(None).await;
    assert!(matches!(no_services, Err(BackendError::Configuration(_))));
    assert!(backend.rows(TABLE_SERVICE_REQUESTS).is_empty());
}

#[tokio::test]
async fn test_create_request_posts_the_draft() {
    let backend = signed_in_backend();
    let client = client_for(&backend, ClientConfig::default());
    let stores = client.stores();
    stores.user.set_current_location(city_hall()).unwrap();
    stores.booking.add_service(service("svc-cut", "Haircut", 3000)).unwrap();
    stores.booking.add_service(service("svc-beard", "Beard trim", 1500)).unwrap();
    stores.booking.set_notes(Some("side door".to_string())).unwrap();

    let request = client.create_request(None).await.unwrap();
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.customer_id, CUSTOMER_ID);
    assert_eq!(request.services, vec!["Haircut", "Beard trim"]);
    assert_eq!(request.address.as_deref(), Some("City Hall"));
    assert_eq!(request.notes.as_deref(), Some("side door"));
    assert_eq!(request.barber_id, None);

    let explicit = client.create_request(Some("1 Centre St")).await.unwrap();
    assert_eq!(explicit.address.as_deref(), Some("1 Centre St"));
    assert_ne!(explicit.id, request.id);
    assert_eq!(backend.rows(TABLE_SERVICE_REQUESTS).len(), 2);

    // A freshly posted request is polled
    let handle = client.watch_request(&request.id);
    let mut updates = handle.subscribe();
    let snapshot = wait_for(&mut updates, |s| s.fetches >= 1).await;
    assert_eq!(snapshot.status(), Some(RequestStatus::Pending));
    assert_eq!(snapshot.poll_state, PollState::Polling);
    assert_eq!(snapshot.response_count, 0);
}

#[tokio::test]
async fn test_nearby_barbers_sorted_by_distance() {
    let backend = signed_in_backend();
    seed_barbers(&backend);
    let client = client_for(&backend, ClientConfig::default());

    let no_location = client.nearby_barbers().await;
    assert!(matches!(no_location, Err(BackendError::Configuration(_))));

    client.stores().user.set_current_location(city_hall()).unwrap();
    let nearby = client.nearby_barbers().await.unwrap();
    let ids: Vec<&str> = nearby.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids, vec![BARBER_ID, "b-lee"]);
    assert!(nearby[0].distance_km < nearby[1].distance_km);
    assert!(nearby.iter().all(|b| b.distance_km <= client.config().nearby_radius_km));

    let everyone = client.nearby_barbers_within(500.0).await.unwrap();
    assert_eq!(everyone.len(), 3);
    assert_eq!(everyone[2].id, "b-far");

    let invalid = client.nearby_barbers_within(0.0).await;
    assert!(matches!(invalid, Err(BackendError::Configuration(_))));
}

#[tokio::test]
async fn test_config_from_environment() {
    std::env::set_var("BARBERLINE_CONFIG", "/nonexistent/barberline-test/config.json");
    std::env::set_var("BARBERLINE_POLL_INTERVAL_MS", "750");

    let config = ClientConfig::load().unwrap();
    assert_eq!(config.poll_interval(), Duration::from_millis(750));
    assert_eq!(config.fetch_timeout(), Some(Duration::from_secs(10)));

    std::env::remove_var("BARBERLINE_POLL_INTERVAL_MS");
    std::env::remove_var("BARBERLINE_CONFIG");
}
