// BookingClient bundles the gateway, the shared query cache, configuration and the
// local stores, and is passed to whatever needs them instead of living in globals.

use std::sync::Arc;

use crate::backend::{Backend, BackendError};
use crate::booking;
use crate::config::ClientConfig;
use crate::models::{ChatMessage, NearbyBarber, ServiceRequest};
use crate::store::{AppState, BookingState, KeyValueStorage, SearchHistory, Store, UserState};
use crate::sync::chat::{self, ChatHandle};
use crate::sync::request_status::{PollOptions, RequestStatusHandle};
use crate::sync::QueryCache;

/// The four persisted local stores
pub struct LocalStores {
    pub app: Store<AppState>,
    pub booking: Store<BookingState>,
    pub user: Store<UserState>,
    pub searches: Store<SearchHistory>,
}

impl LocalStores {
    pub fn open(storage: Arc<dyn KeyValueStorage>) -> Self {
        LocalStores {
            app: Store::open(storage.clone()),
            booking: Store::open(storage.clone()),
            user: Store::open(storage.clone()),
            searches: Store::open(storage),
        }
    }
}

#[derive(Clone)]
pub struct BookingClient {
    backend: Arc<dyn Backend>,
    cache: QueryCache,
    config: ClientConfig,
    stores: Arc<LocalStores>,
}

impl BookingClient {
    pub fn new(backend: Arc<dyn Backend>, storage: Arc<dyn KeyValueStorage>, config: ClientConfig) -> Self {
        BookingClient {
            backend,
            cache: QueryCache::new(),
            config,
            stores: Arc::new(LocalStores::open(storage)),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn stores(&self) -> &LocalStores {
        &self.stores
    }

    pub fn watch_request(&self, request_id: &str) -> RequestStatusHandle {
        RequestStatusHandle::spawn(
            self.backend.clone(),
            self.cache.clone(),
            request_id,
            PollOptions::from(&self.config),
        )
    }

    pub fn watch_chat(&self, request_id: Option<&str>) -> ChatHandle {
        ChatHandle::spawn(self.backend.clone(), self.cache.clone(), request_id)
    }

    /// Messages are attributed to the side of the marketplace the app is in
    pub async fn send_text(&self, request_id: &str, content: &str) -> Result<ChatMessage, BackendError> {
        let role = self.stores.app.snapshot().user_mode.sender_role();
        chat::send_text(self.backend.as_ref(), &self.cache, request_id, content, role).await
    }

    /// Offer that expires after the configured number of minutes
    pub async fn send_offer(&self, request_id: &str, amount_cents: i64) -> Result<ChatMessage, BackendError> {
        self.send_offer_expiring(request_id, amount_cents, self.config.offer_expiry_minutes)
            .await
    }

    pub async fn send_offer_expiring(
        &self,
        request_id: &str,
        amount_cents: i64,
        expires_in_minutes: i64,
    ) -> Result<ChatMessage, BackendError> {
        let role = self.stores.app.snapshot().user_mode.sender_role();
        chat::send_offer(
            self.backend.as_ref(),
            &self.cache,
            request_id,
            amount_cents,
            expires_in_minutes,
            role,
        )
        .await
    }

    pub async fn respond_to_offer(&self, message_id: &str, accept: bool) -> Result<ChatMessage, BackendError> {
        chat::respond_to_offer(self.backend.as_ref(), &self.cache, message_id, accept).await
    }

    /// Post the booking draft at the user's current location
    pub async fn create_request(&self, address: Option<&str>) -> Result<ServiceRequest, BackendError> {
        let booking = self.stores.booking.snapshot();
        let user = self.stores.user.snapshot();
        booking::create_request(
            self.backend.as_ref(),
            &booking,
            user.current_location.as_ref(),
            address,
        )
        .await
    }

    pub async fn nearby_barbers(&self) -> Result<Vec<NearbyBarber>, BackendError> {
        self.nearby_barbers_within(self.config.nearby_radius_km).await
    }

    pub async fn nearby_barbers_within(&self, radius_km: f64) -> Result<Vec<NearbyBarber>, BackendError> {
        let user = self.stores.user.snapshot();
        booking::nearby_barbers(self.backend.as_ref(), user.current_location.as_ref(), radius_km).await
    }
}
