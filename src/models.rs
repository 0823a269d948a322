// Row types shared by the backend gateway, the synchronizers and the stores.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const TABLE_SERVICE_REQUESTS: &str = "service_requests";
pub const TABLE_BARBER_RESPONSES: &str = "barber_responses";
pub const TABLE_MESSAGES: &str = "messages";
pub const TABLE_BARBERS: &str = "barbers";

pub const RPC_CREATE_SERVICE_REQUEST: &str = "create_service_request";
pub const RPC_NEARBY_BARBERS: &str = "nearby_barbers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Matching,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RequestStatus {
    /// Statuses for which the backend may still attach new barber responses.
    pub fn is_active(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::Matching)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Matching => "matching",
            RequestStatus::Accepted => "accepted",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Expired => "expired",
            RequestStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: String,
    pub customer_id: String,
    pub status: RequestStatus,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub barber_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarberResponse {
    pub id: String,
    pub request_id: String,
    pub barber_id: String,
    pub price_cents: i64,
    pub eta_minutes: u32,
    #[serde(default)]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A service request joined with every response submitted against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestWithResponses {
    pub request: ServiceRequest,
    pub responses: Vec<BarberResponse>,
}

impl RequestWithResponses {
    pub fn response_count(&self) -> usize {
        self.responses.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Customer,
    Barber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Offer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub request_id: String,
    pub sender_id: String,
    pub sender_role: SenderRole,
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub offer_amount_cents: Option<i64>,
    #[serde(default)]
    pub offer_status: Option<OfferStatus>,
    #[serde(default)]
    pub offer_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn is_offer(&self) -> bool {
        self.kind == MessageKind::Offer
    }

    /// Offers past their expiry can no longer be answered. Text messages never expire.
    pub fn is_offer_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.kind, self.offer_expires_at) {
            (MessageKind::Offer, Some(expires_at)) => now >= expires_at,
            _ => false,
        }
    }
}

/// Fields the client writes when creating a chat row; the backend fills in id and timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct NewChatMessage {
    pub request_id: String,
    pub sender_id: String,
    pub sender_role: SenderRole,
    pub kind: MessageKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer_amount_cents: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer_status: Option<OfferStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer_expires_at: Option<DateTime<Utc>>,
}

impl NewChatMessage {
    pub fn text(request_id: &str, sender_id: &str, role: SenderRole, content: &str) -> Self {
        NewChatMessage {
            request_id: request_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_role: role,
            kind: MessageKind::Text,
            content: content.to_string(),
            offer_amount_cents: None,
            offer_status: None,
            offer_expires_at: None,
        }
    }

    pub fn offer(
        request_id: &str,
        sender_id: &str,
        role: SenderRole,
        amount_cents: i64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        NewChatMessage {
            request_id: request_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_role: role,
            kind: MessageKind::Offer,
            content: format_price(amount_cents),
            offer_amount_cents: Some(amount_cents),
            offer_status: Some(OfferStatus::Pending),
            offer_expires_at: Some(expires_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub label: Option<String>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Location { latitude, longitude, label: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedAddress {
    pub id: String,
    pub label: String,
    pub address: String,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedService {
    pub id: String,
    pub name: String,
    pub price_cents: i64,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedBarber {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rating: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyBarber {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rating: Option<f32>,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_km: f64,
}

/// When an offer made at `now` lapses. None unless `minutes` is positive and the
/// result is representable.
pub fn offer_expiry(now: DateTime<Utc>, minutes: i64) -> Option<DateTime<Utc>> {
    if minutes <= 0 {
        return None;
    }
    Duration::try_minutes(minutes).and_then(|lifetime| now.checked_add_signed(lifetime))
}

/// Renders an amount in cents as "$12.50".
pub fn format_price(amount_cents: i64) -> String {
    let sign = if amount_cents < 0 { "-" } else { "" };
    let abs = amount_cents.abs();
    format!("{}${}.{:02}", sign, abs / 100, abs % 100)
}
