// Booking workflows built on remote procedures: posting a service request and
// finding barbers around the user.

use log::info;
use serde_json::json;

use crate::backend::{Backend, BackendError};
use crate::models::{Location, NearbyBarber, ServiceRequest, RPC_CREATE_SERVICE_REQUEST, RPC_NEARBY_BARBERS};
use crate::store::BookingState;

/// Post the current booking draft as a new service request at `location`
pub async fn create_request(
    backend: &dyn Backend,
    booking: &BookingState,
    location: Option<&Location>,
    address: Option<&str>,
) -> Result<ServiceRequest, BackendError> {
    let user = backend
        .current_user()
        .ok_or_else(|| BackendError::AuthRequired("sign in to request a barber".to_string()))?;
    let location = location.ok_or_else(|| {
        BackendError::Configuration("a location is required to request a barber".to_string())
    })?;
    if booking.selected_services.is_empty() {
        return Err(BackendError::Configuration("select at least one service first".to_string()));
    }

    let services: Vec<&str> = booking.selected_services.iter().map(|s| s.name.as_str()).collect();
    let params = json!({
        "customer_id": user.id,
        "services": services,
        "barber_id": booking.selected_barber.as_ref().map(|b| b.id.as_str()),
        "latitude": location.latitude,
        "longitude": location.longitude,
        "address": address.or(location.label.as_deref()),
        "notes": booking.notes,
    });

    let row = backend.rpc(RPC_CREATE_SERVICE_REQUEST, params).await?;
    let request: ServiceRequest = serde_json::from_value(row).map_err(|e| BackendError::decode("service request", e))?;
    info!("Created service request {} for {} services", request.id, request.services.len());
    Ok(request)
}

/// Barbers within `radius_km` of `location`, nearest first
pub async fn nearby_barbers(
    backend: &dyn Backend,
    location: Option<&Location>,
    radius_km: f64,
) -> Result<Vec<NearbyBarber>, BackendError> {
    let location = location.ok_or_else(|| {
        BackendError::Configuration("set a location before searching for barbers".to_string())
    })?;
    if !(radius_km > 0.0) {
        return Err(BackendError::Configuration(format!("search radius must be positive, got {}", radius_km)));
    }

    let params = json!({
        "latitude": location.latitude,
        "longitude": location.longitude,
        "radius_km": radius_km,
    });
    let rows = backend.rpc(RPC_NEARBY_BARBERS, params).await?;
    let mut barbers: Vec<NearbyBarber> =
        serde_json::from_value(rows).map_err(|e| BackendError::decode("nearby barbers", e))?;
    barbers.sort_by(|a, b| a.distance_km.partial_cmp(&b.distance_km).unwrap_or(std::cmp::Ordering::Equal));
    Ok(barbers)
}
