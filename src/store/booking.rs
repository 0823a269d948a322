// Active booking draft: chosen services, chosen barber, and the bottom sheet's UI flags.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{PersistedState, Store, StoreError};
use crate::models::{SelectedBarber, SelectedService};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BookingState {
    pub selected_services: Vec<SelectedService>,
    pub selected_barber: Option<SelectedBarber>,
    pub is_sheet_open: bool,
    pub sheet_snap_index: usize,
    pub notes: Option<String>,
}

impl BookingState {
    pub fn has_service(&self, service_id: &str) -> bool {
        self.selected_services.iter().any(|s| s.id == service_id)
    }

    /// Services are a set keyed by id; adding one already present changes nothing
    pub fn with_service_added(&self, service: SelectedService) -> Self {
        let mut next = self.clone();
        if !next.has_service(&service.id) {
            next.selected_services.push(service);
        }
        next
    }

    pub fn with_service_removed(&self, service_id: &str) -> Self {
        let mut next = self.clone();
        next.selected_services.retain(|s| s.id != service_id);
        next
    }

    pub fn with_selected_barber(&self, barber: Option<SelectedBarber>) -> Self {
        BookingState { selected_barber: barber, ..self.clone() }
    }

    pub fn with_sheet_open(&self, is_sheet_open: bool) -> Self {
        BookingState { is_sheet_open, ..self.clone() }
    }

    pub fn with_sheet_snap_index(&self, sheet_snap_index: usize) -> Self {
        BookingState { sheet_snap_index, ..self.clone() }
    }

    pub fn with_notes(&self, notes: Option<String>) -> Self {
        let notes = notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        BookingState { notes, ..self.clone() }
    }

    pub fn total_price_cents(&self) -> i64 {
        self.selected_services.iter().map(|s| s.price_cents).sum()
    }

    pub fn total_duration_minutes(&self) -> u32 {
        self.selected_services.iter().map(|s| s.duration_minutes).sum()
    }
}

/// Sheet position is UI-only and starts closed on every launch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedBooking {
    pub selected_services: Vec<SelectedService>,
    pub selected_barber: Option<SelectedBarber>,
    pub notes: Option<String>,
}

impl PersistedState for BookingState {
    const STORAGE_KEY: &'static str = "booking-storage";
    type Persisted = PersistedBooking;

    fn persisted(&self) -> PersistedBooking {
        PersistedBooking {
            selected_services: self.selected_services.clone(),
            selected_barber: self.selected_barber.clone(),
            notes: self.notes.clone(),
        }
    }

    fn restore(persisted: PersistedBooking) -> Self {
        BookingState {
            selected_services: persisted.selected_services,
            selected_barber: persisted.selected_barber,
            notes: persisted.notes,
            ..BookingState::default()
        }
    }
}

impl Store<BookingState> {
    pub fn add_service(&self, service: SelectedService) -> Result<Arc<BookingState>, StoreError> {
        self.update(|s| s.with_service_added(service))
    }

    pub fn remove_service(&self, service_id: &str) -> Result<Arc<BookingState>, StoreError> {
        self.update(|s| s.with_service_removed(service_id))
    }

    pub fn set_selected_barber(&self, barber: SelectedBarber) -> Result<Arc<BookingState>, StoreError> {
        self.update(|s| s.with_selected_barber(Some(barber)))
    }

    pub fn clear_selected_barber(&self) -> Result<Arc<BookingState>, StoreError> {
        self.update(|s| s.with_selected_barber(None))
    }

    pub fn set_sheet_open(&self, open: bool) -> Result<Arc<BookingState>, StoreError> {
        self.update(|s| s.with_sheet_open(open))
    }

    pub fn set_sheet_snap_index(&self, index: usize) -> Result<Arc<BookingState>, StoreError> {
        self.update(|s| s.with_sheet_snap_index(index))
    }

    pub fn set_notes(&self, notes: Option<String>) -> Result<Arc<BookingState>, StoreError> {
        self.update(|s| s.with_notes(notes))
    }

    pub fn reset_booking(&self) -> Result<Arc<BookingState>, StoreError> {
        self.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    fn service(id: &str, price_cents: i64, minutes: u32) -> SelectedService {
        SelectedService {
            id: id.to_string(),
            name: format!("Service {}", id),
            price_cents,
            duration_minutes: minutes,
        }
    }

    fn store() -> Store<BookingState> {
        Store::open(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_add_service_twice_keeps_one_entry() {
        let booking = store();
        booking.add_service(service("fade", 3000, 30)).unwrap();
        booking.add_service(service("fade", 3000, 30)).unwrap();
        assert_eq!(booking.snapshot().selected_services.len(), 1);
    }

    #[test]
    fn test_remove_unknown_service_is_noop() {
        let booking = store();
        booking.add_service(service("fade", 3000, 30)).unwrap();
        let before = booking.snapshot();
        let after = booking.remove_service("beard").unwrap();
        assert_eq!(*before, *after);
    }

    #[test]
    fn test_totals() {
        let booking = store();
        booking.add_service(service("fade", 3000, 30)).unwrap();
        booking.add_service(service("beard", 1500, 15)).unwrap();
        let state = booking.snapshot();
        assert_eq!(state.total_price_cents(), 4500);
        assert_eq!(state.total_duration_minutes(), 45);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let booking = store();
        booking.add_service(service("fade", 3000, 30)).unwrap();
        booking
            .set_selected_barber(SelectedBarber { id: "b1".to_string(), name: "Sam".to_string(), rating: Some(4.8) })
            .unwrap();
        booking.set_sheet_open(true).unwrap();
        booking.set_sheet_snap_index(2).unwrap();
        booking.set_notes(Some("ring twice".to_string())).unwrap();

        booking.reset_booking().unwrap();
        assert_eq!(*booking.snapshot(), BookingState::default());
    }

    #[test]
    fn test_barber_without_services_is_allowed() {
        let booking = store();
        booking
            .set_selected_barber(SelectedBarber { id: "b1".to_string(), name: "Sam".to_string(), rating: None })
            .unwrap();
        let state = booking.snapshot();
        assert!(state.selected_services.is_empty());
        assert!(state.selected_barber.is_some());

        booking.clear_selected_barber().unwrap();
        assert!(booking.snapshot().selected_barber.is_none());
    }

    #[test]
    fn test_sheet_flags_are_not_persisted() {
        let storage = Arc::new(MemoryStorage::new());
        let booking: Store<BookingState> = Store::open(storage.clone());
        booking.add_service(service("fade", 3000, 30)).unwrap();
        booking.set_sheet_open(true).unwrap();

        let reopened: Store<BookingState> = Store::open(storage);
        let state = reopened.snapshot();
        assert!(state.has_service("fade"));
        assert!(!state.is_sheet_open);
    }

    #[test]
    fn test_blank_notes_clear() {
        let booking = store();
        booking.set_notes(Some("   ".to_string())).unwrap();
        assert_eq!(booking.snapshot().notes, None);
    }
}
