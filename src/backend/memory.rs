// In-process backend
// Tables of JSON rows with server-side id/timestamp assignment, change fan-out to
// channels, and the remote procedures the booking flow relies on.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use super::{Backend, BackendError, ChangeEvent, ChangeKind, Channel, ChannelFilter, Order, Query};
use crate::models::{AuthUser, RPC_CREATE_SERVICE_REQUEST, RPC_NEARBY_BARBERS, TABLE_BARBERS, TABLE_SERVICE_REQUESTS};

const DEFAULT_CHANNEL_CAPACITY: usize = 100;
const EARTH_RADIUS_KM: f64 = 6371.0;

struct Subscriber {
    id: u64,
    filter: ChannelFilter,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<Value>>,
    subscribers: Vec<Subscriber>,
    next_channel_id: u64,
    user: Option<AuthUser>,
    select_counts: HashMap<String, usize>,
    pending_failures: HashMap<String, usize>,
    select_delay: Option<Duration>,
    channel_capacity: usize,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Inner {
    // Strictly increasing so rows written back to back never share a creation time
    fn next_timestamp(&mut self) -> String {
        let mut now = Utc::now();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + ChronoDuration::microseconds(1);
            }
        }
        self.last_timestamp = Some(now);
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    // A subscriber with a full buffer is dropped; its reader sees the channel end after draining
    fn emit(&mut self, event: ChangeEvent) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        let mut overflowed = Vec::new();
        for subscriber in self.subscribers.iter().filter(|s| s.filter.accepts(&event)) {
            match subscriber.tx.try_send(event.clone()) {
                Ok(_) => debug!("Delivered {} on {} to channel {}", event.kind, event.table, subscriber.id),
                Err(TrySendError::Full(_)) => {
                    warn!("Channel {} is full, closing it", subscriber.id);
                    overflowed.push(subscriber.id);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        self.subscribers.retain(|s| !overflowed.contains(&s.id));
    }

    fn insert_row(&mut self, table: &str, row: Value) -> Result<Value, BackendError> {
        let mut row = match row {
            Value::Object(map) => map,
            other => return Err(BackendError::Write(format!("row for {} must be an object, got {}", table, other))),
        };
        if !row.contains_key("id") {
            row.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
        }
        if !row.contains_key("created_at") {
            row.insert("created_at".to_string(), Value::String(self.next_timestamp()));
        }
        let record = Value::Object(row);
        self.tables.entry(table.to_string()).or_default().push(record.clone());
        self.emit(ChangeEvent {
            kind: ChangeKind::Insert,
            table: table.to_string(),
            record: record.clone(),
            old_record: None,
        });
        Ok(record)
    }
}

/// Backend living entirely in process memory. Cloning shares the same tables.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let inner = Inner {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            ..Inner::default()
        };
        MemoryBackend {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn with_user(user: AuthUser) -> Self {
        let backend = Self::new();
        backend.sign_in(user);
        backend
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sign_in(&self, user: AuthUser) {
        info!("Signed in as {}", user.id);
        self.lock().user = Some(user);
    }

    pub fn sign_out(&self) {
        self.lock().user = None;
    }

    pub fn set_channel_capacity(&self, capacity: usize) {
        self.lock().channel_capacity = capacity.max(1);
    }

    /// Load rows without emitting change events
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut inner = self.lock();
        inner.tables.entry(table.to_string()).or_default().extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Number of selects issued against `table` so far
    pub fn select_count(&self, table: &str) -> usize {
        self.lock().select_counts.get(table).copied().unwrap_or(0)
    }

    /// Make the next `count` selects against `table` fail
    pub fn fail_next_selects(&self, table: &str, count: usize) {
        self.lock().pending_failures.insert(table.to_string(), count);
    }

    /// Delay every select response. Rows are read before the delay, so the
    /// answer reflects the table at the moment the query reached the server.
    pub fn set_select_delay(&self, delay: Option<Duration>) {
        self.lock().select_delay = delay;
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        inner.subscribers.len()
    }

    /// Push an event to matching channels without touching the tables
    pub fn emit(&self, event: ChangeEvent) {
        self.lock().emit(event);
    }

    fn unsubscribe(inner: &Weak<Mutex<Inner>>, id: u64) {
        if let Some(inner) = inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.subscribers.retain(|s| s.id != id);
            debug!("Channel {} unsubscribed, {} remaining", id, inner.subscribers.len());
        }
    }

    fn create_service_request(&self, params: Value) -> Result<Value, BackendError> {
        let customer_id = params
            .get("customer_id")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Fetch("create_service_request: customer_id is required".to_string()))?;
        let latitude = number_param(&params, "latitude")?;
        let longitude = number_param(&params, "longitude")?;

        let row = json!({
            "customer_id": customer_id,
            "status": "pending",
            "services": params.get("services").cloned().unwrap_or_else(|| json!([])),
            "barber_id": params.get("barber_id").cloned().unwrap_or(Value::Null),
            "latitude": latitude,
            "longitude": longitude,
            "address": params.get("address").cloned().unwrap_or(Value::Null),
            "notes": params.get("notes").cloned().unwrap_or(Value::Null),
        });
        self.lock()
            .insert_row(TABLE_SERVICE_REQUESTS, row)
            .map_err(|e| BackendError::Fetch(e.to_string()))
    }

    fn nearby_barbers(&self, params: Value) -> Result<Value, BackendError> {
        let latitude = number_param(&params, "latitude")?;
        let longitude = number_param(&params, "longitude")?;
        let radius_km = number_param(&params, "radius_km")?;

        let inner = self.lock();
        let mut found: Vec<Value> = Vec::new();
        for barber in inner.tables.get(TABLE_BARBERS).into_iter().flatten() {
            let (Some(lat), Some(lng)) = (
                barber.get("latitude").and_then(Value::as_f64),
                barber.get("longitude").and_then(Value::as_f64),
            ) else {
                continue;
            };
            let distance = haversine_km(latitude, longitude, lat, lng);
            if distance <= radius_km {
                let mut row = barber.clone();
                if let Value::Object(map) = &mut row {
                    map.insert("distance_km".to_string(), json!(distance));
                }
                found.push(row);
            }
        }
        found.sort_by(|a, b| {
            compare_values(a.get("distance_km"), b.get("distance_km"))
        });
        Ok(Value::Array(found))
    }
}

fn number_param(params: &Value, name: &str) -> Result<f64, BackendError> {
    params
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| BackendError::Fetch(format!("missing numeric parameter '{}'", name)))
}

/// Great-circle distance between two points in kilometres
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, Some(_)) | (Some(Value::Null), Some(_)) => Ordering::Less,
        (Some(_), None) | (Some(_), Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn current_user(&self) -> Option<AuthUser> {
        self.lock().user.clone()
    }

    async fn select(&self, query: &Query) -> Result<Vec<Value>, BackendError> {
        let (rows, delay) = {
            let mut inner = self.lock();
            *inner.select_counts.entry(query.table.clone()).or_default() += 1;

            if let Some(remaining) = inner.pending_failures.get_mut(&query.table) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackendError::Fetch(format!("select on {} failed", query.table)));
                }
            }

            let mut rows: Vec<Value> = inner
                .tables
                .get(&query.table)
                .map(|table| table.iter().filter(|row| query.matches(row)).cloned().collect())
                .unwrap_or_default();

            if let Some((column, order)) = &query.order {
                rows.sort_by(|a, b| {
                    let ord = compare_values(a.get(column), b.get(column));
                    match order {
                        Order::Ascending => ord,
                        Order::Descending => ord.reverse(),
                    }
                });
            }
            if let Some(limit) = query.limit {
                rows.truncate(limit);
            }
            (rows, inner.select_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        debug!("select {} -> {} rows", query.table, rows.len());
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError> {
        self.lock().insert_row(table, row)
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value, BackendError> {
        let Value::Object(patch) = patch else {
            return Err(BackendError::Write(format!("patch for {} must be an object", table)));
        };

        let mut inner = self.lock();
        let row = inner
            .tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|row| row.get("id").and_then(Value::as_str) == Some(id)))
            .ok_or_else(|| BackendError::Write(format!("no row {} in {}", id, table)))?;

        let old_record = row.clone();
        if let Value::Object(fields) = row {
            for (key, value) in patch {
                fields.insert(key, value);
            }
        }
        let record = row.clone();
        inner.emit(ChangeEvent {
            kind: ChangeKind::Update,
            table: table.to_string(),
            record: record.clone(),
            old_record: Some(old_record),
        });
        Ok(record)
    }

    async fn rpc(&self, function: &str, params: Value) -> Result<Value, BackendError> {
        debug!("rpc {} {}", function, params);
        match function {
            RPC_CREATE_SERVICE_REQUEST => self.create_service_request(params),
            RPC_NEARBY_BARBERS => self.nearby_barbers(params),
            other => Err(BackendError::Fetch(format!("unknown function '{}'", other))),
        }
    }

    async fn subscribe(&self, filter: ChannelFilter) -> Result<Channel, BackendError> {
        let mut inner = self.lock();
        inner.next_channel_id += 1;
        let id = inner.next_channel_id;
        let (tx, rx) = mpsc::channel(inner.channel_capacity);
        let name = match &filter.eq {
            Some((column, value)) => format!("{}:{}={}#{}", filter.table, column, value, id),
            None => format!("{}#{}", filter.table, id),
        };
        info!("Opening channel {} for {} events", name, filter.kind);
        inner.subscribers.push(Subscriber { id, filter, tx });

        let weak = Arc::downgrade(&self.inner);
        Ok(Channel::new(name, rx, move || MemoryBackend::unsubscribe(&weak, id)))
    }
}
