// Request-status synchronizer
// Polls a service request joined with its barber responses while the request is
// still collecting responses, and goes idle once it reaches a terminal status.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::cache::{QueryCache, QueryKey, RefreshMode};
use crate::backend::{select_as, Backend, BackendError, Order, Query};
use crate::config::ClientConfig;
use crate::models::{
    BarberResponse, RequestStatus, RequestWithResponses, ServiceRequest, TABLE_BARBER_RESPONSES,
    TABLE_SERVICE_REQUESTS,
};

pub const RESOURCE_SERVICE_REQUEST: &str = "service_request";

pub fn request_key(request_id: &str) -> QueryKey {
    QueryKey::new(RESOURCE_SERVICE_REQUEST, &[request_id])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Polling,
    Idle,
}

/// The polling policy. Only a request known to be pending or matching is polled,
/// and only while its cache key allows scheduled refreshes.
pub fn poll_state_for(status: Option<RequestStatus>, mode: RefreshMode) -> PollState {
    match (mode, status) {
        (RefreshMode::Auto, Some(status)) if status.is_active() => PollState::Polling,
        _ => PollState::Idle,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub fetch_timeout: Option<Duration>,
}

impl Default for PollOptions {
    fn default() -> Self {
        PollOptions::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for PollOptions {
    fn from(config: &ClientConfig) -> Self {
        PollOptions {
            interval: config.poll_interval(),
            fetch_timeout: config.fetch_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestSnapshot {
    pub request_id: String,
    pub data: Option<RequestWithResponses>,
    pub response_count: usize,
    pub error: Option<BackendError>,
    pub poll_state: PollState,
    pub is_fetching: bool,
    /// Completed fetch attempts, successful or not
    pub fetches: u64,
}

impl RequestSnapshot {
    pub fn status(&self) -> Option<RequestStatus> {
        self.data.as_ref().map(|d| d.request.status)
    }
}

/// Read one request and every response attached to it
pub async fn fetch_request_with_responses(
    backend: &dyn Backend,
    request_id: &str,
) -> Result<RequestWithResponses, BackendError> {
    let request_query = Query::table(TABLE_SERVICE_REQUESTS).eq("id", request_id).limit(1);
    let request = select_as::<ServiceRequest>(backend, &request_query)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::Fetch(format!("service request {} not found", request_id)))?;

    let responses_query = Query::table(TABLE_BARBER_RESPONSES)
        .eq("request_id", request_id)
        .order_by("created_at", Order::Ascending);
    let responses = select_as::<BarberResponse>(backend, &responses_query).await?;

    Ok(RequestWithResponses { request, responses })
}

enum Command {
    Refetch,
    Reschedule,
}

/// Live view of one service request. Dropping the handle stops the background task.
pub struct RequestStatusHandle {
    request_id: String,
    key: QueryKey,
    cache: QueryCache,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<RequestSnapshot>,
    task: JoinHandle<()>,
}

impl RequestStatusHandle {
    pub fn spawn(
        backend: Arc<dyn Backend>,
        cache: QueryCache,
        request_id: &str,
        options: PollOptions,
    ) -> Self {
        let key = request_key(request_id);
        let cached: Option<RequestWithResponses> = cache.get(&key);
        let last_status = cached.as_ref().map(|d| d.request.status);

        let initial = RequestSnapshot {
            request_id: request_id.to_string(),
            response_count: cached.as_ref().map_or(0, |d| d.response_count()),
            data: cached,
            error: cache.error(&key),
            poll_state: poll_state_for(last_status, cache.refresh_mode(&key)),
            is_fetching: false,
            fetches: 0,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            backend,
            invalidations: cache.subscribe_invalidations(),
            cache: cache.clone(),
            key: key.clone(),
            request_id: request_id.to_string(),
            options,
            commands: command_rx,
            snapshots: snapshot_tx,
            last_status,
            next_poll: Instant::now() + options.interval,
        };
        info!("Watching service request {} every {:?} while active", request_id, options.interval);
        let task = tokio::spawn(worker.run());

        RequestStatusHandle {
            request_id: request_id.to_string(),
            key,
            cache,
            commands: command_tx,
            snapshots: snapshot_rx,
            task,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn data(&self) -> Option<RequestWithResponses> {
        self.snapshots.borrow().data.clone()
    }

    pub fn response_count(&self) -> usize {
        self.snapshots.borrow().response_count
    }

    pub fn subscribe(&self) -> watch::Receiver<RequestSnapshot> {
        self.snapshots.clone()
    }

    /// Re-enable status-gated polling and fetch right away. Every watcher of
    /// this request refetches, so each one re-evaluates its poll state.
    pub fn start_polling(&self) {
        self.cache.set_refresh_mode(&self.key, RefreshMode::Auto);
        self.cache.invalidate(&self.key);
    }

    /// Disable scheduled refreshes for this key. A fetch already in flight still lands.
    pub fn stop_polling(&self) {
        self.cache.set_refresh_mode(&self.key, RefreshMode::Disabled);
        self.send(Command::Reschedule);
    }

    pub fn refetch(&self) {
        self.send(Command::Refetch);
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Request watcher for {} is no longer running", self.request_id);
        }
    }
}

impl Drop for RequestStatusHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Worker {
    backend: Arc<dyn Backend>,
    cache: QueryCache,
    key: QueryKey,
    request_id: String,
    options: PollOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    invalidations: broadcast::Receiver<QueryKey>,
    snapshots: watch::Sender<RequestSnapshot>,
    last_status: Option<RequestStatus>,
    // Only a completed fetch moves the deadline
    next_poll: Instant,
}

impl Worker {
    fn poll_state(&self) -> PollState {
        poll_state_for(self.last_status, self.cache.refresh_mode(&self.key))
    }

    async fn run(mut self) {
        self.fetch().await;

        loop {
            let state = self.poll_state();
            self.snapshots.send_if_modified(|s| {
                let changed = s.poll_state != state;
                s.poll_state = state;
                changed
            });

            let deadline = self.next_poll;
            let tick = async move {
                match state {
                    PollState::Polling => tokio::time::sleep_until(deadline).await,
                    PollState::Idle => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Refetch) => self.fetch().await,
                    Some(Command::Reschedule) => {}
                    None => break,
                },
                invalidated = self.invalidations.recv() => match invalidated {
                    Ok(key) if key == self.key => self.fetch().await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} cache invalidations, refetching {}", skipped, self.request_id);
                        self.fetch().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tick => {
                    // The mode may have been changed through another handle since the tick was armed
                    if self.poll_state() == PollState::Polling {
                        self.fetch().await;
                    } else {
                        self.next_poll = Instant::now() + self.options.interval;
                    }
                }
            }
        }
        debug!("Request watcher for {} stopped", self.request_id);
    }

    async fn fetch(&mut self) {
        self.snapshots.send_modify(|s| s.is_fetching = true);

        let fetch = fetch_request_with_responses(self.backend.as_ref(), &self.request_id);
        let result = match self.options.fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Fetch(format!(
                    "service request {} timed out after {:?}",
                    self.request_id, limit
                ))),
            },
            None => fetch.await,
        };

        match result {
            Ok(data) => {
                debug!(
                    "Request {} is {} with {} responses",
                    self.request_id,
                    data.request.status.as_str(),
                    data.response_count()
                );
                if self.last_status != Some(data.request.status) {
                    info!("Request {} status -> {}", self.request_id, data.request.status.as_str());
                }
                self.last_status = Some(data.request.status);
                self.cache.set(&self.key, &data);
                self.snapshots.send_modify(|s| {
                    s.response_count = data.response_count();
                    s.data = Some(data);
                    s.error = None;
                });
            }
            Err(e) => {
                warn!("Fetching request {} failed: {}", self.request_id, e);
                self.cache.set_error(&self.key, e.clone());
                self.snapshots.send_modify(|s| s.error = Some(e));
            }
        }

        self.next_poll = Instant::now() + self.options.interval;
        let state = self.poll_state();
        self.snapshots.send_modify(|s| {
            s.is_fetching = false;
            s.fetches += 1;
            s.poll_state = state;
        });
    }
}
