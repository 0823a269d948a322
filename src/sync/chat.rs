// Chat synchronizer
// Initial fetch plus a live insert channel per request, merged into one ordered
// list. Rows are upserted by id, so an event that races the initial fetch lands
// exactly once.

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use super::cache::{QueryCache, QueryKey};
use crate::backend::{select_as, Backend, BackendError, Channel, ChannelFilter, Order, Query};
use crate::models::{
    offer_expiry, ChatMessage, NewChatMessage, OfferStatus, SenderRole, TABLE_MESSAGES,
};

pub const RESOURCE_MESSAGES: &str = "messages";
pub const DEFAULT_OFFER_EXPIRY_MINUTES: i64 = 30;

pub fn messages_key(request_id: &str) -> QueryKey {
    QueryKey::new(RESOURCE_MESSAGES, &[request_id])
}

/// Insert or replace `incoming` by id, keeping the list ordered by creation time.
/// A new message goes after every message created at or before it.
/// Returns false when the list already held an identical row.
pub fn upsert_message(messages: &mut Vec<ChatMessage>, incoming: ChatMessage) -> bool {
    if let Some(existing) = messages.iter_mut().find(|m| m.id == incoming.id) {
        if *existing == incoming {
            return false;
        }
        *existing = incoming;
        return true;
    }
    let at = messages.partition_point(|m| m.created_at <= incoming.created_at);
    messages.insert(at, incoming);
    true
}

/// Merge a batch of rows, e.g. the result of a fetch
pub fn merge_messages(messages: &mut Vec<ChatMessage>, incoming: Vec<ChatMessage>) -> bool {
    let mut changed = false;
    for message in incoming {
        changed |= upsert_message(messages, message);
    }
    changed
}

pub async fn fetch_messages(
    backend: &dyn Backend,
    request_id: &str,
) -> Result<Vec<ChatMessage>, BackendError> {
    let query = Query::table(TABLE_MESSAGES)
        .eq("request_id", request_id)
        .order_by("created_at", Order::Ascending);
    select_as(backend, &query).await
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatSnapshot {
    pub request_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub error: Option<BackendError>,
    /// The real-time channel for `request_id` is open
    pub is_live: bool,
    /// The initial fetch for `request_id` has completed
    pub is_loaded: bool,
}

impl ChatSnapshot {
    pub fn message_ids(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.id.clone()).collect()
    }
}

enum ChatCommand {
    SetRequest(Option<String>),
    Refetch,
}

/// Live message list for one request at a time. Dropping the handle closes the channel.
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<ChatCommand>,
    snapshots: watch::Receiver<ChatSnapshot>,
    task: JoinHandle<()>,
}

impl ChatHandle {
    pub fn spawn(backend: Arc<dyn Backend>, cache: QueryCache, request_id: Option<&str>) -> Self {
        let request_id = request_id.map(str::to_string);
        let (snapshot_tx, snapshot_rx) = watch::channel(ChatSnapshot {
            request_id: request_id.clone(),
            ..ChatSnapshot::default()
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let worker = ChatWorker {
            backend,
            invalidations: cache.subscribe_invalidations(),
            cache,
            commands: command_rx,
            snapshots: snapshot_tx,
        };
        let task = tokio::spawn(worker.run(request_id));

        ChatHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            task,
        }
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.snapshots.borrow().messages.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshots.clone()
    }

    /// Snapshots as a stream, starting with the current one
    pub fn stream(&self) -> WatchStream<ChatSnapshot> {
        WatchStream::new(self.snapshots.clone())
    }

    /// Follow a different request. The previous channel is closed before the next opens.
    pub fn set_request(&self, request_id: Option<&str>) {
        self.send(ChatCommand::SetRequest(request_id.map(str::to_string)));
    }

    pub fn refetch(&self) {
        self.send(ChatCommand::Refetch);
    }

    fn send(&self, command: ChatCommand) {
        if self.commands.send(command).is_err() {
            warn!("Chat watcher is no longer running");
        }
    }
}

impl Drop for ChatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ChatWorker {
    backend: Arc<dyn Backend>,
    cache: QueryCache,
    commands: mpsc::UnboundedReceiver<ChatCommand>,
    invalidations: broadcast::Receiver<QueryKey>,
    snapshots: watch::Sender<ChatSnapshot>,
}

// What to do after following one request ends
enum Next {
    Follow(Option<String>),
    Stop,
}

impl ChatWorker {
    async fn run(mut self, initial: Option<String>) {
        let mut current = initial;
        loop {
            let next = match current.take() {
                Some(request_id) => self.follow(request_id).await,
                None => self.idle().await,
            };
            match next {
                Next::Follow(request_id) => current = request_id,
                Next::Stop => break,
            }
        }
        debug!("Chat watcher stopped");
    }

    // No request selected: empty list, nothing fetched, nothing subscribed
    async fn idle(&mut self) -> Next {
        self.snapshots.send_replace(ChatSnapshot::default());
        loop {
            match self.commands.recv().await {
                Some(ChatCommand::SetRequest(Some(request_id))) => return Next::Follow(Some(request_id)),
                Some(ChatCommand::SetRequest(None)) | Some(ChatCommand::Refetch) => {}
                None => return Next::Stop,
            }
        }
    }

    async fn follow(&mut self, request_id: String) -> Next {
        let key = messages_key(&request_id);
        self.snapshots.send_replace(ChatSnapshot {
            request_id: Some(request_id.clone()),
            ..ChatSnapshot::default()
        });

        // Subscribe before fetching so nothing inserted in between is missed
        let mut channel = self.open_channel(&request_id).await;
        self.refetch(&request_id, &key).await;

        let next = loop {
            tokio::select! {
                event = recv_event(&mut channel) => match event {
                    Some(event) => self.apply_event(&request_id, &key, event.record),
                    None => {
                        // Events may have been dropped; resubscribe, then catch up with a fetch
                        warn!("Chat channel for {} closed by the backend", request_id);
                        self.snapshots.send_modify(|s| s.is_live = false);
                        channel = self.open_channel(&request_id).await;
                        self.refetch(&request_id, &key).await;
                    }
                },
                invalidated = self.invalidations.recv() => match invalidated {
                    Ok(stale) if stale == key => self.refetch(&request_id, &key).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => self.refetch(&request_id, &key).await,
                    Err(broadcast::error::RecvError::Closed) => break Next::Stop,
                },
                command = self.commands.recv() => match command {
                    Some(ChatCommand::SetRequest(Some(next))) if next == request_id => {}
                    Some(ChatCommand::SetRequest(next)) => break Next::Follow(next),
                    Some(ChatCommand::Refetch) => self.refetch(&request_id, &key).await,
                    None => break Next::Stop,
                },
            }
        };

        if let Some(channel) = channel {
            channel.close();
        }
        debug!("Stopped following chat for {}", request_id);
        next
    }

    async fn open_channel(&mut self, request_id: &str) -> Option<Channel> {
        let filter = ChannelFilter::inserts(TABLE_MESSAGES).with_eq("request_id", request_id);
        match self.backend.subscribe(filter).await {
            Ok(channel) => {
                info!("Chat for {} is live on {}", request_id, channel.name());
                self.snapshots.send_modify(|s| s.is_live = true);
                Some(channel)
            }
            Err(e) => {
                warn!("Could not open chat channel for {}: {}", request_id, e);
                self.snapshots.send_modify(|s| s.error = Some(e));
                None
            }
        }
    }

    async fn refetch(&mut self, request_id: &str, key: &QueryKey) {
        match fetch_messages(self.backend.as_ref(), request_id).await {
            Ok(rows) => {
                debug!("Fetched {} messages for {}", rows.len(), request_id);
                self.snapshots.send_modify(|s| {
                    merge_messages(&mut s.messages, rows);
                    s.error = None;
                    s.is_loaded = true;
                });
                self.cache.set(key, &self.snapshots.borrow().messages);
            }
            Err(e) => {
                warn!("Fetching messages for {} failed: {}", request_id, e);
                self.cache.set_error(key, e.clone());
                self.snapshots.send_modify(|s| s.error = Some(e));
            }
        }
    }

    fn apply_event(&mut self, request_id: &str, key: &QueryKey, record: Value) {
        let message: ChatMessage = match serde_json::from_value(record) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed chat row for {}: {}", request_id, e);
                return;
            }
        };
        debug!("Live message {} for {}", message.id, request_id);
        let changed = self.snapshots.send_if_modified(|s| upsert_message(&mut s.messages, message));
        if changed {
            self.cache.set(key, &self.snapshots.borrow().messages);
        }
    }
}

async fn recv_event(channel: &mut Option<Channel>) -> Option<crate::backend::ChangeEvent> {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

fn require_user(backend: &dyn Backend, action: &str) -> Result<String, BackendError> {
    backend
        .current_user()
        .map(|user| user.id)
        .ok_or_else(|| BackendError::AuthRequired(format!("sign in to {}", action)))
}

async fn insert_message(
    backend: &dyn Backend,
    cache: &QueryCache,
    message: NewChatMessage,
) -> Result<ChatMessage, BackendError> {
    let row = serde_json::to_value(&message).map_err(|e| BackendError::Write(e.to_string()))?;
    let record = backend.insert(TABLE_MESSAGES, row).await?;
    let sent: ChatMessage =
        serde_json::from_value(record).map_err(|e| BackendError::Write(format!("unexpected message row: {}", e)))?;
    cache.invalidate(&messages_key(&message.request_id));
    Ok(sent)
}

/// Send a plain text message on a request's chat
pub async fn send_text(
    backend: &dyn Backend,
    cache: &QueryCache,
    request_id: &str,
    content: &str,
    role: SenderRole,
) -> Result<ChatMessage, BackendError> {
    let sender_id = require_user(backend, "send messages")?;
    info!("Sending message on {}", request_id);
    insert_message(backend, cache, NewChatMessage::text(request_id, &sender_id, role, content)).await
}

/// Send a monetary offer that expires `expires_in_minutes` from now
pub async fn send_offer(
    backend: &dyn Backend,
    cache: &QueryCache,
    request_id: &str,
    amount_cents: i64,
    expires_in_minutes: i64,
    role: SenderRole,
) -> Result<ChatMessage, BackendError> {
    let sender_id = require_user(backend, "send offers")?;
    if amount_cents <= 0 {
        return Err(BackendError::Write(format!("offer amount must be positive, got {}", amount_cents)));
    }
    info!("Sending offer of {} cents on {}", amount_cents, request_id);
    let expires_at = offer_expiry(Utc::now(), expires_in_minutes).ok_or_else(|| {
        BackendError::Write(format!("offer lifetime of {} minutes is out of range", expires_in_minutes))
    })?;
    let offer = NewChatMessage::offer(request_id, &sender_id, role, amount_cents, expires_at);
    insert_message(backend, cache, offer).await
}

/// Accept or decline a pending offer
pub async fn respond_to_offer(
    backend: &dyn Backend,
    cache: &QueryCache,
    message_id: &str,
    accept: bool,
) -> Result<ChatMessage, BackendError> {
    require_user(backend, "answer offers")?;

    let query = Query::table(TABLE_MESSAGES).eq("id", message_id).limit(1);
    let offer = select_as::<ChatMessage>(backend, &query)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::Write(format!("offer {} not found", message_id)))?;

    if !offer.is_offer() {
        return Err(BackendError::Write(format!("message {} is not an offer", message_id)));
    }
    if offer.offer_status != Some(OfferStatus::Pending) {
        return Err(BackendError::Write(format!("offer {} was already answered", message_id)));
    }
    if offer.is_offer_expired(Utc::now()) {
        return Err(BackendError::Write(format!("offer {} has expired", message_id)));
    }

    let status = if accept { OfferStatus::Accepted } else { OfferStatus::Declined };
    let record = backend
        .update(TABLE_MESSAGES, message_id, json!({ "offer_status": status }))
        .await?;
    let updated: ChatMessage =
        serde_json::from_value(record).map_err(|e| BackendError::Write(format!("unexpected message row: {}", e)))?;
    cache.invalidate(&messages_key(&updated.request_id));
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;
    use chrono::{DateTime, TimeZone};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn message(id: &str, seconds: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            request_id: "req-1".to_string(),
            sender_id: "u1".to_string(),
            sender_role: SenderRole::Customer,
            kind: MessageKind::Text,
            content: format!("message {}", id),
            offer_amount_cents: None,
            offer_status: None,
            offer_expires_at: None,
            created_at: at(seconds),
        }
    }

    fn ids(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_upsert_appends_in_creation_order() {
        let mut messages = Vec::new();
        assert!(upsert_message(&mut messages, message("b", 2)));
        assert!(upsert_message(&mut messages, message("a", 1)));
        assert!(upsert_message(&mut messages, message("c", 3)));
        assert_eq!(ids(&messages), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut messages = vec![message("m1", 1)];
        assert!(!upsert_message(&mut messages, message("m1", 1)));
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_upsert_replaces_changed_row_in_place() {
        let mut messages = vec![message("m1", 1), message("m2", 2)];
        let mut edited = message("m1", 1);
        edited.content = "edited".to_string();

        assert!(upsert_message(&mut messages, edited));
        assert_eq!(ids(&messages), vec!["m1", "m2"]);
        assert_eq!(messages[0].content, "edited");
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut messages = Vec::new();
        upsert_message(&mut messages, message("first", 5));
        upsert_message(&mut messages, message("second", 5));
        assert_eq!(ids(&messages), vec!["first", "second"]);
    }

    #[test]
    fn test_merge_event_before_fetch_gives_same_result() {
        // live event first, then the fetch that also contains it
        let mut event_first = Vec::new();
        upsert_message(&mut event_first, message("m1", 1));
        merge_messages(&mut event_first, vec![message("m0", 0), message("m1", 1)]);

        let mut fetch_first = Vec::new();
        merge_messages(&mut fetch_first, vec![message("m0", 0), message("m1", 1)]);
        upsert_message(&mut fetch_first, message("m1", 1));

        assert_eq!(event_first, fetch_first);
        assert_eq!(ids(&event_first), vec!["m0", "m1"]);
    }
}
