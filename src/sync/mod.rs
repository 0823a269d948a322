// Synchronization layer: projects remote state into the shared query cache and
// keeps it fresh, either by status-gated polling or by real-time channels.

pub mod cache;
pub mod chat;
pub mod request_status;

pub use cache::{QueryCache, QueryKey, RefreshMode};
pub use chat::{ChatHandle, ChatSnapshot};
pub use request_status::{PollOptions, PollState, RequestSnapshot, RequestStatusHandle};
