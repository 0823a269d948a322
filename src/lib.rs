// Re-export needed modules for testing
pub mod backend;  // Gateway trait and the in-process backend
pub mod booking;
pub mod client;
pub mod config;
pub mod models;
pub mod store;  // Persisted local state
pub mod sync;  // Polling and real-time synchronizers

// Re-export main types for convenience
pub use backend::{Backend, BackendError, MemoryBackend};
pub use client::{BookingClient, LocalStores};
pub use config::ClientConfig;
pub use models::*;
