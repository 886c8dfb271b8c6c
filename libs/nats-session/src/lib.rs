//! # nats-session
//!
//! Connection and session layer of the NATS admin console.
//!
//! This library provides:
//! - **Session** owning one client connection, its subscriptions, the open
//!   key-value bucket and the latency poller.
//! - **Event channel** carrying status changes, delivered messages, watcher
//!   changes and latency samples to the presentation layer.
//! - **Codecs** for header JSON and message payloads.
//! - **JetStream administration** for buckets and streams.
//! - **Recents** persisted between runs.
//!
//! ## Design Principles
//!
//! - Every background loop is owned by a handle with a cancellation token;
//!   teardown never leaves a loop running.
//! - Library failures are mapped into [`ConsoleError`] at the call site.
//! - Nothing here writes to the terminal.

pub mod auth;
pub mod codec;
pub mod error;
pub mod kv;
pub mod metrics;
pub mod models;
pub mod recents;
pub mod registry;
pub mod session;
pub mod stats;
pub mod streams;
pub mod subjects;

// Re-export key types for convenient access
pub use auth::Credentials;
pub use error::{ConsoleError, ConsoleResult};
pub use models::{
    BucketSpec, BucketSummary, BucketUpdate, ConnectionStatus, ConsumerSummary, Headers,
    InboundMessage, KvChange, KvOperation, KvRecord, ServerSummary, SessionEvent, StorageKind,
    StoredMessage, StreamSpec, StreamSummary, StreamUpdate, SubscriptionInfo,
};
pub use recents::RecentsStore;
pub use session::Session;
