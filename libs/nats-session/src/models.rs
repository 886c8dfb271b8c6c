//! Typed models for session events, key-value records and JetStream summaries.
//!
//! These are plain snapshots of what the client library reported. The
//! console renders them, exports them, and never mutates them.

use std::collections::BTreeMap;
use std::time::Duration;

use async_nats::jetstream::{self, kv};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec;

/// Header map in its typed form: name to one or more values, ordered by name.
pub type Headers = BTreeMap<String, Vec<String>>;

// ---------------------------------------------------------------------------
// Connection status and events
// ---------------------------------------------------------------------------

/// Connection lifecycle as seen by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Reconnecting => write!(f, "reconnecting"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl From<async_nats::connection::State> for ConnectionStatus {
    fn from(state: async_nats::connection::State) -> Self {
        match state {
            async_nats::connection::State::Connected => ConnectionStatus::Connected,
            async_nats::connection::State::Disconnected => ConnectionStatus::Reconnecting,
            async_nats::connection::State::Pending => ConnectionStatus::Connecting,
        }
    }
}

/// Everything a session reports asynchronously to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection status changed.
    Status(ConnectionStatus),
    /// One round-trip latency sample from the stats poller.
    Latency(Duration),
    /// A message delivered to one of the session's subscriptions.
    Message(InboundMessage),
    /// A change observed by the active key-value watcher.
    KvChange(KvChange),
    /// Asynchronous error reported by the client library.
    Error(String),
}

/// A decoded message, either delivered by a subscription or received as a
/// request reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Subscription that delivered the message; `None` for request replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<u64>,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Payload as text, or a byte-count placeholder if it was not UTF-8.
    pub text: String,
    pub is_reply: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    /// Payload length in bytes.
    pub size: usize,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Decode a message delivered to subscription `subscription_id`.
    pub fn from_delivery(subscription_id: u64, msg: &async_nats::Message) -> Self {
        Self::decode(Some(subscription_id), msg, false)
    }

    /// Decode the reply to a request.
    pub fn from_reply(msg: &async_nats::Message) -> Self {
        Self::decode(None, msg, true)
    }

    fn decode(subscription_id: Option<u64>, msg: &async_nats::Message, is_reply: bool) -> Self {
        Self {
            subscription_id,
            subject: msg.subject.to_string(),
            reply_to: msg.reply.as_ref().map(|r| r.to_string()),
            text: codec::decode_payload(&msg.payload),
            is_reply,
            headers: msg.headers.as_ref().map(codec::from_header_map),
            size: msg.payload.len(),
            received_at: Utc::now(),
        }
    }
}

/// Summary of a registered subscription returned by `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub id: u64,
    pub subject: String,
    /// Number of subscriptions registered after this call.
    pub count: usize,
}

/// Identity of the server the session is connected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub id: String,
    pub version: String,
    pub host: String,
    pub port: u16,
}

impl From<async_nats::ServerInfo> for ServerSummary {
    fn from(info: async_nats::ServerInfo) -> Self {
        Self {
            name: info.server_name,
            id: info.server_id,
            version: info.version,
            host: info.host,
            port: info.port,
        }
    }
}

// ---------------------------------------------------------------------------
// Key-value
// ---------------------------------------------------------------------------

/// Operation recorded on a key-value entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KvOperation {
    Put,
    Delete,
    Purge,
}

impl std::fmt::Display for KvOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvOperation::Put => write!(f, "PUT"),
            KvOperation::Delete => write!(f, "DELETE"),
            KvOperation::Purge => write!(f, "PURGE"),
        }
    }
}

impl From<&kv::Operation> for KvOperation {
    fn from(op: &kv::Operation) -> Self {
        match op {
            kv::Operation::Put => KvOperation::Put,
            kv::Operation::Delete => KvOperation::Delete,
            kv::Operation::Purge => KvOperation::Purge,
        }
    }
}

/// A change observed by a bucket watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KvChange {
    pub bucket: String,
    pub key: String,
    pub operation: KvOperation,
    pub revision: u64,
}

impl From<&kv::Entry> for KvChange {
    fn from(entry: &kv::Entry) -> Self {
        Self {
            bucket: entry.bucket.clone(),
            key: entry.key.clone(),
            operation: (&entry.operation).into(),
            revision: entry.revision,
        }
    }
}

/// A key-value entry or history record, verbatim from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KvRecord {
    pub bucket: String,
    pub key: String,
    pub value: Vec<u8>,
    pub revision: u64,
    pub operation: KvOperation,
    pub created: DateTime<Utc>,
}

impl KvRecord {
    /// The value decoded for display.
    pub fn text(&self) -> String {
        codec::decode_payload(&self.value)
    }
}

impl From<kv::Entry> for KvRecord {
    fn from(entry: kv::Entry) -> Self {
        Self {
            created: utc_from_parts(entry.created.unix_timestamp(), entry.created.nanosecond()),
            bucket: entry.bucket,
            key: entry.key,
            value: entry.value.to_vec(),
            revision: entry.revision,
            operation: (&entry.operation).into(),
        }
    }
}

/// Settings for creating or updating a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSpec {
    pub name: String,
    /// Values kept per key, including the current one.
    pub history: i64,
    /// Zero keeps values forever.
    pub max_age: Duration,
    pub description: Option<String>,
}

impl BucketSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            history: 1,
            max_age: Duration::ZERO,
            description: None,
        }
    }
}

/// Changes to an existing bucket. Unset fields keep the server's value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketUpdate {
    pub name: String,
    pub history: Option<i64>,
    /// Zero keeps values forever.
    pub max_age: Option<Duration>,
    pub description: Option<String>,
}

impl BucketUpdate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// true if no field would change
    pub fn is_empty(&self) -> bool {
        self.history.is_none() && self.max_age.is_none() && self.description.is_none()
    }

    /// Apply the given fields to the config of the bucket's backing stream.
    pub fn apply(&self, config: &mut jetstream::stream::Config) {
        if let Some(history) = self.history {
            config.max_messages_per_subject = history;
        }
        if let Some(max_age) = self.max_age {
            config.max_age = max_age;
        }
        if let Some(description) = &self.description {
            config.description = Some(description.clone());
        }
    }
}

/// Bucket status as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketSummary {
    pub bucket: String,
    pub values: u64,
    pub history: i64,
    pub max_age: Duration,
    pub bytes: u64,
}

// ---------------------------------------------------------------------------
// JetStream
// ---------------------------------------------------------------------------

/// Where a stream keeps its messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Memory,
}

impl From<StorageKind> for jetstream::stream::StorageType {
    fn from(kind: StorageKind) -> Self {
        match kind {
            StorageKind::File => jetstream::stream::StorageType::File,
            StorageKind::Memory => jetstream::stream::StorageType::Memory,
        }
    }
}

impl From<&jetstream::stream::StorageType> for StorageKind {
    fn from(storage: &jetstream::stream::StorageType) -> Self {
        match storage {
            jetstream::stream::StorageType::File => StorageKind::File,
            jetstream::stream::StorageType::Memory => StorageKind::Memory,
        }
    }
}

impl std::str::FromStr for StorageKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "memory" | "mem" => Ok(StorageKind::Memory),
            other => Err(format!("unknown storage '{other}', expected file or memory")),
        }
    }
}

/// Settings for creating or updating a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageKind,
    /// Zero keeps messages forever.
    pub max_age: Duration,
    /// Negative means unlimited.
    pub max_messages: i64,
    pub description: Option<String>,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            storage: StorageKind::File,
            max_age: Duration::ZERO,
            max_messages: -1,
            description: None,
        }
    }
}

impl From<&StreamSpec> for jetstream::stream::Config {
    fn from(spec: &StreamSpec) -> Self {
        jetstream::stream::Config {
            name: spec.name.clone(),
            subjects: spec.subjects.clone(),
            storage: spec.storage.into(),
            max_age: spec.max_age,
            max_messages: spec.max_messages,
            description: spec.description.clone(),
            ..Default::default()
        }
    }
}

/// Changes to an existing stream. Unset fields keep the server's value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamUpdate {
    pub name: String,
    pub subjects: Option<Vec<String>>,
    pub storage: Option<StorageKind>,
    /// Zero keeps messages forever.
    pub max_age: Option<Duration>,
    /// Negative means unlimited.
    pub max_messages: Option<i64>,
    pub description: Option<String>,
}

impl StreamUpdate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// true if no field would change
    pub fn is_empty(&self) -> bool {
        self.subjects.is_none()
            && self.storage.is_none()
            && self.max_age.is_none()
            && self.max_messages.is_none()
            && self.description.is_none()
    }

    /// Apply the given fields on top of an existing stream config.
    pub fn apply(&self, config: &mut jetstream::stream::Config) {
        if let Some(subjects) = &self.subjects {
            config.subjects = subjects.clone();
        }
        if let Some(storage) = self.storage {
            config.storage = storage.into();
        }
        if let Some(max_age) = self.max_age {
            config.max_age = max_age;
        }
        if let Some(max_messages) = self.max_messages {
            config.max_messages = max_messages;
        }
        if let Some(description) = &self.description {
            config.description = Some(description.clone());
        }
    }
}

/// Stream configuration and state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageKind,
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumer_count: usize,
    pub created: DateTime<Utc>,
}

impl From<&jetstream::stream::Info> for StreamSummary {
    fn from(info: &jetstream::stream::Info) -> Self {
        Self {
            name: info.config.name.clone(),
            subjects: info.config.subjects.clone(),
            storage: (&info.config.storage).into(),
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            consumer_count: info.state.consumer_count,
            created: utc_from_parts(info.created.unix_timestamp(), info.created.nanosecond()),
        }
    }
}

/// Consumer snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerSummary {
    pub stream: String,
    pub name: String,
    pub durable: bool,
    pub num_pending: u64,
    pub num_ack_pending: usize,
    pub delivered_stream_sequence: u64,
}

impl From<&jetstream::consumer::Info> for ConsumerSummary {
    fn from(info: &jetstream::consumer::Info) -> Self {
        Self {
            stream: info.stream_name.clone(),
            name: info.name.clone(),
            durable: info.config.durable_name.is_some(),
            num_pending: info.num_pending,
            num_ack_pending: info.num_ack_pending,
            delivered_stream_sequence: info.delivered.stream_sequence,
        }
    }
}

/// A message fetched from a stream by sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub stream: String,
    pub sequence: u64,
    pub subject: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    pub size: usize,
    pub time: DateTime<Utc>,
}

pub(crate) fn utc_from_parts(secs: i64, nanos: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}
