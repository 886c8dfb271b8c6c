//! Text rendering for the console.
//!
//! Everything here is pure: values in, lines out. The message log is the
//! only state, a capped ring buffer of what subscriptions and watchers
//! delivered.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use nats_session::kv::describe_max_age;
use nats_session::{
    BucketSummary, ConnectionStatus, ConsumerSummary, Headers, InboundMessage, KvChange, KvRecord,
    ServerSummary, StoredMessage, StreamSummary, SubscriptionInfo,
};
use serde::Serialize;

fn clock(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M:%S%.3f").to_string()
}

pub fn status_toast(status: ConnectionStatus) -> String {
    let marker = match status {
        ConnectionStatus::Connected => "+",
        ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => "~",
        ConnectionStatus::Disconnected => "-",
    };
    format!("[{marker}] {status}")
}

pub fn error_toast(err: impl std::fmt::Display) -> String {
    format!("[!] {err}")
}

pub fn latency(rtt: Duration) -> String {
    format!("rtt {:.2} ms", rtt.as_secs_f64() * 1000.0)
}

pub fn connected(url: &str, server: &ServerSummary) -> String {
    format!(
        "connected to {url} ({} {} v{}, {}:{})",
        server.name, server.id, server.version, server.host, server.port
    )
}

fn headers_block(out: &mut String, headers: &Headers) {
    for (name, values) in headers {
        for value in values {
            let _ = write!(out, "\n    {name}: {value}");
        }
    }
}

pub fn message(msg: &InboundMessage) -> String {
    let mut out = String::new();
    let origin = match msg.subscription_id {
        Some(id) => format!("#{id}"),
        None => "reply".to_owned(),
    };
    let _ = write!(
        out,
        "{} {origin} {} ({} bytes)",
        clock(&msg.received_at),
        msg.subject,
        msg.size
    );
    if let Some(reply_to) = &msg.reply_to {
        let _ = write!(out, " reply-to {reply_to}");
    }
    if let Some(headers) = &msg.headers {
        headers_block(&mut out, headers);
    }
    let _ = write!(out, "\n  {}", msg.text);
    out
}

pub fn kv_change(change: &KvChange) -> String {
    format!(
        "kv {} {} {} rev {}",
        change.bucket, change.operation, change.key, change.revision
    )
}

pub fn subscribed(info: &SubscriptionInfo) -> String {
    format!(
        "subscribed #{} to {} ({} active)",
        info.id, info.subject, info.count
    )
}

pub fn subscriptions(subs: &[(u64, String)]) -> String {
    if subs.is_empty() {
        return "no subscriptions".to_owned();
    }
    let mut out = format!("{:>4}  SUBJECT", "ID");
    for (id, subject) in subs {
        let _ = write!(out, "\n{id:>4}  {subject}");
    }
    out
}

pub fn names(kind: &str, names: &[String]) -> String {
    if names.is_empty() {
        return format!("no {kind}");
    }
    names.join("\n")
}

pub fn bucket(summary: &BucketSummary) -> String {
    format!(
        "bucket {}: {} values, history {}, max age {}, {} bytes",
        summary.bucket,
        summary.values,
        summary.history,
        describe_max_age(summary.max_age),
        summary.bytes
    )
}

pub fn kv_record(record: &KvRecord) -> String {
    format!(
        "{} = {} (rev {}, {})",
        record.key,
        record.text(),
        record.revision,
        clock(&record.created)
    )
}

pub fn history(records: &[KvRecord]) -> String {
    if records.is_empty() {
        return "no history".to_owned();
    }
    let mut out = format!("{:>6}  {:<7} {:<12}  VALUE", "REV", "OP", "TIME");
    for record in records {
        let _ = write!(
            out,
            "\n{:>6}  {:<7} {:<12}  {}",
            record.revision,
            record.operation.to_string(),
            clock(&record.created),
            record.text()
        );
    }
    out
}

pub fn streams(streams: &[StreamSummary]) -> String {
    if streams.is_empty() {
        return "no streams".to_owned();
    }
    let mut out = format!(
        "{:<24} {:>10} {:>12} {:>9}  SUBJECTS",
        "NAME", "MESSAGES", "BYTES", "CONSUMERS"
    );
    for s in streams {
        let _ = write!(
            out,
            "\n{:<24} {:>10} {:>12} {:>9}  {}",
            s.name,
            s.messages,
            s.bytes,
            s.consumer_count,
            s.subjects.join(",")
        );
    }
    out
}

pub fn stream(s: &StreamSummary) -> String {
    format!(
        "stream {}\n  subjects:  {}\n  storage:   {:?}\n  messages:  {}\n  bytes:     {}\n  sequence:  {}..{}\n  consumers: {}\n  created:   {}",
        s.name,
        s.subjects.join(", "),
        s.storage,
        s.messages,
        s.bytes,
        s.first_sequence,
        s.last_sequence,
        s.consumer_count,
        s.created.to_rfc3339()
    )
}

pub fn consumers(consumers: &[ConsumerSummary]) -> String {
    if consumers.is_empty() {
        return "no consumers".to_owned();
    }
    let mut out = format!(
        "{:<24} {:<8} {:>10} {:>10} {:>10}",
        "NAME", "DURABLE", "PENDING", "ACK_PEND", "DELIVERED"
    );
    for c in consumers {
        let _ = write!(
            out,
            "\n{:<24} {:<8} {:>10} {:>10} {:>10}",
            c.name, c.durable, c.num_pending, c.num_ack_pending, c.delivered_stream_sequence
        );
    }
    out
}

pub fn stored_message(msg: &StoredMessage) -> String {
    let mut out = format!(
        "{} #{} {} ({} bytes, {})",
        msg.stream,
        msg.sequence,
        msg.subject,
        msg.size,
        msg.time.to_rfc3339()
    );
    if let Some(headers) = &msg.headers {
        headers_block(&mut out, headers);
    }
    let _ = write!(out, "\n  {}", msg.text);
    out
}

/// One entry of the message log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    Message(InboundMessage),
    KvChange {
        #[serde(flatten)]
        change: KvChange,
        observed_at: DateTime<Utc>,
    },
}

impl LogEntry {
    pub fn render(&self) -> String {
        match self {
            LogEntry::Message(msg) => message(msg),
            LogEntry::KvChange {
                change,
                observed_at,
            } => format!("{} {}", clock(observed_at), kv_change(change)),
        }
    }
}

/// Capped log of received messages and key changes, oldest first.
#[derive(Debug)]
pub struct MessageLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The newest `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

    /// Write every entry as one JSON object per line. Returns the count.
    pub fn export(&self, path: &Path) -> Result<usize> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        for entry in &self.entries {
            serde_json::to_writer(&mut out, entry)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(self.entries.len())
    }
}
