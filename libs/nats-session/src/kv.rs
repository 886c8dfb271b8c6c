//! Key-value buckets.
//!
//! A session has at most one open bucket and at most one watcher on it.
//! Opening another bucket, watching again, disconnecting or dropping the
//! session all stop the previous watcher first.

use std::time::Duration;

use async_nats::jetstream::kv;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec;
use crate::error::{ConsoleError, ConsoleResult};
use crate::metrics;
use crate::models::{
    BucketSpec, BucketSummary, BucketUpdate, KvChange, KvOperation, KvRecord, SessionEvent,
};
use crate::registry::TaskHandle;
use crate::session::Session;
use crate::subjects;

/// Streams backing a bucket are named with this prefix.
const KV_STREAM_PREFIX: &str = "KV_";

/// Largest per-key history the server accepts.
pub const MAX_HISTORY: i64 = 64;

#[derive(Debug)]
pub(crate) struct OpenBucket {
    name: String,
    store: kv::Store,
}

/// The open bucket and its watcher.
#[derive(Default)]
pub struct KvState {
    bucket: Option<OpenBucket>,
    watcher: Option<TaskHandle>,
}

impl KvState {
    pub fn bucket_name(&self) -> Option<&str> {
        self.bucket.as_ref().map(|b| b.name.as_str())
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Returns true if a watcher was running.
    fn stop_watcher(&mut self) -> bool {
        match self.watcher.take() {
            Some(watcher) => {
                watcher.stop();
                true
            }
            None => false,
        }
    }

    fn replace_watcher(&mut self, watcher: TaskHandle) {
        self.stop_watcher();
        self.watcher = Some(watcher);
    }

    /// Stop the watcher and forget the bucket.
    pub(crate) fn close(&mut self) {
        self.stop_watcher();
        self.bucket = None;
    }

    fn store(&self) -> ConsoleResult<&OpenBucket> {
        self.bucket
            .as_ref()
            .ok_or_else(|| ConsoleError::NotFound("no bucket open".into()))
    }
}

/// Sort history newest first and drop duplicate revisions.
pub fn newest_first(mut records: Vec<KvRecord>) -> Vec<KvRecord> {
    records.sort_by(|a, b| b.revision.cmp(&a.revision));
    records.dedup_by_key(|r| r.revision);
    records
}

fn check_history(history: i64) -> ConsoleResult<()> {
    if !(1..=MAX_HISTORY).contains(&history) {
        return Err(ConsoleError::Config(format!(
            "bucket history must be between 1 and {MAX_HISTORY}, got {history}"
        )));
    }
    Ok(())
}

fn check_update(update: &BucketUpdate) -> ConsoleResult<()> {
    subjects::validate_name("bucket", &update.name)?;
    if update.is_empty() {
        return Err(ConsoleError::Config(format!(
            "nothing to change for bucket '{}'",
            update.name
        )));
    }
    if let Some(history) = update.history {
        check_history(history)?;
    }
    Ok(())
}

async fn summarize(store: &kv::Store) -> ConsoleResult<BucketSummary> {
    let status = store
        .status()
        .await
        .map_err(|e| ConsoleError::Transport(format!("bucket status failed: {e}")))?;
    Ok(BucketSummary {
        bucket: status.bucket().to_owned(),
        values: status.values(),
        history: status.history(),
        max_age: status.max_age(),
        bytes: status.info.state.bytes,
    })
}

impl Session {
    /// Name of the open bucket.
    pub fn bucket(&self) -> Option<&str> {
        self.kv.bucket_name()
    }

    pub fn is_watching(&self) -> bool {
        self.kv.is_watching()
    }

    /// Names of every bucket on the server, sorted.
    pub async fn list_buckets(&self) -> ConsoleResult<Vec<String>> {
        let js = self.jetstream()?;
        let mut names: Vec<String> = js
            .stream_names()
            .try_filter_map(|name| async move {
                Ok(name.strip_prefix(KV_STREAM_PREFIX).map(str::to_owned))
            })
            .try_collect()
            .await
            .map_err(|e| ConsoleError::Transport(format!("listing buckets failed: {e}")))?;
        names.sort();
        Ok(names)
    }

    pub async fn create_bucket(&self, spec: &BucketSpec) -> ConsoleResult<BucketSummary> {
        let js = self.jetstream()?;
        subjects::validate_name("bucket", &spec.name)?;
        check_history(spec.history)?;

        let store = js
            .create_key_value(kv::Config {
                bucket: spec.name.clone(),
                history: spec.history,
                max_age: spec.max_age,
                description: spec.description.clone().unwrap_or_default(),
                ..Default::default()
            })
            .await
            .map_err(|e| {
                ConsoleError::Transport(format!("creating bucket '{}' failed: {e}", spec.name))
            })?;
        info!(bucket = %spec.name, history = spec.history, "bucket created");
        summarize(&store).await
    }

    /// Change history depth, max age or description of an existing bucket.
    /// Only the fields set in `update` are changed.
    pub async fn update_bucket(&self, update: &BucketUpdate) -> ConsoleResult<BucketSummary> {
        let js = self.jetstream()?;
        check_update(update)?;

        let stream_name = format!("{KV_STREAM_PREFIX}{}", update.name);
        let mut stream = js
            .get_stream(&stream_name)
            .await
            .map_err(|e| ConsoleError::NotFound(format!("bucket '{}': {e}", update.name)))?;
        let mut config = stream
            .info()
            .await
            .map_err(|e| ConsoleError::Transport(format!("bucket info failed: {e}")))?
            .config
            .clone();
        update.apply(&mut config);
        js.update_stream(&config).await.map_err(|e| {
            ConsoleError::Transport(format!("updating bucket '{}' failed: {e}", update.name))
        })?;
        info!(bucket = %update.name, ?update, "bucket updated");
        self.bucket_status(&update.name).await
    }

    /// Status of any bucket, open or not.
    pub async fn bucket_status(&self, name: &str) -> ConsoleResult<BucketSummary> {
        let js = self.jetstream()?;
        let store = js
            .get_key_value(name)
            .await
            .map_err(|e| ConsoleError::NotFound(format!("bucket '{name}': {e}")))?;
        summarize(&store).await
    }

    /// Make `name` the open bucket. Any running watcher is stopped before
    /// the bucket is looked up.
    pub async fn open_bucket(&mut self, name: &str) -> ConsoleResult<BucketSummary> {
        let js = self.jetstream()?.clone();
        self.kv.close();

        let store = js
            .get_key_value(name)
            .await
            .map_err(|e| ConsoleError::NotFound(format!("bucket '{name}': {e}")))?;
        let summary = summarize(&store).await?;
        self.kv.bucket = Some(OpenBucket {
            name: name.to_owned(),
            store,
        });
        info!(bucket = name, values = summary.values, "bucket opened");
        Ok(summary)
    }

    /// Forward changes to the open bucket as [`SessionEvent::KvChange`],
    /// replacing any previous watcher.
    pub async fn watch(&mut self) -> ConsoleResult<()> {
        self.kv.stop_watcher();
        let bucket = self.kv.store()?;
        let name = bucket.name.clone();
        let watch = bucket
            .store
            .watch_all()
            .await
            .map_err(|e| ConsoleError::Transport(format!("watching '{name}' failed: {e}")))?;

        let events = self.events();
        let bucket_name = name.clone();
        let handle = TaskHandle::spawn(move |token| watch_loop(bucket_name, watch, events, token));
        self.kv.replace_watcher(handle);
        info!(bucket = %name, "watching bucket");
        Ok(())
    }

    /// Stop the watcher. Returns false if none was running.
    pub fn unwatch(&mut self) -> bool {
        let stopped = self.kv.stop_watcher();
        if stopped {
            info!(bucket = ?self.kv.bucket_name(), "stopped watching bucket");
        }
        stopped
    }

    /// Current value of `key`. Deleted and purged keys are not found.
    pub async fn kv_get(&self, key: &str) -> ConsoleResult<KvRecord> {
        let bucket = self.kv.store()?;
        let entry = bucket
            .store
            .entry(key)
            .await
            .map_err(|e| ConsoleError::Transport(format!("get '{key}' failed: {e}")))?
            .ok_or_else(|| ConsoleError::NotFound(format!("key '{key}' in '{}'", bucket.name)))?;
        let record = KvRecord::from(entry);
        if record.operation != KvOperation::Put {
            return Err(ConsoleError::NotFound(format!(
                "key '{key}' in '{}' was {}",
                bucket.name,
                record.operation.to_string().to_lowercase()
            )));
        }
        Ok(record)
    }

    /// Store `value` under `key` and return the new revision.
    pub async fn kv_put(&self, key: &str, value: &str) -> ConsoleResult<u64> {
        let bucket = self.kv.store()?;
        let revision = bucket
            .store
            .put(key, codec::encode_payload(value))
            .await
            .map_err(|e| ConsoleError::Transport(format!("put '{key}' failed: {e}")))?;
        debug!(bucket = %bucket.name, key, revision, "put");
        Ok(revision)
    }

    /// Place a delete marker on `key`; history is kept.
    pub async fn kv_delete(&self, key: &str) -> ConsoleResult<()> {
        let bucket = self.kv.store()?;
        bucket
            .store
            .delete(key)
            .await
            .map_err(|e| ConsoleError::Transport(format!("delete '{key}' failed: {e}")))?;
        debug!(bucket = %bucket.name, key, "deleted");
        Ok(())
    }

    /// Remove `key` together with its history.
    pub async fn kv_purge(&self, key: &str) -> ConsoleResult<()> {
        let bucket = self.kv.store()?;
        bucket
            .store
            .purge(key)
            .await
            .map_err(|e| ConsoleError::Transport(format!("purge '{key}' failed: {e}")))?;
        debug!(bucket = %bucket.name, key, "purged");
        Ok(())
    }

    /// Live keys of the open bucket, sorted.
    pub async fn kv_keys(&self) -> ConsoleResult<Vec<String>> {
        let bucket = self.kv.store()?;
        let mut keys: Vec<String> = bucket
            .store
            .keys()
            .await
            .map_err(|e| ConsoleError::Transport(format!("listing keys failed: {e}")))?
            .try_collect()
            .await
            .map_err(|e| ConsoleError::Transport(format!("listing keys failed: {e}")))?;
        keys.sort();
        Ok(keys)
    }

    /// Every retained revision of `key`, newest first.
    pub async fn kv_history(&self, key: &str) -> ConsoleResult<Vec<KvRecord>> {
        let bucket = self.kv.store()?;
        let records: Vec<KvRecord> = bucket
            .store
            .history(key)
            .await
            .map_err(|e| ConsoleError::Transport(format!("history of '{key}' failed: {e}")))?
            .map_ok(KvRecord::from)
            .try_collect()
            .await
            .map_err(|e| ConsoleError::Transport(format!("history of '{key}' failed: {e}")))?;
        Ok(newest_first(records))
    }
}

async fn watch_loop(
    bucket: String,
    mut watch: kv::Watch,
    events: mpsc::Sender<SessionEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            entry = watch.next() => {
                let change = match entry {
                    Some(Ok(entry)) => KvChange::from(&entry),
                    Some(Err(err)) => {
                        warn!(bucket = %bucket, error = %err, "watcher failed");
                        let _ = events
                            .send(SessionEvent::Error(format!("watch on '{bucket}' failed: {err}")))
                            .await;
                        break;
                    }
                    None => {
                        debug!(bucket = %bucket, "watch ended");
                        break;
                    }
                };
                metrics::KV_CHANGES_OBSERVED.inc();
                if events.send(SessionEvent::KvChange(change)).await.is_err() {
                    break;
                }
            }
        }
    }
    trace!(bucket = %bucket, "watch loop stopped");
}

/// Age limit for display; zero means values never expire.
pub fn describe_max_age(max_age: Duration) -> String {
    if max_age.is_zero() {
        "forever".to_owned()
    } else {
        format!("{max_age:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(revision: u64, value: &str) -> KvRecord {
        KvRecord {
            bucket: "cfg".into(),
            key: "k".into(),
            value: value.as_bytes().to_vec(),
            revision,
            operation: KvOperation::Put,
            created: Utc::now(),
        }
    }

    fn idle_task() -> TaskHandle {
        TaskHandle::spawn(|token| async move { token.cancelled().await })
    }

    #[test]
    fn test_newest_first() {
        let out = newest_first(vec![record(1, "a"), record(3, "c"), record(2, "b"), record(3, "c")]);
        let revisions: Vec<u64> = out.iter().map(|r| r.revision).collect();
        assert_eq!(revisions, vec![3, 2, 1]);
        assert_eq!(out[0].text(), "c");
        assert!(newest_first(Vec::new()).is_empty());
    }

    #[test]
    fn test_check_history() {
        assert!(check_history(1).is_ok());
        assert!(check_history(MAX_HISTORY).is_ok());
        assert!(check_history(0).is_err());
        assert!(check_history(MAX_HISTORY + 1).is_err());
    }

    #[test]
    fn test_check_update() {
        assert!(check_update(&BucketUpdate::new("cfg")).is_err());
        let update = BucketUpdate {
            description: Some("x".into()),
            ..BucketUpdate::new("cfg")
        };
        assert!(check_update(&update).is_ok());
        let update = BucketUpdate {
            history: Some(0),
            ..BucketUpdate::new("cfg")
        };
        assert!(check_update(&update).is_err());
        let update = BucketUpdate {
            history: Some(3),
            ..BucketUpdate::new("cf g")
        };
        assert!(check_update(&update).is_err());
    }

    #[test]
    fn test_describe_max_age() {
        assert_eq!(describe_max_age(Duration::ZERO), "forever");
        assert_eq!(describe_max_age(Duration::from_secs(60)), "60s");
    }

    #[tokio::test]
    async fn test_replacing_watcher_stops_previous() {
        let mut state = KvState::default();
        let first = idle_task();
        let first_token = first.token_for_test();
        state.replace_watcher(first);
        assert!(state.is_watching());

        state.replace_watcher(idle_task());
        assert!(first_token.is_cancelled());
        assert!(state.is_watching());
    }

    #[tokio::test]
    async fn test_close_stops_watcher() {
        let mut state = KvState::default();
        let watcher = idle_task();
        let token = watcher.token_for_test();
        state.replace_watcher(watcher);
        state.close();
        assert!(token.is_cancelled());
        assert!(!state.is_watching());
        assert!(state.bucket_name().is_none());
        assert!(!state.stop_watcher());
    }

    #[tokio::test]
    async fn test_operations_without_bucket() {
        let state = KvState::default();
        assert!(state.store().unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_session_kv_requires_connection() {
        let (mut session, _rx) = Session::new(config::ConsoleConfig::default());
        assert!(session.open_bucket("cfg").await.unwrap_err().is_not_connected());
        assert!(session.list_buckets().await.unwrap_err().is_not_connected());
        // no bucket open is reported before any round trip
        assert!(session.kv_get("k").await.unwrap_err().is_not_found());
        assert!(session.kv_history("k").await.unwrap_err().is_not_found());
        assert!(session.watch().await.unwrap_err().is_not_found());
        assert!(!session.unwatch());
    }
}
