//! JetStream stream administration: list, create, update, inspect, purge and delete.

use futures::TryStreamExt;
use tracing::{debug, info};

use crate::codec;
use crate::error::{ConsoleError, ConsoleResult};
use crate::models::{
    ConsumerSummary, StoredMessage, StreamSpec, StreamSummary, StreamUpdate, utc_from_parts,
};
use crate::session::Session;
use crate::subjects::{self, SubjectKind};

fn check_subjects(stream: &str, subjects: &[String]) -> ConsoleResult<()> {
    if subjects.is_empty() {
        return Err(ConsoleError::Config(format!(
            "stream '{stream}' needs at least one subject"
        )));
    }
    for subject in subjects {
        subjects::validate(subject, SubjectKind::Filter)?;
    }
    Ok(())
}

fn check_spec(spec: &StreamSpec) -> ConsoleResult<()> {
    subjects::validate_name("stream", &spec.name)?;
    check_subjects(&spec.name, &spec.subjects)
}

fn check_update(update: &StreamUpdate) -> ConsoleResult<()> {
    subjects::validate_name("stream", &update.name)?;
    if update.is_empty() {
        return Err(ConsoleError::Config(format!(
            "nothing to change for stream '{}'",
            update.name
        )));
    }
    match &update.subjects {
        Some(subjects) => check_subjects(&update.name, subjects),
        None => Ok(()),
    }
}

impl Session {
    /// Every stream on the server, sorted by name.
    pub async fn list_streams(&self) -> ConsoleResult<Vec<StreamSummary>> {
        let js = self.jetstream()?;
        let mut streams: Vec<StreamSummary> = js
            .streams()
            .map_ok(|info| StreamSummary::from(&info))
            .try_collect()
            .await
            .map_err(|e| ConsoleError::Transport(format!("listing streams failed: {e}")))?;
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(streams)
    }

    pub async fn add_stream(&self, spec: &StreamSpec) -> ConsoleResult<StreamSummary> {
        let js = self.jetstream()?;
        check_spec(spec)?;
        let stream = js
            .create_stream(async_nats::jetstream::stream::Config::from(spec))
            .await
            .map_err(|e| {
                ConsoleError::Transport(format!("creating stream '{}' failed: {e}", spec.name))
            })?;
        info!(stream = %spec.name, subjects = ?spec.subjects, "stream created");
        Ok(StreamSummary::from(stream.cached_info()))
    }

    /// Change an existing stream. Only the fields set in `update` are changed.
    pub async fn update_stream(&self, update: &StreamUpdate) -> ConsoleResult<StreamSummary> {
        let js = self.jetstream()?;
        check_update(update)?;
        let mut stream = js
            .get_stream(&update.name)
            .await
            .map_err(|e| ConsoleError::NotFound(format!("stream '{}': {e}", update.name)))?;
        let mut config = stream
            .info()
            .await
            .map_err(|e| ConsoleError::Transport(format!("stream info failed: {e}")))?
            .config
            .clone();
        update.apply(&mut config);
        let info = js.update_stream(&config).await.map_err(|e| {
            ConsoleError::Transport(format!("updating stream '{}' failed: {e}", update.name))
        })?;
        info!(stream = %update.name, ?update, "stream updated");
        Ok(StreamSummary::from(&info))
    }

    pub async fn stream_info(&self, name: &str) -> ConsoleResult<StreamSummary> {
        let js = self.jetstream()?;
        let mut stream = js
            .get_stream(name)
            .await
            .map_err(|e| ConsoleError::NotFound(format!("stream '{name}': {e}")))?;
        let info = stream
            .info()
            .await
            .map_err(|e| ConsoleError::Transport(format!("stream info failed: {e}")))?;
        Ok(StreamSummary::from(info))
    }

    /// Remove every message from a stream. Returns how many were purged.
    pub async fn purge_stream(&self, name: &str) -> ConsoleResult<u64> {
        let js = self.jetstream()?;
        let stream = js
            .get_stream(name)
            .await
            .map_err(|e| ConsoleError::NotFound(format!("stream '{name}': {e}")))?;
        let response = stream
            .purge()
            .await
            .map_err(|e| ConsoleError::Transport(format!("purging '{name}' failed: {e}")))?;
        info!(stream = name, purged = response.purged, "stream purged");
        Ok(response.purged)
    }

    pub async fn delete_stream(&self, name: &str) -> ConsoleResult<()> {
        let js = self.jetstream()?;
        let status = js
            .delete_stream(name)
            .await
            .map_err(|e| ConsoleError::NotFound(format!("stream '{name}': {e}")))?;
        if !status.success {
            return Err(ConsoleError::Transport(format!(
                "server refused to delete stream '{name}'"
            )));
        }
        info!(stream = name, "stream deleted");
        Ok(())
    }

    /// Consumers of a stream, sorted by name.
    pub async fn list_consumers(&self, stream: &str) -> ConsoleResult<Vec<ConsumerSummary>> {
        let js = self.jetstream()?;
        let handle = js
            .get_stream(stream)
            .await
            .map_err(|e| ConsoleError::NotFound(format!("stream '{stream}': {e}")))?;
        let mut consumers: Vec<ConsumerSummary> = handle
            .consumers()
            .map_ok(|info| ConsumerSummary::from(&info))
            .try_collect()
            .await
            .map_err(|e| ConsoleError::Transport(format!("listing consumers failed: {e}")))?;
        consumers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(consumers)
    }

    /// Fetch one stored message by sequence number.
    pub async fn get_message(&self, stream: &str, sequence: u64) -> ConsoleResult<StoredMessage> {
        let js = self.jetstream()?;
        let handle = js
            .get_stream(stream)
            .await
            .map_err(|e| ConsoleError::NotFound(format!("stream '{stream}': {e}")))?;
        let message = handle.get_raw_message(sequence).await.map_err(|e| {
            ConsoleError::NotFound(format!("message {sequence} in '{stream}': {e}"))
        })?;
        debug!(stream, sequence, subject = %message.subject, "fetched stored message");

        let headers = codec::from_header_map(&message.headers);
        Ok(StoredMessage {
            stream: stream.to_owned(),
            sequence: message.sequence,
            subject: message.subject.to_string(),
            text: codec::decode_payload(&message.payload),
            headers: (!headers.is_empty()).then_some(headers),
            size: message.payload.len(),
            time: utc_from_parts(message.time.unix_timestamp(), message.time.nanosecond()),
        })
    }
}
