//! Round-trip latency poller.
//!
//! While a session is connected the poller takes one sample per interval and
//! reports it as [`SessionEvent::Latency`]. A sample is a full trip through
//! the server: publish to a private inbox, then wait for the delivery.
//! Failed samples are skipped: they only show up in the debug log and in
//! `console_stats_poll_failures`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_nats::Subscriber;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{ConsoleError, ConsoleResult};
use crate::metrics;
use crate::models::SessionEvent;
use crate::registry::TaskHandle;

/// Source of latency samples.
#[async_trait]
pub trait LatencyProbe: Send + Sync + 'static {
    /// true if a sample can be taken right now
    fn is_connected(&self) -> bool;

    /// Measure one round trip to the server.
    async fn round_trip(&self) -> Result<Duration, String>;
}

/// Measures latency as the time a message takes to travel to the server
/// and back on a private inbox of the session's own client.
pub struct InboxSampler {
    client: async_nats::Client,
    inbox: String,
    echoes: Mutex<Subscriber>,
    sequence: AtomicU64,
}

impl InboxSampler {
    pub async fn new(client: async_nats::Client) -> ConsoleResult<Self> {
        let inbox = client.new_inbox();
        let echoes = client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| ConsoleError::Transport(format!("latency inbox subscribe failed: {e}")))?;
        Ok(Self {
            client,
            inbox,
            echoes: Mutex::new(echoes),
            sequence: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl LatencyProbe for InboxSampler {
    fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    async fn round_trip(&self) -> Result<Duration, String> {
        let token = self.sequence.fetch_add(1, Ordering::Relaxed).to_string();
        let mut echoes = self.echoes.lock().await;
        let start = Instant::now();
        self.client
            .publish(self.inbox.clone(), Bytes::from(token.clone()))
            .await
            .map_err(|e| e.to_string())?;
        self.client.flush().await.map_err(|e| e.to_string())?;
        // echoes of samples that timed out earlier are skipped
        while let Some(echo) = echoes.next().await {
            if echo.payload.as_ref() == token.as_bytes() {
                return Ok(start.elapsed());
            }
        }
        Err("latency inbox closed".into())
    }
}

/// Start polling `probe` every `interval`. The poller stops when the handle
/// is stopped or dropped, or when the event receiver goes away.
pub fn spawn_poller<P: LatencyProbe>(
    probe: P,
    interval: Duration,
    events: mpsc::Sender<SessionEvent>,
) -> TaskHandle {
    TaskHandle::spawn(move |token| poll(probe, interval, events, token))
}

async fn poll<P: LatencyProbe>(
    probe: P,
    interval: Duration,
    events: mpsc::Sender<SessionEvent>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(interval_ms = interval.as_millis(), "stats poller started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !probe.is_connected() {
            trace!("not connected, skipping latency sample");
            continue;
        }

        // a sample may not outlive its tick
        let sample = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            sample = tokio::time::timeout(interval, probe.round_trip()) => sample,
        };

        match sample {
            Ok(Ok(rtt)) => {
                metrics::RTT_SECONDS.observe(rtt.as_secs_f64());
                if events.send(SessionEvent::Latency(rtt)).await.is_err() {
                    debug!("event receiver closed, stopping stats poller");
                    break;
                }
            }
            Ok(Err(err)) => {
                metrics::STATS_POLL_FAILURES.inc();
                debug!(error = %err, "latency sample failed");
            }
            Err(_) => {
                metrics::STATS_POLL_FAILURES.inc();
                debug!(timeout_ms = interval.as_millis(), "latency sample timed out");
            }
        }
    }
    debug!("stats poller stopped");
}
