//! The console session: one connection and everything hanging off it.
//!
//! A [`Session`] owns the client, the subscription registry, the key-value
//! state and the stats poller. Background loops report through the event
//! channel returned by [`Session::new`]; commands are plain async methods.
//! Tearing the session down (disconnect, reconnect, drop) stops every loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::client::{Request, RequestErrorKind};
use async_nats::{ConnectOptions, Event, ServerAddr, Subscriber, jetstream};
use config::ConsoleConfig;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::auth::{Auth, Credentials};
use crate::codec;
use crate::error::{ConsoleError, ConsoleResult};
use crate::kv::KvState;
use crate::metrics;
use crate::models::{ConnectionStatus, InboundMessage, ServerSummary, SessionEvent, SubscriptionInfo};
use crate::registry::{SubscriptionRegistry, TaskHandle};
use crate::stats::{self, InboxSampler};
use crate::subjects::{self, SubjectKind};

/// Base delay for retrying a connect.
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for connect retry backoff.
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

pub(crate) struct Connection {
    pub(crate) client: async_nats::Client,
    pub(crate) jetstream: jetstream::Context,
    url: String,
}

/// A console session.
pub struct Session {
    config: ConsoleConfig,
    events: mpsc::Sender<SessionEvent>,
    pub(crate) conn: Option<Connection>,
    subscriptions: SubscriptionRegistry,
    pub(crate) kv: KvState,
    poller: Option<TaskHandle>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.url())
            .field("subscriptions", &self.subscriptions.len())
            .field("bucket", &self.kv.bucket_name())
            .finish_non_exhaustive()
    }
}

/// Build connect options for one attempt.
pub(crate) fn build_connect_options(
    config: &ConsoleConfig,
    auth: &Auth,
    events: mpsc::Sender<SessionEvent>,
) -> ConsoleResult<ConnectOptions> {
    let mut opts = auth.apply(ConnectOptions::new())?;

    if let Some(ca_path) = &config.tls_ca_path {
        opts = opts
            .add_root_certificates(ca_path.clone())
            .require_tls(true);
    }

    let lost = Arc::new(AtomicBool::new(false));
    Ok(opts
        .name(config.name.as_str())
        .connection_timeout(config.connect_timeout)
        .retain_servers_order()
        .event_callback(move |event| {
            let events = events.clone();
            let event = translate_event(event, &lost);
            async move {
                if let Some(event) = event {
                    // receiver gone means the console is shutting down
                    let _ = events.send(event).await;
                }
            }
        }))
}

/// Map a client library event to a session event. `lost` is set while the
/// library is reconnecting, so only a recovery is reported as connected; the
/// initial connect is reported by [`Session::connect_any`]. A close always
/// follows teardown and is not reported.
fn translate_event(event: Event, lost: &AtomicBool) -> Option<SessionEvent> {
    match event {
        Event::Connected => {
            if !lost.swap(false, Ordering::SeqCst) {
                return None;
            }
            info!("connection re-established");
            Some(SessionEvent::Status(ConnectionStatus::Connected))
        }
        Event::Disconnected => {
            lost.store(true, Ordering::SeqCst);
            warn!("connection lost, client library is reconnecting");
            Some(SessionEvent::Status(ConnectionStatus::Reconnecting))
        }
        Event::Closed => {
            debug!("connection closed");
            None
        }
        other => {
            warn!(event = %other, "client event");
            Some(SessionEvent::Error(other.to_string()))
        }
    }
}

impl Session {
    /// Create a disconnected session and the receiver for its events.
    pub fn new(config: ConsoleConfig) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, rx) = mpsc::channel(config.event_channel_size);
        let session = Self {
            config,
            events,
            conn: None,
            subscriptions: SubscriptionRegistry::new(),
            kv: KvState::default(),
            poller: None,
        };
        (session, rx)
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    /// Status events originate from the command path, which is also the
    /// event consumer, so they must never wait for channel capacity.
    fn emit(&self, event: SessionEvent) {
        if let Err(err) = self.events.try_send(event) {
            debug!(error = %err, "dropped session event");
        }
    }

    pub(crate) fn events(&self) -> mpsc::Sender<SessionEvent> {
        self.events.clone()
    }

    /// Connect to `url`, replacing any existing connection.
    pub async fn connect(
        &mut self,
        url: &str,
        credentials: &Credentials,
    ) -> ConsoleResult<ServerSummary> {
        self.connect_any(&[url.to_owned()], credentials).await
    }

    /// Connect to the first reachable server of `servers`, tried in order,
    /// replacing any existing connection.
    ///
    /// The old connection is torn down before anything else, so a failed
    /// call always leaves the session disconnected. Retries up to
    /// `connect_retry_max` times with exponential backoff. On success the
    /// stats poller is started.
    pub async fn connect_any(
        &mut self,
        servers: &[String],
        credentials: &Credentials,
    ) -> ConsoleResult<ServerSummary> {
        let was_connected = self.teardown().await;

        let (servers, auth) = match prepare(servers, credentials) {
            Ok(prepared) => prepared,
            Err(err) => {
                if was_connected {
                    self.emit(SessionEvent::Status(ConnectionStatus::Disconnected));
                }
                return Err(err);
            }
        };
        let label = servers.join(",");

        self.emit(SessionEvent::Status(ConnectionStatus::Connecting));
        info!(
            url = %label,
            auth = auth.mode(),
            connect_retry_max = self.config.connect_retry_max,
            "connecting"
        );

        let started = async {
            let client = self.dial(&servers, &label, &auth).await?;
            let sampler = InboxSampler::new(client.clone()).await?;
            Ok::<_, ConsoleError>((client, sampler))
        }
        .await;
        let (client, sampler) = match started {
            Ok(started) => started,
            Err(err) => {
                self.emit(SessionEvent::Status(ConnectionStatus::Disconnected));
                return Err(err);
            }
        };

        let summary = ServerSummary::from(client.server_info());
        info!(
            url = %label,
            server = %summary.name,
            version = %summary.version,
            "connected"
        );

        self.poller = Some(stats::spawn_poller(
            sampler,
            self.config.stats_interval,
            self.events(),
        ));
        self.conn = Some(Connection {
            jetstream: jetstream::new(client.clone()),
            client,
            url: label,
        });
        self.emit(SessionEvent::Status(ConnectionStatus::Connected));
        Ok(summary)
    }

    /// Open the client connection, retrying with backoff.
    async fn dial(
        &self,
        servers: &[String],
        label: &str,
        auth: &Auth,
    ) -> ConsoleResult<async_nats::Client> {
        let total_attempts = self.config.connect_retry_max.saturating_add(1);
        let mut attempt = 0;
        loop {
            let opts = build_connect_options(&self.config, auth, self.events())?;
            match opts.connect(servers).await {
                Ok(client) => {
                    debug!(attempts = attempt + 1, "connection established");
                    return Ok(client);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= total_attempts {
                        error!(
                            url = label,
                            attempts = total_attempts,
                            error = %err,
                            "connection failed after all retry attempts"
                        );
                        return Err(map_connect_error(label, total_attempts, err));
                    }

                    let delay = CONNECT_RETRY_BASE_DELAY
                        .saturating_mul(2u32.saturating_pow(attempt - 1))
                        .min(MAX_CONNECT_RETRY_DELAY);
                    warn!(
                        attempt,
                        total_attempts,
                        retry_in_ms = delay.as_millis(),
                        error = %err,
                        "connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Close the connection and stop every background loop. A no-op when
    /// already disconnected.
    pub async fn disconnect(&mut self) {
        if self.teardown().await {
            self.emit(SessionEvent::Status(ConnectionStatus::Disconnected));
        }
    }

    /// Returns true if there was a connection to tear down.
    async fn teardown(&mut self) -> bool {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        self.kv.close();
        self.subscriptions.clear();

        let Some(conn) = self.conn.take() else {
            return false;
        };
        // push out anything still buffered before the client is dropped
        if let Err(err) = conn.client.flush().await {
            debug!(error = %err, "flush on disconnect failed");
        }
        info!(url = %conn.url, "disconnected");
        true
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Current status as reported by the client library.
    pub fn status(&self) -> ConnectionStatus {
        match &self.conn {
            Some(conn) => conn.client.connection_state().into(),
            None => ConnectionStatus::Disconnected,
        }
    }

    /// Url of the current connection.
    pub fn url(&self) -> Option<&str> {
        self.conn.as_ref().map(|c| c.url.as_str())
    }

    pub fn server_info(&self) -> ConsoleResult<ServerSummary> {
        Ok(self.client()?.server_info().into())
    }

    pub(crate) fn client(&self) -> ConsoleResult<&async_nats::Client> {
        self.conn
            .as_ref()
            .map(|c| &c.client)
            .ok_or(ConsoleError::NotConnected)
    }

    pub(crate) fn jetstream(&self) -> ConsoleResult<&jetstream::Context> {
        self.conn
            .as_ref()
            .map(|c| &c.jetstream)
            .ok_or(ConsoleError::NotConnected)
    }

    /// Subscribe to `subject` and forward its messages as
    /// [`SessionEvent::Message`].
    pub async fn subscribe(&mut self, subject: &str) -> ConsoleResult<SubscriptionInfo> {
        let client = self.client()?.clone();
        subjects::validate(subject, SubjectKind::Filter)?;

        let subscriber = client
            .subscribe(subject.to_owned())
            .await
            .map_err(|e| ConsoleError::Transport(format!("subscribe to '{subject}' failed: {e}")))?;

        let id = self.subscriptions.next_id();
        let events = self.events();
        let handle = TaskHandle::spawn(move |token| deliver(id, subscriber, events, token));
        let info = self.subscriptions.insert(id, subject.to_owned(), handle);
        info!(id, subject, count = info.count, "subscribed");
        Ok(info)
    }

    /// Stop subscription `id` and return how many remain. Unknown ids are
    /// ignored.
    pub fn unsubscribe(&mut self, id: u64) -> usize {
        match self.subscriptions.remove(id) {
            Some(sub) => info!(id, subject = %sub.subject, "unsubscribed"),
            None => debug!(id, "unsubscribe of unknown id ignored"),
        }
        self.subscriptions.len()
    }

    /// `(id, subject)` of every active subscription, in id order.
    pub fn subscriptions(&self) -> Vec<(u64, String)> {
        self.subscriptions.list()
    }

    /// Publish `payload` to `subject` with optional header JSON.
    pub async fn publish(
        &self,
        subject: &str,
        payload: &str,
        headers: Option<&str>,
    ) -> ConsoleResult<()> {
        let client = self.client()?;
        subjects::validate(subject, SubjectKind::Publish)?;
        let headers = headers.map(codec::parse_headers).transpose()?.flatten();
        let payload = codec::encode_payload(payload);

        match headers {
            Some(headers) => {
                client
                    .publish_with_headers(
                        subject.to_owned(),
                        codec::to_header_map(&headers),
                        payload,
                    )
                    .await
            }
            None => client.publish(subject.to_owned(), payload).await,
        }
        .map_err(|e| ConsoleError::Transport(format!("publish to '{subject}' failed: {e}")))?;

        metrics::MESSAGES_PUBLISHED.inc();
        trace!(subject, "published");
        Ok(())
    }

    /// Send a request and wait up to `timeout` for the reply.
    pub async fn request(
        &self,
        subject: &str,
        payload: &str,
        headers: Option<&str>,
        timeout: Duration,
    ) -> ConsoleResult<InboundMessage> {
        let client = self.client()?;
        subjects::validate(subject, SubjectKind::Publish)?;
        let headers = headers.map(codec::parse_headers).transpose()?.flatten();

        let mut request = Request::new()
            .payload(codec::encode_payload(payload))
            .timeout(Some(timeout));
        if let Some(headers) = headers {
            request = request.headers(codec::to_header_map(&headers));
        }

        metrics::MESSAGES_PUBLISHED.inc();
        let reply = client
            .send_request(subject.to_owned(), request)
            .await
            .map_err(|err| match err.kind() {
                RequestErrorKind::TimedOut => ConsoleError::Timeout {
                    subject: subject.to_owned(),
                    timeout,
                },
                RequestErrorKind::NoResponders => ConsoleError::NoResponders(subject.to_owned()),
                _ => ConsoleError::Transport(format!("request to '{subject}' failed: {err}")),
            })?;
        debug!(subject, reply_subject = %reply.subject, "reply received");
        Ok(InboundMessage::from_reply(&reply))
    }

    /// Wait until everything published so far has reached the server.
    pub async fn flush(&self) -> ConsoleResult<()> {
        self.client()?
            .flush()
            .await
            .map_err(|e| ConsoleError::Transport(format!("flush failed: {e}")))
    }

    /// Request with the configured default timeout.
    pub async fn request_default(
        &self,
        subject: &str,
        payload: &str,
        headers: Option<&str>,
    ) -> ConsoleResult<InboundMessage> {
        self.request(subject, payload, headers, self.config.request_timeout)
            .await
    }
}

/// Validate connect input: at least one parseable server url and a usable
/// auth mode.
fn prepare(servers: &[String], credentials: &Credentials) -> ConsoleResult<(Vec<String>, Auth)> {
    let servers: Vec<String> = servers
        .iter()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect();
    if servers.is_empty() {
        return Err(ConsoleError::Config("server url is empty".into()));
    }
    for server in &servers {
        server
            .parse::<ServerAddr>()
            .map_err(|e| ConsoleError::Config(format!("invalid server url '{server}': {e}")))?;
    }
    let auth = credentials.resolve()?;
    Ok((servers, auth))
}

fn map_connect_error(url: &str, attempts: u32, err: async_nats::ConnectError) -> ConsoleError {
    use async_nats::ConnectErrorKind;
    match err.kind() {
        ConnectErrorKind::AuthorizationViolation | ConnectErrorKind::Authentication => {
            ConsoleError::Auth(format!("server at '{url}' rejected credentials: {err}"))
        }
        _ => ConsoleError::Transport(format!(
            "connection to '{url}' failed after {attempts} attempt(s): {err}"
        )),
    }
}

/// Forward messages from one subscription until it is stopped.
async fn deliver(
    id: u64,
    mut subscriber: Subscriber,
    events: mpsc::Sender<SessionEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = subscriber.next() => {
                let Some(msg) = msg else {
                    debug!(id, "subscription closed by the server");
                    return;
                };
                metrics::MESSAGES_RECEIVED.inc();
                let msg = InboundMessage::from_delivery(id, &msg);
                if events.send(SessionEvent::Message(msg)).await.is_err() {
                    break;
                }
            }
        }
    }
    if let Err(err) = subscriber.unsubscribe().await {
        debug!(id, error = %err, "unsubscribe failed");
    }
    trace!(id, "delivery loop stopped");
}
