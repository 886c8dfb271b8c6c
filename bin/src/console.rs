//! Command dispatch: runs parsed commands against the session and turns
//! results and session events into text.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use config::{AuthConfig, ConsoleConfig};
use nats_session::{
    BucketSpec, BucketUpdate, ConsoleError, Credentials, RecentsStore, Session, SessionEvent,
    StreamSpec, StreamUpdate, metrics,
};
use tracing::{debug, warn};

use crate::render::{self, LogEntry, MessageLog};
use crate::repl::{Command, JsCommand, KvCommand};

/// What the main loop should do after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Nothing,
    Quit,
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Reply::Text(text)
    }
}

pub struct Console {
    session: Session,
    recents: RecentsStore,
    log: MessageLog,
    credentials: Credentials,
    last_rtt: Option<Duration>,
}

impl Console {
    pub fn new(session: Session, recents: RecentsStore, credentials: Credentials) -> Self {
        let log = MessageLog::new(session.config().log_capacity);
        Self {
            session,
            recents,
            log,
            credentials,
            last_rtt: None,
        }
    }

    /// Run one command. Failures are rendered, never returned.
    pub async fn execute(&mut self, command: Command) -> Reply {
        match self.run(command).await {
            Ok(reply) => reply,
            Err(err) => Reply::Text(render::error_toast(format!("{err:#}"))),
        }
    }

    /// Render a session event, recording messages and key changes in the log.
    pub fn handle_event(&mut self, event: SessionEvent) -> Option<String> {
        match event {
            SessionEvent::Status(status) => Some(render::status_toast(status)),
            SessionEvent::Latency(rtt) => {
                // too chatty for the terminal, `status` shows the last sample
                debug!(rtt_ms = rtt.as_secs_f64() * 1000.0, "latency sample");
                self.last_rtt = Some(rtt);
                None
            }
            SessionEvent::Message(msg) => {
                let line = render::message(&msg);
                self.log.push(LogEntry::Message(msg));
                Some(line)
            }
            SessionEvent::KvChange(change) => {
                let entry = LogEntry::KvChange {
                    change,
                    observed_at: Utc::now(),
                };
                let line = entry.render();
                self.log.push(entry);
                Some(line)
            }
            SessionEvent::Error(err) => Some(render::error_toast(err)),
        }
    }

    /// Disconnect and persist recents.
    pub async fn shutdown(&mut self) {
        self.session.disconnect().await;
        self.save_recents();
    }

    fn save_recents(&self) {
        if let Err(err) = self.recents.save() {
            warn!(error = %err, "failed to save console state");
        }
    }

    fn remember_subject(&mut self, subject: &str) {
        self.recents.remember_subject(subject);
        self.save_recents();
    }

    async fn run(&mut self, command: Command) -> Result<Reply> {
        let reply = match command {
            Command::Connect {
                url,
                token,
                user,
                password,
                creds,
            } => {
                let targets =
                    connect_targets(url, self.session.config(), self.recents.last_url());
                let credentials = command_credentials(token, user, password, creds)
                    .await?
                    .or(self.credentials.clone());
                let server = self.session.connect_any(&targets, &credentials).await?;
                if let [url] = targets.as_slice() {
                    self.recents.remember_url(url);
                    self.save_recents();
                }
                render::connected(&targets.join(","), &server).into()
            }
            Command::Disconnect => {
                self.session.disconnect().await;
                self.last_rtt = None;
                Reply::Nothing
            }
            Command::Status => {
                let mut out = render::status_toast(self.session.status());
                if let (Some(url), Ok(server)) = (self.session.url(), self.session.server_info()) {
                    out = format!("{out}\n{}", render::connected(url, &server));
                }
                if let Some(rtt) = self.last_rtt {
                    out = format!("{out}\n{}", render::latency(rtt));
                }
                if let Some(bucket) = self.session.bucket() {
                    let watching = if self.session.is_watching() { ", watching" } else { "" };
                    out = format!("{out}\nbucket {bucket}{watching}");
                }
                out.into()
            }
            Command::Sub { subject } => {
                let info = self.session.subscribe(&subject).await?;
                self.remember_subject(&subject);
                render::subscribed(&info).into()
            }
            Command::Unsub { id } => {
                let remaining = self.session.unsubscribe(id);
                format!("{remaining} subscription(s) active").into()
            }
            Command::Subs => render::subscriptions(&self.session.subscriptions()).into(),
            Command::Pub {
                subject,
                payload,
                headers,
            } => {
                self.session
                    .publish(&subject, &payload, headers.as_deref())
                    .await?;
                self.remember_subject(&subject);
                format!("published {} bytes to {subject}", payload.len()).into()
            }
            Command::Req {
                subject,
                payload,
                headers,
                timeout,
            } => {
                let timeout = timeout.unwrap_or(self.session.config().request_timeout);
                let reply = self
                    .session
                    .request(&subject, &payload, headers.as_deref(), timeout)
                    .await?;
                self.remember_subject(&subject);
                render::message(&reply).into()
            }
            Command::Kv(cmd) => self.run_kv(cmd).await?,
            Command::Js(cmd) => self.run_js(cmd).await?,
            Command::Recent => {
                let urls: Vec<String> = self.recents.urls().iter().map(str::to_owned).collect();
                let subjects: Vec<String> =
                    self.recents.subjects().iter().map(str::to_owned).collect();
                format!(
                    "servers:\n{}\nsubjects:\n{}",
                    render::names("servers", &urls),
                    render::names("subjects", &subjects)
                )
                .into()
            }
            Command::Log { count } => {
                if self.log.is_empty() {
                    "log is empty".to_owned().into()
                } else {
                    self.log
                        .tail(count)
                        .map(LogEntry::render)
                        .collect::<Vec<_>>()
                        .join("\n")
                        .into()
                }
            }
            Command::Export { path } => {
                let written = self.log.export(&path)?;
                format!("wrote {written} entries to {}", path.display()).into()
            }
            Command::Metrics => metrics::render_text()?.into(),
            Command::Quit => Reply::Quit,
        };
        Ok(reply)
    }

    async fn run_kv(&mut self, command: KvCommand) -> Result<Reply, ConsoleError> {
        let session = &mut self.session;
        let reply = match command {
            KvCommand::Buckets => render::names("buckets", &session.list_buckets().await?),
            KvCommand::Create(args) => {
                render::bucket(&session.create_bucket(&BucketSpec::from(args)).await?)
            }
            KvCommand::Update(args) => {
                render::bucket(&session.update_bucket(&BucketUpdate::from(args)).await?)
            }
            KvCommand::Open { bucket } => render::bucket(&session.open_bucket(&bucket).await?),
            KvCommand::Status { bucket } => {
                let name = match bucket.or_else(|| session.bucket().map(str::to_owned)) {
                    Some(name) => name,
                    None => return Err(ConsoleError::NotFound("no bucket open".into())),
                };
                render::bucket(&session.bucket_status(&name).await?)
            }
            KvCommand::Keys => render::names("keys", &session.kv_keys().await?),
            KvCommand::Get { key } => render::kv_record(&session.kv_get(&key).await?),
            KvCommand::Put { key, value } => {
                let revision = session.kv_put(&key, &value).await?;
                format!("{key} stored at rev {revision}")
            }
            KvCommand::Del { key } => {
                session.kv_delete(&key).await?;
                format!("{key} deleted")
            }
            KvCommand::Purge { key } => {
                session.kv_purge(&key).await?;
                format!("{key} purged")
            }
            KvCommand::History { key } => render::history(&session.kv_history(&key).await?),
            KvCommand::Watch => {
                session.watch().await?;
                format!("watching {}", session.bucket().unwrap_or_default())
            }
            KvCommand::Unwatch => {
                if session.unwatch() {
                    "stopped watching".to_owned()
                } else {
                    "no watcher running".to_owned()
                }
            }
        };
        Ok(Reply::Text(reply))
    }

    async fn run_js(&mut self, command: JsCommand) -> Result<Reply, ConsoleError> {
        let session = &self.session;
        let reply = match command {
            JsCommand::Streams => render::streams(&session.list_streams().await?),
            JsCommand::Info { stream } => render::stream(&session.stream_info(&stream).await?),
            JsCommand::Add(args) => {
                render::stream(&session.add_stream(&StreamSpec::from(args)).await?)
            }
            JsCommand::Update(args) => {
                render::stream(&session.update_stream(&StreamUpdate::from(args)).await?)
            }
            JsCommand::Purge { stream } => {
                let purged = session.purge_stream(&stream).await?;
                format!("purged {purged} messages from {stream}")
            }
            JsCommand::Rm { stream } => {
                session.delete_stream(&stream).await?;
                format!("deleted stream {stream}")
            }
            JsCommand::Consumers { stream } => {
                render::consumers(&session.list_consumers(&stream).await?)
            }
            JsCommand::Msg { stream, sequence } => {
                render::stored_message(&session.get_message(&stream, sequence).await?)
            }
        };
        Ok(Reply::Text(reply))
    }
}

/// Servers a `connect` line dials: the url it names, else the servers from
/// `--server` or the config file, else the last used url, else the default.
fn connect_targets(
    url: Option<String>,
    config: &ConsoleConfig,
    last_url: Option<&str>,
) -> Vec<String> {
    match (url, last_url) {
        (Some(url), _) => vec![url],
        (None, _) if config.servers_explicit => config.servers.clone(),
        (None, Some(last)) => vec![last.to_owned()],
        (None, None) => config.servers.clone(),
    }
}

/// Credentials given on the `connect` line itself.
async fn command_credentials(
    token: Option<String>,
    user: Option<String>,
    password: Option<String>,
    creds: Option<PathBuf>,
) -> Result<Credentials, ConsoleError> {
    Credentials::load(&AuthConfig {
        creds_file: creds,
        token,
        username: user,
        password,
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl::parse_line;
    use config::Recents;
    use nats_session::{ConnectionStatus, InboundMessage, KvChange, KvOperation};
    use tracing_test::traced_test;

    fn console() -> Console {
        let config = ConsoleConfig {
            log_capacity: 3,
            ..ConsoleConfig::default()
        };
        let (session, _rx) = Session::new(config);
        let recents = RecentsStore::ephemeral(Recents {
            urls: 5,
            subjects: 10,
        });
        Console::new(session, recents, Credentials::default())
    }

    async fn run(console: &mut Console, line: &str) -> Reply {
        let command = parse_line(line).unwrap().unwrap();
        console.execute(command).await
    }

    fn text(reply: Reply) -> String {
        match reply {
            Reply::Text(text) => text,
            other => panic!("expected text, got {other:?}"),
        }
    }

    fn message(id: u64, text: &str) -> InboundMessage {
        InboundMessage {
            subscription_id: Some(id),
            subject: "orders.created".into(),
            reply_to: None,
            text: text.into(),
            is_reply: false,
            headers: None,
            size: text.len(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commands_need_connection() {
        let mut console = console();
        for line in [
            "sub orders.*",
            "pub orders.created hi",
            "req svc.echo hi",
            "kv buckets",
            "kv open cfg",
            "js streams",
        ] {
            let out = text(run(&mut console, line).await);
            assert!(out.contains("not connected"), "{line}: {out}");
        }
    }

    #[tokio::test]
    async fn test_invalid_input_is_reported() {
        let mut console = console();
        let out = text(run(&mut console, "kv get k").await);
        assert!(out.contains("no bucket open"), "{out}");
        let out = text(run(&mut console, "kv status").await);
        assert!(out.contains("no bucket open"), "{out}");
    }

    #[tokio::test]
    async fn test_status_and_quit() {
        let mut console = console();
        assert_eq!(text(run(&mut console, "status").await), "[-] disconnected");
        assert_eq!(run(&mut console, "disconnect").await, Reply::Nothing);
        assert_eq!(run(&mut console, "quit").await, Reply::Quit);
        assert_eq!(
            text(run(&mut console, "unsub 4").await),
            "0 subscription(s) active"
        );
        assert_eq!(text(run(&mut console, "kv unwatch").await), "no watcher running");
    }

    #[tokio::test]
    async fn test_events_fill_log() {
        let mut console = console();
        assert_eq!(text(run(&mut console, "log").await), "log is empty");

        assert_eq!(
            console.handle_event(SessionEvent::Status(ConnectionStatus::Connected)),
            Some("[+] connected".to_owned())
        );
        assert!(
            console
                .handle_event(SessionEvent::Latency(Duration::from_millis(2)))
                .is_none()
        );
        for i in 0..4 {
            let line = console
                .handle_event(SessionEvent::Message(message(1, &format!("m{i}"))))
                .unwrap();
            assert!(line.ends_with(&format!("m{i}")));
        }
        let line = console
            .handle_event(SessionEvent::KvChange(KvChange {
                bucket: "cfg".into(),
                key: "k".into(),
                operation: KvOperation::Put,
                revision: 1,
            }))
            .unwrap();
        assert!(line.ends_with("kv cfg PUT k rev 1"));

        // capacity 3: m0 and m1 were dropped
        let out = text(run(&mut console, "log 10").await);
        assert!(!out.contains("m1"));
        assert!(out.contains("m2"));
        assert!(out.contains("m3"));
        assert!(out.contains("rev 1"));
    }

    #[tokio::test]
    async fn test_export() {
        let mut console = console();
        console.handle_event(SessionEvent::Message(message(1, "hello")));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let out = text(run(&mut console, &format!("export {}", path.display())).await);
        assert!(out.starts_with("wrote 1 entries"), "{out}");
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);

        let out = text(run(&mut console, "export /definitely/missing/dir/out.jsonl").await);
        assert!(out.starts_with("[!]"), "{out}");
    }

    #[tokio::test]
    async fn test_recent_and_metrics() {
        let mut console = console();
        let out = text(run(&mut console, "recent").await);
        assert!(out.contains("no servers"));
        assert!(out.contains("no subjects"));

        let out = text(run(&mut console, "metrics").await);
        assert!(out.contains("console_"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_shutdown_reports_unwritable_state() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let (session, _rx) = Session::new(ConsoleConfig::default());
        let recents = RecentsStore::load(
            blocker.join("state.json"),
            Recents {
                urls: 5,
                subjects: 10,
            },
        );
        let mut console = Console::new(session, recents, Credentials::default());
        console.shutdown().await;
        assert!(logs_contain("failed to save console state"));
    }

    #[test]
    fn test_connect_targets() {
        let default = ConsoleConfig::default();
        let explicit = ConsoleConfig::default().with_server("nats://cfg:4222");
        let last = Some("nats://last:4222");

        assert_eq!(
            connect_targets(Some("nats://typed:4222".into()), &explicit, last),
            vec!["nats://typed:4222"]
        );
        assert_eq!(connect_targets(None, &explicit, last), vec!["nats://cfg:4222"]);
        assert_eq!(connect_targets(None, &default, last), vec!["nats://last:4222"]);
        assert_eq!(connect_targets(None, &default, None), default.servers);
    }

    #[tokio::test]
    async fn test_bare_connect_prefers_configured_server() {
        let config = ConsoleConfig::default().with_server("nats://127.0.0.1:3");
        let (session, _rx) = Session::new(config);
        let mut recents = RecentsStore::ephemeral(Recents {
            urls: 5,
            subjects: 10,
        });
        recents.remember_url("nats://127.0.0.1:2");
        let mut console = Console::new(session, recents, Credentials::default());

        let out = text(run(&mut console, "connect").await);
        assert!(out.contains("127.0.0.1:3"), "{out}");
        assert!(!out.contains("127.0.0.1:2"), "{out}");
    }

    #[tokio::test]
    async fn test_connect_with_bad_creds_file() {
        let mut console = console();
        let out = text(run(&mut console, "connect nats://127.0.0.1:4222 --creds /nope.creds").await);
        assert!(out.contains("auth error"), "{out}");
        assert!(console.recents.urls().is_empty());
    }
}
