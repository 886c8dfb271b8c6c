#![allow(dead_code)]

pub mod fake;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use config::ConsoleConfig;
use nats_session::{ConnectionStatus, Credentials, Session, SessionEvent};
use tokio::sync::mpsc;

/// Env var naming the server the live tests run against. Unset skips them.
pub const TEST_URL_VAR: &str = "NATS_TEST_URL";

pub const EVENT_WAIT: Duration = Duration::from_secs(5);

pub fn test_url() -> Option<String> {
    match std::env::var(TEST_URL_VAR) {
        Ok(url) if !url.trim().is_empty() => Some(url),
        _ => {
            eprintln!("{TEST_URL_VAR} not set, skipping live test");
            None
        }
    }
}

/// Config with a short request timeout.
pub fn test_config() -> ConsoleConfig {
    ConsoleConfig {
        request_timeout: Duration::from_millis(500),
        ..ConsoleConfig::default()
    }
}

/// Connected session with a short request timeout.
pub async fn connect(url: &str) -> Result<(Session, mpsc::Receiver<SessionEvent>)> {
    let (mut session, rx) = Session::new(test_config());
    session.connect(url, &Credentials::default()).await?;
    Ok((session, rx))
}

/// Name unique to this test run, usable as a bucket, stream or subject token.
pub fn unique(prefix: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "{prefix}_{}_{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// Wait for the first event matching `pred`, skipping everything else.
pub async fn next_matching<T>(
    rx: &mut mpsc::Receiver<SessionEvent>,
    mut pred: impl FnMut(SessionEvent) -> Option<T>,
) -> Result<T> {
    let deadline = tokio::time::Instant::now() + EVENT_WAIT;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => {
                if let Some(found) = pred(event) {
                    return Ok(found);
                }
            }
            Ok(None) => bail!("event channel closed"),
            Err(_) => bail!("no matching event within {EVENT_WAIT:?}"),
        }
    }
}

/// Drain whatever is queued right now.
pub fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Fail if a message event arrives within `wait`.
pub async fn expect_no_message(
    rx: &mut mpsc::Receiver<SessionEvent>,
    wait: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(SessionEvent::Message(msg))) => {
                bail!("unexpected message on '{}': {}", msg.subject, msg.text)
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return Ok(()),
        }
    }
}

/// Connection status events queued right now, in order.
pub fn statuses(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<ConnectionStatus> {
    drain(rx)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Status(status) => Some(status),
            _ => None,
        })
        .collect()
}
