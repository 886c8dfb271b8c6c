use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};

pub const DEFAULT_SERVER: &str = "nats://127.0.0.1:4222";
pub const DEFAULT_CLIENT_NAME: &str = "nats-console";
pub const DEFAULT_URL_HISTORY: usize = 5;
pub const DEFAULT_SUBJECT_HISTORY: usize = 10;

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// unset means the built-in default server
    #[serde(default)]
    pub servers: Option<MaybeList<String>>,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub tls_ca_path: Option<PathBuf>,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub connect_retry_max: u32,
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
    #[serde(
        default = "default_stats_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub stats_interval: Duration,
    #[serde(default = "default_event_channel_size")]
    pub event_channel_size: usize,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default)]
    pub recents: Recents,
}

/// Credentials sources. At most one is used at connect time, in the order
/// creds file, token, username/password.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Auth {
    pub creds_file: Option<PathBuf>,
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Recents {
    #[serde(default = "default_url_history")]
    pub urls: usize,
    #[serde(default = "default_subject_history")]
    pub subjects: usize,
}

impl Default for Recents {
    fn default() -> Self {
        Self {
            urls: DEFAULT_URL_HISTORY,
            subjects: DEFAULT_SUBJECT_HISTORY,
        }
    }
}

pub fn default_name() -> String {
    DEFAULT_CLIENT_NAME.to_owned()
}

pub const fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

pub const fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

pub const fn default_stats_interval() -> Duration {
    Duration::from_secs(2)
}

pub const fn default_event_channel_size() -> usize {
    1_024
}

pub const fn default_log_capacity() -> usize {
    500
}

pub const fn default_url_history() -> usize {
    DEFAULT_URL_HISTORY
}

pub const fn default_subject_history() -> usize {
    DEFAULT_SUBJECT_HISTORY
}

/// Parse a duration string with optional time units
/// Accepts: "500ms", "2", "2s", "1m", "1h"
/// If no unit is specified, assumes seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow::Error::msg("empty duration string"));
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationSpec {
    Seconds(u64),
    String(String),
}

impl DurationSpec {
    fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
        let dur = match self {
            DurationSpec::Seconds(val) => Duration::from_secs(val),
            DurationSpec::String(s) => parse_duration(&s).map_err(E::custom)?,
        };
        if dur.is_zero() {
            return Err(E::custom("duration cannot be zero"));
        }
        Ok(dur)
    }
}

fn deserialize_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    DurationSpec::deserialize(de)?.into_duration()
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MaybeList<T> {
    Val(T),
    List(Vec<T>),
}

impl<T> MaybeList<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            MaybeList::Val(v) => vec![v],
            MaybeList::List(list) => list,
        }
    }
}
