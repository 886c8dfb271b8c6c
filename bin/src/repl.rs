//! Console command line parsing.
//!
//! A line is split into words honouring single and double quotes, then
//! parsed by clap, so every command gets `help` and usage errors for free.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use nats_session::{BucketSpec, BucketUpdate, StorageKind, StreamSpec, StreamUpdate};

#[derive(Parser, Debug, PartialEq, Eq)]
#[command(
    name = "nats-console",
    no_binary_name = true,
    disable_version_flag = true,
    help_template = "{subcommands}"
)]
struct Line {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connect to a server, replacing the current connection
    Connect {
        /// server url [default: configured servers, else the last used url]
        url: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        password: Option<String>,
        /// path to a .creds file
        #[arg(long)]
        creds: Option<PathBuf>,
    },
    /// Close the connection and stop all subscriptions and watchers
    Disconnect,
    /// Show connection status
    Status,
    /// Subscribe to a subject filter
    Sub { subject: String },
    /// Remove a subscription by id
    Unsub { id: u64 },
    /// List active subscriptions
    Subs,
    /// Publish a message
    Pub {
        subject: String,
        #[arg(default_value = "")]
        payload: String,
        /// headers as a JSON object, e.g. '{"a":"1"}'
        #[arg(short = 'H', long)]
        headers: Option<String>,
    },
    /// Send a request and wait for the reply
    Req {
        subject: String,
        #[arg(default_value = "")]
        payload: String,
        #[arg(short = 'H', long)]
        headers: Option<String>,
        /// e.g. 500ms, 2s [default: configured request timeout]
        #[arg(short, long, value_parser = parse_duration)]
        timeout: Option<Duration>,
    },
    /// Key-value buckets
    #[command(subcommand)]
    Kv(KvCommand),
    /// JetStream streams
    #[command(subcommand)]
    Js(JsCommand),
    /// Recently used servers and subjects
    Recent,
    /// Show the newest log entries
    Log {
        #[arg(default_value_t = 20)]
        count: usize,
    },
    /// Write the message log to a file as JSON lines
    Export { path: PathBuf },
    /// Show console metrics in the prometheus text format
    Metrics,
    /// Leave the console
    #[command(alias = "exit")]
    Quit,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum KvCommand {
    /// List buckets
    Buckets,
    /// Create a bucket
    Create(BucketArgs),
    /// Change history depth, max age or description of a bucket
    Update(BucketUpdateArgs),
    /// Open a bucket; stops the current watcher
    Open { bucket: String },
    /// Show bucket status [default: the open bucket]
    Status { bucket: Option<String> },
    /// List keys of the open bucket
    Keys,
    Get { key: String },
    Put { key: String, value: String },
    /// Delete a key, keeping its history
    Del { key: String },
    /// Delete a key and its history
    Purge { key: String },
    /// Show every revision of a key, newest first
    History { key: String },
    /// Watch the open bucket for changes
    Watch,
    /// Stop watching
    Unwatch,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct BucketArgs {
    pub bucket: String,
    /// values kept per key
    #[arg(long, default_value_t = 1)]
    pub history: i64,
    /// e.g. 1h; unset keeps values forever
    #[arg(long, value_parser = parse_duration)]
    pub max_age: Option<Duration>,
    #[arg(long)]
    pub description: Option<String>,
}

impl From<BucketArgs> for BucketSpec {
    fn from(args: BucketArgs) -> Self {
        BucketSpec {
            name: args.bucket,
            history: args.history,
            max_age: args.max_age.unwrap_or(Duration::ZERO),
            description: args.description,
        }
    }
}

/// Settings left out are kept as they are.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct BucketUpdateArgs {
    pub bucket: String,
    #[arg(long)]
    pub history: Option<i64>,
    /// 0 keeps values forever
    #[arg(long, value_parser = parse_duration)]
    pub max_age: Option<Duration>,
    #[arg(long)]
    pub description: Option<String>,
}

impl From<BucketUpdateArgs> for BucketUpdate {
    fn from(args: BucketUpdateArgs) -> Self {
        BucketUpdate {
            name: args.bucket,
            history: args.history,
            max_age: args.max_age,
            description: args.description,
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum JsCommand {
    /// List streams
    Streams,
    /// Show stream details
    Info { stream: String },
    /// Create a stream
    Add(StreamArgs),
    /// Change the settings of a stream
    Update(StreamUpdateArgs),
    /// Remove every message from a stream
    Purge { stream: String },
    /// Delete a stream
    Rm { stream: String },
    /// List consumers of a stream
    Consumers { stream: String },
    /// Show a stored message by sequence
    Msg { stream: String, sequence: u64 },
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct StreamArgs {
    pub stream: String,
    /// subject captured by the stream; repeatable
    #[arg(short, long = "subject", required = true)]
    pub subjects: Vec<String>,
    #[arg(long, default_value = "file")]
    pub storage: StorageKind,
    #[arg(long, value_parser = parse_duration)]
    pub max_age: Option<Duration>,
    /// -1 for unlimited
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub max_msgs: i64,
    #[arg(long)]
    pub description: Option<String>,
}

impl From<StreamArgs> for StreamSpec {
    fn from(args: StreamArgs) -> Self {
        StreamSpec {
            name: args.stream,
            subjects: args.subjects,
            storage: args.storage,
            max_age: args.max_age.unwrap_or(Duration::ZERO),
            max_messages: args.max_msgs,
            description: args.description,
        }
    }
}

/// Settings left out are kept as they are.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct StreamUpdateArgs {
    pub stream: String,
    /// replaces the subject list when given; repeatable
    #[arg(short, long = "subject")]
    pub subjects: Vec<String>,
    #[arg(long)]
    pub storage: Option<StorageKind>,
    #[arg(long, value_parser = parse_duration)]
    pub max_age: Option<Duration>,
    /// -1 for unlimited
    #[arg(long, allow_negative_numbers = true)]
    pub max_msgs: Option<i64>,
    #[arg(long)]
    pub description: Option<String>,
}

impl From<StreamUpdateArgs> for StreamUpdate {
    fn from(args: StreamUpdateArgs) -> Self {
        StreamUpdate {
            name: args.stream,
            subjects: (!args.subjects.is_empty()).then_some(args.subjects),
            storage: args.storage,
            max_age: args.max_age,
            max_messages: args.max_msgs,
            description: args.description,
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    config::wire::parse_duration(s).map_err(|e| e.to_string())
}

/// Split a line into words. Quotes group words and are removed; a
/// backslash escapes the next character outside single quotes.
pub fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') | (Some('"'), '"') => quote = None,
            (Some('\''), c) => word.push(c),
            (_, '\\') => match chars.next() {
                Some(next) => {
                    word.push(next);
                    in_word = true;
                }
                None => return Err("line ends with a lone backslash".into()),
            },
            (Some(_), c) => word.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            (None, c) => {
                word.push(c);
                in_word = true;
            }
        }
    }
    if let Some(q) = quote {
        return Err(format!("unterminated {q} quote"));
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

/// Parse one console line. Blank lines yield `None`; usage errors and help
/// output come back as `Err` with the text to show.
pub fn parse_line(line: &str) -> Result<Option<Command>, String> {
    let words = tokenize(line)?;
    if words.is_empty() {
        return Ok(None);
    }
    Line::try_parse_from(words)
        .map(|line| Some(line.command))
        .map_err(|e| e.render().to_string().trim_end().to_owned())
}
