//! console startup configs: flags and logging

pub mod cli {
    //! Parse from either cli or env var

    use std::path::PathBuf;

    use anyhow::{Context, Result};
    pub use clap::Parser;
    use config::ConsoleConfig;

    /// default log level. Can use this argument or CONSOLE_LOG env var
    pub const DEFAULT_CONSOLE_LOG: &str = "warn";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";
    /// state file location below the user's config dir
    pub const STATE_DIR: &str = "nats-console";
    pub const STATE_FILE: &str = "state.json";

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "nats-console", bin_name = "nats-console", about, long_about = None)]
    /// interactive NATS admin console. Loads `.env` from the working dir as well
    pub struct Config {
        /// path to the console config (yaml or json) [default: built-in defaults]
        #[clap(short, long, value_parser, env = "CONSOLE_CONFIG")]
        pub config_path: Option<PathBuf>,
        /// server url, replaces the configured server list
        #[clap(short, long, value_parser, env = "NATS_URL")]
        pub server: Option<String>,
        /// path to a .creds file
        #[clap(long, value_parser, env = "NATS_CREDS")]
        pub creds: Option<PathBuf>,
        /// auth token
        #[clap(long, value_parser, env = "NATS_TOKEN", hide_env_values = true)]
        pub token: Option<String>,
        /// user name, used together with --password
        #[clap(long, value_parser, env = "NATS_USER")]
        pub user: Option<String>,
        #[clap(long, value_parser, env = "NATS_PASSWORD", hide_env_values = true)]
        pub password: Option<String>,
        /// where recent servers and subjects are kept [default: <config dir>/nats-console/state.json]
        #[clap(long, value_parser, env = "CONSOLE_STATE_PATH")]
        pub state_path: Option<PathBuf>,
        /// do not read or write the state file
        #[clap(long)]
        pub no_state: bool,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_CONSOLE_LOG)]
        pub console_log: String,
        /// log format: standard, json or pretty
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
        /// connect at startup
        #[clap(long)]
        pub connect: bool,
    }

    impl Config {
        /// Load the config file (if any) and apply flag overrides.
        pub fn console_config(&self) -> Result<ConsoleConfig> {
            let mut cfg = match &self.config_path {
                Some(path) => ConsoleConfig::parse(path)
                    .with_context(|| format!("failed to load config {}", path.display()))?,
                None => ConsoleConfig::default(),
            };
            if let Some(server) = &self.server {
                cfg = cfg.with_server(server.clone());
            }
            if self.creds.is_some() {
                cfg.auth.creds_file = self.creds.clone();
            }
            if self.token.is_some() {
                cfg.auth.token = self.token.clone();
            }
            if self.user.is_some() {
                cfg.auth.username = self.user.clone();
                cfg.auth.password = self.password.clone();
            }
            Ok(cfg)
        }

        /// State file path, if state is kept at all.
        pub fn state_path(&self) -> Option<PathBuf> {
            if self.no_state {
                return None;
            }
            self.state_path
                .clone()
                .or_else(|| dirs::config_dir().map(|dir| dir.join(STATE_DIR).join(STATE_FILE)))
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Logging configuration. Logs go to stderr so they never interleave
    /// with console output on stdout.
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(console_log: &str, log_frmt: &str) -> Result<Self> {
            // Log level comes from CONSOLE_LOG
            let filter = EnvFilter::try_new(console_log).or_else(|_| EnvFilter::try_new("warn"))?;

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json().with_writer(std::io::stderr))
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new())
                                .with_writer(std::io::stderr),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().with_writer(std::io::stderr))
                        .init();
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}
