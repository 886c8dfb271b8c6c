use anyhow::Result;
use nats_session::{Credentials, RecentsStore, Session};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Builder,
    signal,
};
use tracing::*;

mod console;
mod render;
mod repl;
mod setup;

use setup::{
    cli::{self, Parser},
    trace,
};
use console::{Console, Reply};
use repl::Command;

fn main() -> Result<()> {
    // .env first so its values act as env fallbacks for the flags
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.console_log, &config.log_format)?;
    debug!(?config, log_format = %trace_config.log_frmt, "logging initialized");
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    // one logical thread: commands, deliveries and the poller interleave cooperatively
    let rt = Builder::new_current_thread().enable_all().build()?;
    rt.block_on(start(config))
}

async fn start(config: cli::Config) -> Result<()> {
    let console_config = config.console_config()?;
    debug!(
        ?console_config,
        path = ?console_config.path,
        "console config loaded"
    );

    let credentials = Credentials::load(&console_config.auth).await?;
    let recents = match config.state_path() {
        Some(path) => RecentsStore::load(path, console_config.recents),
        None => RecentsStore::ephemeral(console_config.recents),
    };

    let (session, mut events) = Session::new(console_config);
    let mut console = Console::new(session, recents, credentials);

    if config.connect {
        show(console.execute(connect_default()).await);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                match repl::parse_line(&line) {
                    Ok(Some(command)) => match console.execute(command).await {
                        Reply::Quit => break,
                        reply => show(reply),
                    },
                    Ok(None) => {}
                    Err(usage) => println!("{usage}"),
                }
            }
            Some(event) = events.recv() => {
                if let Some(line) = console.handle_event(event) {
                    println!("{line}");
                }
            }
            _ = signal::ctrl_c() => {
                debug!("interrupted");
                break;
            }
        }
    }

    console.shutdown().await;
    info!("exiting");
    Ok(())
}

fn connect_default() -> Command {
    Command::Connect {
        url: None,
        token: None,
        user: None,
        password: None,
        creds: None,
    }
}

fn show(reply: Reply) {
    if let Reply::Text(text) = reply {
        println!("{text}");
    }
}
