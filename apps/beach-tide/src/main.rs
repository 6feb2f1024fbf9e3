use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use beach_tide::engine::SyncEngine;
use beach_tide::telemetry::{self, LogConfig, LogLevel};
use beach_tide::{BufferSource, CommandMode, SendOutcome, SyncConfig, SyncEvent, metrics};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "beach-tide", about = "Keep Beach sessions in sync from the terminal")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    #[arg(long, env = "BEACH_TIDE_SERVER")]
    server: Option<String>,

    #[arg(long, env = "BEACH_TIDE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, env = "BEACH_TIDE_PROFILE")]
    profile: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List sessions known to the server.
    Sessions,
    /// Print the current output tail of a session.
    Tail {
        session: String,
        #[arg(long, default_value_t = 200)]
        lines: usize,
    },
    /// Follow sessions live. Stdin lines are sent to the first session:
    /// `!cmd` runs in the shell, `:resync` refetches output, `:flush`
    /// retries failed commands, anything else goes to the assistant.
    Watch {
        #[arg(required = true)]
        sessions: Vec<String>,
        /// Report when output contains this text (repeatable).
        #[arg(long = "alert")]
        alerts: Vec<String>,
        #[arg(long, help = "Print prometheus metrics on exit")]
        metrics: bool,
    },
    /// Show or flush the persisted command queue of a session.
    Queue {
        session: String,
        #[arg(long)]
        flush: bool,
        #[arg(long, requires = "flush")]
        include_failed: bool,
    },
}

impl ConnectionArgs {
    fn resolve(&self) -> Result<SyncConfig> {
        let mut config = SyncConfig::from_env().context("reading BEACH_TIDE_* environment")?;
        if let Some(server) = &self.server {
            let overridden = SyncConfig::new(server).context("parsing --server")?;
            config.server = overridden.server;
        }
        if let Some(token) = &self.token {
            config = config.with_token(Some(token.clone()));
        }
        if let Some(profile) = &self.profile {
            config = config.with_profile(profile.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let config = cli.connection.resolve()?;
    info!(
        target = "beach_tide::engine",
        server = %config.server,
        profile = %config.profile,
        "starting beach-tide"
    );
    let engine = SyncEngine::connect(config)?;

    match cli.command {
        Command::Sessions => {
            engine.set_online(true);
            for session in engine.refresh_directory().await? {
                match session.created_at {
                    Some(created) => println!("{}\t{created}", session.id),
                    None => println!("{}", session.id),
                }
            }
        }
        Command::Tail { session, lines } => {
            engine.set_online(true);
            print!("{}", engine.fetch_tail(&session, lines).await?);
        }
        Command::Queue {
            session,
            flush,
            include_failed,
        } => {
            if flush {
                engine.set_online(true);
                let report = engine.flush(&session, include_failed).await?;
                println!("sent {}, failed {}", report.sent.len(), report.failed.len());
            }
            for item in engine.queued(&session) {
                println!(
                    "{}\t{:?}\t{:?}\t{}\t{}",
                    item.id,
                    item.status,
                    item.mode,
                    item.command,
                    item.last_error.as_deref().unwrap_or("")
                );
            }
        }
        Command::Watch {
            sessions,
            alerts,
            metrics: print_metrics,
        } => {
            watch(&engine, &sessions, &alerts).await?;
            if print_metrics {
                eprint!("{}", metrics::render());
            }
        }
    }

    engine.shutdown();
    Ok(())
}

async fn watch(engine: &SyncEngine, sessions: &[String], alerts: &[String]) -> Result<()> {
    let Some(primary) = sessions.first().cloned() else {
        bail!("no session given");
    };
    for pattern in alerts {
        engine.add_watch(None, pattern, true);
    }
    let mut events = engine.subscribe();
    engine.start();
    engine.set_open_sessions(sessions.iter().cloned());
    engine.set_online(true);

    let mut printed: HashMap<String, usize> = HashMap::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => render(engine, &mut printed, event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "display lagged behind events"),
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => handle_input(engine, &primary, line.trim()).await,
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn render(engine: &SyncEngine, printed: &mut HashMap<String, usize>, event: SyncEvent) {
    match event {
        SyncEvent::BufferUpdated {
            session, source, ..
        } => {
            let Some(text) = engine.buffer(&session) else {
                return;
            };
            let seen = printed.entry(session.clone()).or_insert(0);
            let appended = source == BufferSource::Delta && *seen <= text.len();
            if appended {
                print!("{}", text.get(*seen..).unwrap_or_default());
            } else {
                println!("\n--- {session} ({source:?}) ---");
                print!("{text}");
            }
            *seen = text.len();
        }
        SyncEvent::StateChanged { session, state } => {
            eprintln!("[{session}] {state} ({:?})", engine.status(&session));
        }
        SyncEvent::SessionClosed { session, reason } => {
            eprintln!(
                "[{session}] closed by server{}",
                reason.map(|r| format!(": {r}")).unwrap_or_default()
            );
        }
        SyncEvent::CommandFailed { session, error, .. } => {
            eprintln!("[{session}] command failed: {error}");
        }
        SyncEvent::WatchMatched { session, pattern, .. } => {
            eprintln!("[{session}] alert: {pattern}");
        }
        SyncEvent::CommandSent { .. } => {}
    }
}

async fn handle_input(engine: &SyncEngine, session: &str, line: &str) {
    if line.is_empty() {
        return;
    }
    let result = match line {
        ":resync" => engine.resync(session).await.map(|_| ()),
        ":flush" => engine.flush(session, true).await.map(|_| ()),
        _ => {
            let (mode, command) = match line.strip_prefix('!') {
                Some(command) => (CommandMode::Shell, command),
                None => (CommandMode::Ai, line),
            };
            match engine.send_command(session, command, mode).await {
                Ok(SendOutcome::Queued) => {
                    eprintln!("[{session}] queued");
                    Ok(())
                }
                Ok(SendOutcome::Dropped) => {
                    eprintln!("[{session}] queue full; command dropped before sending");
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            }
        }
    };
    if let Err(err) = result {
        eprintln!("[{session}] {err}");
    }
}
