#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # castview
//!
//! Command-line viewer for terminal sessions mirrored through a relay.
//!
//! ## Subcommands
//!
//! - `castview sessions [--all]` — list sessions
//! - `castview attach <session> [--pane <id>]` — mirror a session into this
//!   terminal and type into it (detach with the configured key, Ctrl-] by default)
//! - `castview create <machine> <name>` — start a session on a machine
//! - `castview kill <session>` — end a session
//! - `castview clear-offline` — drop offline sessions from the relay's list
//! - `castview cat <session> <path> [--output <file>]` — fetch a file
//!
//! All subcommands accept `--config <path>`; see [`castview::config`].

use std::collections::HashSet;
use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use castview::client::{self, ClientEvent, ClientHandle};
use castview::config::{Config, ConfigError};
use castview::connection::ConnectionState;
use castview::protocol::{FileContent, Session, SessionStatus};
use castview::sink::SinkKey;
use castview::term::{self, RawModeGuard, StdoutSink};
use castview::{auth, util};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a freshly opened connection gets to push its session list.
const LIST_TIMEOUT: Duration = Duration::from_secs(2);

/// Terminal session viewer.
#[derive(Parser)]
#[command(name = "castview", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List sessions known to the relay.
    Sessions {
        /// Include sessions listed in `view.hidden_sessions`.
        #[arg(long)]
        all: bool,
    },
    /// Mirror a session into this terminal and forward keystrokes to it.
    Attach {
        session: String,
        /// Pin one pane instead of following the focused one.
        #[arg(long)]
        pane: Option<String>,
    },
    /// Start a new session on a machine.
    Create { machine: String, name: String },
    /// End a session.
    Kill { session: String },
    /// Remove offline sessions from the relay's list.
    ClearOffline,
    /// Fetch a file from a session's machine.
    Cat {
        session: String,
        path: String,
        /// Write to this file instead of stdout (required for images).
        #[arg(long, short)]
        output: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("not signed in: set auth.token or CASTVIEW_TOKEN (an expired token counts as none)")]
    NotSignedIn,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("client stopped unexpectedly")]
    ClientGone,
    #[error("terminal error: {0}")]
    Terminal(#[from] nix::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("file content is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("{0} is binary ({1}); pass --output to save it")]
    BinaryContent(String, String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("castview: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("castview: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: &Config) -> Result<(), Error> {
    let mut connection = config.connection()?;
    connection.token = auth::usable_token(connection.token.as_deref()).map(str::to_string);
    let Some(token) = connection.token.as_deref() else {
        return Err(Error::NotSignedIn);
    };
    if let Ok(info) = auth::TokenInfo::inspect(token) {
        debug!("Signed in as {}", info.subject.as_deref().unwrap_or("unknown"));
    }

    let (handle, mut events, task) = client::spawn(connection);
    let result = dispatch(command, config, &handle, &mut events).await;
    handle.shutdown().await;
    let _ = task.await;
    result
}

async fn dispatch(
    command: Commands,
    config: &Config,
    handle: &ClientHandle,
    events: &mut UnboundedReceiver<ClientEvent>,
) -> Result<(), Error> {
    wait_connected(events).await?;
    match command {
        Commands::Sessions { all } => {
            let hidden = if all { HashSet::new() } else { config.hidden_sessions() };
            list(handle, events, &hidden).await
        }
        Commands::Attach { session, pane } => {
            attach(handle, events, &session, pane.as_deref(), config.detach_key()?).await
        }
        Commands::Create { machine, name } => create(handle, events, &machine, &name).await,
        Commands::Kill { session } => {
            handle.kill_session(&session);
            settle(events, |list| {
                !list
                    .iter()
                    .any(|s| s.id == session && s.status == SessionStatus::Online)
            })
            .await;
            Ok(())
        }
        Commands::ClearOffline => {
            handle.clear_offline_sessions();
            settle(events, |list| {
                list.iter().all(|s| s.status == SessionStatus::Online)
            })
            .await;
            Ok(())
        }
        Commands::Cat {
            session,
            path,
            output,
        } => cat(handle, events, &session, &path, output.as_deref()).await,
    }
}

/// Consume events until `pick` returns a value or `limit` elapses.
async fn wait_for<T>(
    events: &mut UnboundedReceiver<ClientEvent>,
    limit: Duration,
    what: &'static str,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> Result<T, Error> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => {
                if let Some(v) = pick(event) {
                    return Ok(v);
                }
            }
            Ok(None) => return Err(Error::ClientGone),
            Err(_) => return Err(Error::Timeout(what)),
        }
    }
}

async fn wait_connected(events: &mut UnboundedReceiver<ClientEvent>) -> Result<(), Error> {
    wait_for(events, CONNECT_TIMEOUT, "the relay connection", |event| match event {
        ClientEvent::StatusChanged(ConnectionState::Connected) => Some(()),
        ClientEvent::StatusChanged(state) => {
            debug!("Connection {state}");
            None
        }
        _ => None,
    })
    .await
}

/// Wait for a session list satisfying `done`. Requests like `kill` have no
/// direct reply, so a missing confirmation is reported but not fatal.
async fn settle(
    events: &mut UnboundedReceiver<ClientEvent>,
    mut done: impl FnMut(&[Session]) -> bool,
) {
    let confirmed = wait_for(events, REPLY_TIMEOUT, "the session list", |event| match event {
        ClientEvent::SessionsChanged(list) => done(&list).then_some(()),
        _ => None,
    })
    .await;
    if confirmed.is_err() {
        warn!("The relay has not confirmed the request yet");
    }
}

/// The session list as of now: the first pushed list, or whatever the client
/// holds when the relay sends nothing new (an empty list is not an update).
async fn current_sessions(
    handle: &ClientHandle,
    events: &mut UnboundedReceiver<ClientEvent>,
) -> Result<Vec<Session>, Error> {
    let pushed = wait_for(events, LIST_TIMEOUT, "the session list", |event| match event {
        ClientEvent::SessionsChanged(list) => Some(list),
        _ => None,
    })
    .await;
    match pushed {
        Ok(list) => Ok(list),
        Err(Error::Timeout(_)) => handle
            .status()
            .await
            .map(|s| s.sessions)
            .ok_or(Error::ClientGone),
        Err(e) => Err(e),
    }
}

async fn list(
    handle: &ClientHandle,
    events: &mut UnboundedReceiver<ClientEvent>,
    hidden: &HashSet<String>,
) -> Result<(), Error> {
    let sessions = current_sessions(handle, events).await?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{:<24} {:<20} {:<16} {:<8} PANES", "ID", "LABEL", "MACHINE", "STATUS")?;
    for s in sessions.iter().filter(|s| !hidden.contains(&s.id)) {
        writeln!(
            out,
            "{:<24} {:<20} {:<16} {:<8} {}",
            s.id,
            s.label,
            s.owner_machine_id,
            s.status.as_str(),
            s.pane_count()
        )?;
    }
    Ok(())
}

async fn create(
    handle: &ClientHandle,
    events: &mut UnboundedReceiver<ClientEvent>,
    machine: &str,
    name: &str,
) -> Result<(), Error> {
    handle.create_session(machine, name);
    let id = wait_for(events, REPLY_TIMEOUT, "the new session", |event| match event {
        ClientEvent::SessionsChanged(list) => list
            .into_iter()
            .find(|s| {
                s.label == name
                    && s.owner_machine_id == machine
                    && !s.id.starts_with(castview::registry::PENDING_PREFIX)
            })
            .map(|s| s.id),
        _ => None,
    })
    .await?;
    println!("{id}");
    Ok(())
}

async fn cat(
    handle: &ClientHandle,
    events: &mut UnboundedReceiver<ClientEvent>,
    session: &str,
    path: &str,
    output: Option<&str>,
) -> Result<(), Error> {
    handle.request_file_view(session, path);
    let view = wait_for(events, REPLY_TIMEOUT, "the file contents", |event| match event {
        ClientEvent::FileView(view) if view.path == path => Some(view),
        _ => None,
    })
    .await?;

    let bytes = match view.content {
        FileContent::Text(text) => text.into_bytes(),
        FileContent::Base64(data) => {
            if output.is_none() {
                return Err(Error::BinaryContent(view.filename, view.content_type));
            }
            STANDARD.decode(data.as_bytes())?
        }
    };
    match output {
        Some(file) => {
            let file = util::expand_tilde(file);
            std::fs::write(&*file, &bytes)?;
            info!("Wrote {} bytes to {file}", bytes.len());
        }
        None => std::io::stdout().lock().write_all(&bytes)?,
    }
    Ok(())
}

/// Interactive mirror. Returns when the detach key is pressed, stdin closes,
/// or the client stops.
async fn attach(
    handle: &ClientHandle,
    events: &mut UnboundedReceiver<ClientEvent>,
    session: &str,
    pinned_pane: Option<&str>,
    detach_key: u8,
) -> Result<(), Error> {
    let sessions = current_sessions(handle, events).await?;
    if !sessions.iter().any(|s| s.id == session) {
        warn!("Session {session} is not in the relay's list; attaching anyway");
    }

    handle.mount_sink(SinkKey::session(session), Box::new(StdoutSink));
    handle.join_session(session);

    let mut pane = match pinned_pane {
        Some(p) => Some(p.to_string()),
        None => handle.status().await.and_then(|s| s.focused_pane),
    };
    if let Some(p) = pinned_pane {
        handle.select_pane(Some(p));
    }
    if let Some(p) = pane.as_deref() {
        handle.mount_sink(SinkKey::pane(session, p), Box::new(StdoutSink));
    }

    let raw_mode = RawModeGuard::enable()?;
    let mut winch = signal(SignalKind::window_change())?;
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    let mut decoder = term::Utf8Stream::default();

    let send_size = |pane: Option<&str>| match term::window_size() {
        Ok((cols, rows)) => handle.send_resize(session, cols, rows, pane),
        Err(e) => debug!("Failed to read window size: {e}"),
    };
    send_size(pane.as_deref());

    loop {
        tokio::select! {
            read = stdin.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                let input = &buf[..n];
                let (keys, detach) = match input.iter().position(|&b| b == detach_key) {
                    Some(at) => (&input[..at], true),
                    None => (input, false),
                };
                let keys = decoder.decode(keys);
                if !keys.is_empty() {
                    handle.send_keys(session, &keys, pane.as_deref());
                }
                if detach {
                    break;
                }
            }
            _ = winch.recv() => send_size(pane.as_deref()),
            event = events.recv() => match event {
                Some(ClientEvent::LayoutChanged { session: changed, .. })
                    if changed == session && pinned_pane.is_none() =>
                {
                    let focused = handle.status().await.and_then(|s| s.focused_pane);
                    if focused != pane {
                        if let Some(old) = pane.take() {
                            handle.unmount_sink(SinkKey::pane(session, old));
                        }
                        if let Some(new) = focused.as_deref() {
                            handle.mount_sink(SinkKey::pane(session, new), Box::new(StdoutSink));
                        }
                        pane = focused;
                        send_size(pane.as_deref());
                    }
                }
                Some(ClientEvent::StatusChanged(state)) => debug!("Connection {state}"),
                Some(_) => {}
                None => break,
            },
        }
    }

    drop(raw_mode);
    eprint!("\r\n[detached from {session}]\r\n");
    Ok(())
}
