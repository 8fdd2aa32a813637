use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use room_client::{
    load_settings, ChannelSession, SendOutcome, SessionConfig, SessionError, WsTransport,
};
use shared::domain::{MessageId, Participant, RoomId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{
    wrappers::{BroadcastStream, LinesStream},
    StreamExt,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod terminal;

use terminal::Screen;

#[derive(Parser, Debug)]
#[command(about = "Join a chat room from the terminal")]
struct Args {
    /// Channel endpoint, e.g. ws://127.0.0.1:4000/socket
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    room: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    user_name: Option<String>,
    /// Settings file. Defaults to <config dir>/room_chat/client.toml.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Text(String),
    File(PathBuf),
    Delete(MessageId),
    Retry(u64),
    Discard(u64),
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Text(line.to_string())));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let seq = |arg: &str| {
        arg.trim_start_matches('#')
            .parse::<u64>()
            .map_err(|_| format!("/{name} expects a local message number, got `{arg}`"))
    };
    let command = match (name, arg) {
        ("quit", _) => Command::Quit,
        ("file", "") | ("delete", "") | ("retry", "") | ("discard", "") => {
            return Err(format!("/{name} needs an argument"))
        }
        ("file", path) => Command::File(PathBuf::from(path)),
        ("delete", id) => Command::Delete(MessageId::from(id)),
        ("retry", arg) => Command::Retry(seq(arg)?),
        ("discard", arg) => Command::Discard(seq(arg)?),
        _ => return Err(format!("unknown command /{name}")),
    };
    Ok(Some(command))
}

fn default_config_path() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("room_chat").join("client.toml");
    path.exists().then_some(path)
}

async fn run_command(
    session: &Arc<ChannelSession>,
    screen: &Screen,
    command: Command,
) -> Result<(), SessionError> {
    match command {
        Command::Text(text) => watch(session.send_text(text).await?),
        Command::File(path) => watch(session.send_file(path).await?),
        Command::Delete(message_id) => match session.delete(message_id).await {
            Ok(pending) => {
                tokio::spawn(async move {
                    if let Err(rejected) = pending.outcome().await {
                        warn!("{rejected}");
                    }
                });
            }
            Err(rejected) => eprintln!("{rejected}"),
        },
        Command::Retry(seq) => match screen.local_ref(seq) {
            Some(local_ref) => watch(session.retry(local_ref).await?),
            None => eprintln!("no local message #{seq}"),
        },
        Command::Discard(seq) => match screen.local_ref(seq) {
            Some(local_ref) => {
                session.discard(local_ref).await?;
            }
            None => eprintln!("no local message #{seq}"),
        },
        Command::Quit => {}
    }
    Ok(())
}

fn watch(pending: room_client::PendingSend) {
    let local_ref = pending.local_ref();
    tokio::spawn(async move {
        if let SendOutcome::Failed(failure) = pending.outcome().await {
            let seq = local_ref.seq;
            eprintln!("message {local_ref} failed: {failure} (/retry {seq} or /discard {seq})");
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let config_path = args.config.clone().or_else(default_config_path);
    let mut settings = load_settings(config_path.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let transport = WsTransport::connect(&settings.server_url, settings.event_buffer)
        .await
        .context("failed to reach chat server")?;
    let participant = Participant::new(
        args.user_id.as_str(),
        args.user_name.unwrap_or_else(|| args.user_id.clone()),
    );
    let session = ChannelSession::new(
        RoomId::from(args.room),
        participant.clone(),
        Arc::new(transport),
        SessionConfig::from(&settings),
    );

    let mut screen = Screen::new(participant.user_id, settings.scroll_follow_threshold_px);
    let mut events = BroadcastStream::new(session.subscribe_events());
    session
        .join()
        .await
        .with_context(|| format!("failed to join room {}", session.room_id()))?;
    info!(room_id = %session.room_id(), "joined; type a message, /file <path>, /delete <id>, /retry <n>, /discard <n>, /quit");

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    loop {
        tokio::select! {
            line = lines.next() => {
                let line = match line {
                    Some(line) => line.context("failed to read stdin")?,
                    None => break,
                };
                match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(err) = run_command(&session, &screen, command).await {
                            eprintln!("{err}");
                        }
                    }
                    Ok(None) => {}
                    Err(usage) => eprintln!("{usage}"),
                }
            }
            event = events.next() => match event {
                Some(Ok(event)) => {
                    if !screen.on_event(event) {
                        break;
                    }
                }
                Some(Err(lagged)) => warn!("event stream lagged: {lagged}"),
                None => break,
            }
        }
    }

    session.leave().await;
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
