use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use haven_core::auth::{HttpTokenProvider, StaticToken};
use haven_core::{
    ChatMode, ChatSession, ConnectionStatus, ConnectionTracker, HavenError, Message, Sender,
    SessionConfig, SessionEvent, SettingsStore, WsConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "haven")]
#[command(about = "Terminal client for Haven chat rooms")]
struct Cli {
    /// Settings directory (defaults to the platform config dir)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Join a room and chat from stdin
    Chat {
        /// Socket base URL, e.g. wss://chat.example.com/ws
        #[arg(long)]
        server: Url,

        /// Room to join
        #[arg(long)]
        room: String,

        /// Local user id
        #[arg(long)]
        user: String,

        /// Bearer token for the socket
        #[arg(long, conflicts_with = "token_url")]
        token: Option<String>,

        /// Endpoint answering {"token": "..."}
        #[arg(long)]
        token_url: Option<String>,

        /// "assistant" or "peer"
        #[arg(long, default_value = "assistant", value_parser = parse_mode)]
        mode: ChatMode,
    },

    /// Show or change stored preferences
    Settings {
        #[arg(long)]
        display_name: Option<String>,

        #[arg(long)]
        mic_on_join: Option<bool>,

        #[arg(long)]
        camera_on_join: Option<bool>,
    },
}

fn parse_mode(s: &str) -> Result<ChatMode, String> {
    match s {
        "assistant" => Ok(ChatMode::Assistant),
        "peer" => Ok(ChatMode::Peer),
        other => Err(format!("unknown mode {other:?}, expected assistant or peer")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("haven_core=info,haven=info")),
        )
        .init();

    let cli = Cli::parse();
    let config_dir = cli
        .config_dir
        .or_else(|| dirs::config_dir().map(|d| d.join("haven")))
        .unwrap_or_else(|| PathBuf::from(".haven"));
    let settings = SettingsStore::new(config_dir);

    let result = match cli.cmd {
        Command::Chat {
            server,
            room,
            user,
            token,
            token_url,
            mode,
        } => chat(&settings, server, &room, &user, token, token_url, mode).await,
        Command::Settings {
            display_name,
            mic_on_join,
            camera_on_join,
        } => {
            update_settings(&settings, display_name, mic_on_join, camera_on_join);
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

async fn chat(
    settings: &SettingsStore,
    server: Url,
    room: &str,
    user: &str,
    token: Option<String>,
    token_url: Option<String>,
    mode: ChatMode,
) -> Result<(), HavenError> {
    let settings = settings.get();
    let tracker = ConnectionTracker::new(settings.transport.max_concurrent_connections);
    let config = SessionConfig::new(server).with_settings(settings);
    let session = ChatSession::new(config, user, mode, WsConnector, tracker);

    let printer = tokio::spawn(print_events(session.subscribe()));

    match (token, token_url) {
        (_, Some(endpoint)) => {
            let provider = HttpTokenProvider::new(endpoint).for_user(user);
            session.connect(room, &provider).await?;
        }
        (token, None) => {
            session.connect(room, &StaticToken::new(token.unwrap_or_default())).await?;
        }
    }

    eprintln!("joined {room}; /retry reconnects, /quit leaves");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("stdin read failed: {e}");
                break;
            }
        };
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/retry" => session.retry()?,
            "/history" => {
                for message in session.messages().await {
                    print_message(&message);
                }
            }
            text => {
                if let Err(e) = session.send_message(text).await {
                    eprintln!("not sent: {e}");
                } else if session.connection_state().status != ConnectionStatus::Open {
                    eprintln!("(queued, {} waiting)", session.outbox_size().await);
                }
            }
        }
    }

    session.shutdown().await;
    printer.abort();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::MessageReceived(message)) if message.sender == Sender::Ai => {
                print_message(&message);
            }
            Ok(SessionEvent::ConnectionStateChanged(state)) => {
                eprintln!("[{:?}]", state.status);
            }
            Ok(SessionEvent::Typing { user_id, is_typing: true }) => {
                eprintln!("{user_id} is typing...");
            }
            Ok(SessionEvent::Disconnected { attempts }) => {
                eprintln!("disconnected after {attempts} attempts; type /retry");
            }
            Ok(SessionEvent::Error(e)) => eprintln!("error: {e}"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("missed {n} session events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_message(message: &Message) {
    let who = match message.sender {
        Sender::User => "you",
        Sender::Ai => "them",
    };
    println!("{} {who}: {}", message.timestamp.format("%H:%M"), message.content);
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

fn update_settings(
    settings: &SettingsStore,
    display_name: Option<String>,
    mic_on_join: Option<bool>,
    camera_on_join: Option<bool>,
) {
    if let Some(name) = display_name {
        settings.set_display_name(Some(name).filter(|n| !n.is_empty()));
    }
    if let Some(enabled) = mic_on_join {
        settings.set_mic_enabled_on_join(enabled);
    }
    if let Some(enabled) = camera_on_join {
        settings.set_camera_enabled_on_join(enabled);
    }
    match serde_json::to_string_pretty(&settings.get()) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("error: {e}"),
    }
}
