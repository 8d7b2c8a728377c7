use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use block_core::economy::Wallet;
use block_core::engine::RunReport;
use block_core::grid::{Pose, TurnDirection};
use block_core::hint::ErrorAnalysis;
use block_core::io::catalog::Catalog;
use block_core::program::parse_slot_id;
use block_core::puzzle::builtin_levels;
use block_core::store::Progress;
use block_core::{BlockTemplate, Config, EventBus, Instruction, PuzzleCommand, PuzzleLevel, RunSummary, Session, Slot};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "blockd", about = "Block-coding session daemon streaming typed events over WebSocket")]
struct Args {
    /// Runtime configuration JSON.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Level catalog JSON; the built-in catalog when omitted.
    #[arg(long, value_name = "PATH")]
    levels: Option<PathBuf>,

    /// Directory for persisted progress, overriding the config file.
    #[arg(long = "state-dir", value_name = "PATH")]
    state_dir: Option<PathBuf>,

    /// Address to bind (defaults to 127.0.0.1).
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on for WebSocket clients.
    #[arg(long, default_value_t = 8788)]
    port: u16,
}

/// A palette pick sent by the client.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum BlockChoice {
    Move,
    Turn { direction: TurnDirection },
    Loop { count: Option<u32> },
}

impl BlockChoice {
    fn template(&self) -> BlockTemplate {
        let instruction = match self {
            BlockChoice::Move => Instruction::Move,
            BlockChoice::Turn { direction } => Instruction::Turn(*direction),
            BlockChoice::Loop { count } => Instruction::repeat_move(*count),
        };
        BlockTemplate::new(instruction)
    }
}

/// Slot addressed either by index or by its `slot-N` element id.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum SlotRef {
    Index(usize),
    Id(String),
}

impl SlotRef {
    fn index(&self) -> Option<usize> {
        match self {
            SlotRef::Index(index) => Some(*index),
            SlotRef::Id(id) => parse_slot_id(id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
enum Command {
    State,
    Assign { slot: SlotRef, block: BlockChoice },
    Clear { slot: SlotRef },
    ClearAll,
    Run,
    Puzzle { level: u32, commands: Vec<PuzzleCommand> },
    SelectLevel { level: u32 },
    Hint,
    Tutorial,
    Diagnose,
    ExportProgress,
    ImportProgress { json: String },
    ResetProgress,
}

/// Direct answers to one client, alongside the shared event stream.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Snapshot {
        level: u32,
        blocks: Vec<Slot>,
        character: Pose,
        progress: Progress,
        coins: u64,
    },
    RunSummary(RunSummary),
    PuzzleReport(RunReport),
    Analysis(ErrorAnalysis),
    Progress { json: String },
    Imported { ok: bool },
    Busy { reason: String },
    Error { reason: String },
}

type SharedSession = Arc<Mutex<Session<Wallet>>>;

#[derive(Clone)]
struct AppState {
    session: SharedSession,
    bus: EventBus,
    puzzles: Arc<Vec<PuzzleLevel>>,
    puzzle_time_limit: Option<Duration>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    if let Some(dir) = &args.state_dir {
        config.state_dir = Some(dir.clone());
    }
    Ok(config)
}

fn build_state(config: &Config, catalog: Catalog) -> Result<AppState> {
    let session = Session::offline(config, catalog, config.kv_store(), Wallet::new());
    let bus = session.bus().clone();
    Ok(AppState {
        session: Arc::new(Mutex::new(session)),
        bus,
        puzzles: Arc::new(builtin_levels()?),
        puzzle_time_limit: config.puzzle_time_limit,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let catalog = match &args.levels {
        Some(path) => Catalog::load_from_path(path)?,
        None => Catalog::builtin()?,
    };
    info!(levels = catalog.len(), state_dir = ?config.state_dir, "catalog loaded");
    let state = build_state(&config, catalog)?;

    let app = Router::new()
        .route("/stream", get(ws_handler))
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", args.bind, args.port))?;

    info!(%addr, "starting blockd");
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app.into_make_service())
        .await
        .context("server error")?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("websocket client connected");
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Reply>(32);
    let mut events = state.bus.subscribe();

    let outbound = async move {
        loop {
            let encoded = tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => serde_json::to_string(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket client lagged behind the event stream");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => serde_json::to_string(&reply),
                    None => break,
                },
            };
            let text = match encoded {
                Ok(text) => text,
                Err(err) => {
                    warn!(%err, "failed to encode outbound message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                info!("websocket closed (send failed)");
                break;
            }
        }
    };

    let inbound = async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<Command>(&text) {
                    Ok(command) => {
                        debug!(?command, "command received");
                        execute(&state, command, &reply_tx).await;
                    }
                    Err(err) => {
                        warn!(%err, "failed to parse command");
                        send(&reply_tx, Reply::Error { reason: err.to_string() }).await;
                    }
                },
                Ok(Message::Close(_)) => {
                    info!("websocket closed by client");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    error!(%err, "websocket error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = outbound => {},
        _ = inbound => {},
    }
}

async fn send(replies: &mpsc::Sender<Reply>, reply: Reply) {
    if replies.send(reply).await.is_err() {
        debug!("reply dropped; client gone");
    }
}

fn busy() -> Reply {
    Reply::Busy {
        reason: "a run is already in progress".to_string(),
    }
}

/// Apply one client command. Runs continue on their own task so the client
/// can keep talking; anything arriving meanwhile is answered with `busy`.
async fn execute(state: &AppState, command: Command, replies: &mpsc::Sender<Reply>) {
    let Ok(mut session) = Arc::clone(&state.session).try_lock_owned() else {
        send(replies, busy()).await;
        return;
    };

    match command {
        Command::State => {
            let reply = Reply::Snapshot {
                level: session.level().id,
                blocks: session.store().blocks().to_vec(),
                character: session.store().character(),
                progress: session.store().progress().clone(),
                coins: session.coins().balance(),
            };
            send(replies, reply).await;
        }
        Command::Assign { slot, block } => match slot.index() {
            Some(index) => {
                session.assign(index, block.template());
            }
            None => debug!(?slot, "ignoring assignment to invalid slot"),
        },
        Command::Clear { slot } => match slot.index() {
            Some(index) => session.clear(index),
            None => debug!(?slot, "ignoring clear of invalid slot"),
        },
        Command::ClearAll => session.clear_all(),
        Command::SelectLevel { level } => {
            session.select_level(level);
        }
        Command::Run => {
            let replies = replies.clone();
            tokio::spawn(async move {
                if let Ok(summary) = session.run().await {
                    send(&replies, Reply::RunSummary(summary)).await;
                }
            });
        }
        Command::Puzzle { level, commands } => {
            let Some(puzzle) = state.puzzles.iter().find(|puzzle| puzzle.id == level).cloned() else {
                send(replies, Reply::Error { reason: format!("no puzzle level {level}") }).await;
                return;
            };
            let replies = replies.clone();
            let time_limit = state.puzzle_time_limit;
            tokio::spawn(async move {
                if let Ok(report) = session.run_puzzle(&puzzle, &commands, time_limit).await {
                    send(&replies, Reply::PuzzleReport(report)).await;
                }
            });
        }
        Command::Hint => {
            session.hint().await;
        }
        Command::Tutorial => {
            session.tutorial().await;
        }
        Command::Diagnose => {
            let analysis = session.diagnose().await;
            send(replies, Reply::Analysis(analysis)).await;
        }
        Command::ExportProgress => match session.store().export_progress() {
            Ok(json) => send(replies, Reply::Progress { json }).await,
            Err(err) => send(replies, Reply::Error { reason: err.to_string() }).await,
        },
        Command::ImportProgress { json } => {
            let ok = session.store_mut().import_progress(&json);
            send(replies, Reply::Imported { ok }).await;
        }
        Command::ResetProgress => session.store_mut().reset_progress(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_core::program::MAX_LOOP_COUNT;
    use block_core::{Event, Pacing};
    use clap::error::ErrorKind;

    fn state() -> AppState {
        let config = Config {
            pacing: Pacing::instant(),
            id_seed: Some(3),
            ..Config::default()
        };
        build_state(&config, Catalog::builtin().expect("catalog")).expect("state")
    }

    fn parse(json: &str) -> Command {
        serde_json::from_str(json).expect("command parses")
    }

    #[test]
    fn default_port_and_bind() {
        let args = Args::try_parse_from(["blockd"]).expect("args parse");
        assert_eq!(args.port, 8788);
        assert_eq!(args.bind, "127.0.0.1");
        let err = Args::try_parse_from(["blockd", "--port", "http"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn state_dir_flag_overrides_config() {
        let args = Args::try_parse_from(["blockd", "--state-dir", "/tmp/blockd"]).expect("args parse");
        let config = load_config(&args).expect("config");
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/blockd")));
    }

    #[test]
    fn commands_parse() {
        assert_eq!(
            parse(r#"{"cmd": "assign", "slot": "slot-2", "block": {"type": "turn", "direction": "left"}}"#),
            Command::Assign {
                slot: SlotRef::Id("slot-2".to_string()),
                block: BlockChoice::Turn {
                    direction: TurnDirection::Left
                },
            }
        );
        assert_eq!(parse(r#"{"cmd": "clearAll"}"#), Command::ClearAll);
        assert_eq!(parse(r#"{"cmd": "tutorial"}"#), Command::Tutorial);
        assert_eq!(
            parse(r#"{"cmd": "clear", "slot": "slot-3"}"#),
            Command::Clear {
                slot: SlotRef::Id("slot-3".to_string())
            }
        );
        assert_eq!(
            parse(r#"{"cmd": "clear", "slot": 1}"#),
            Command::Clear { slot: SlotRef::Index(1) }
        );
        assert_eq!(parse(r#"{"cmd": "selectLevel", "level": 3}"#), Command::SelectLevel { level: 3 });
        assert_eq!(
            parse(r#"{"cmd": "puzzle", "level": 1, "commands": ["down", "wait"]}"#),
            Command::Puzzle {
                level: 1,
                commands: vec![PuzzleCommand::Down, PuzzleCommand::Wait]
            }
        );
        assert!(serde_json::from_str::<Command>(r#"{"cmd": "fly"}"#).is_err());
    }

    #[test]
    fn slot_refs_resolve() {
        assert_eq!(SlotRef::Index(4).index(), Some(4));
        assert_eq!(SlotRef::Id("slot-1".to_string()).index(), Some(1));
        assert_eq!(SlotRef::Id("slot--1".to_string()).index(), None);
    }

    #[tokio::test]
    async fn run_command_replies_with_summary() {
        let state = state();
        let mut events = state.bus.subscribe();
        let (tx, mut rx) = mpsc::channel(8);
        for slot in ["slot-0", "slot-1"] {
            let command = Command::Assign {
                slot: SlotRef::Id(slot.to_string()),
                block: BlockChoice::Move,
            };
            execute(&state, command, &tx).await;
        }
        execute(&state, Command::Run, &tx).await;

        let Some(Reply::RunSummary(summary)) = rx.recv().await else {
            panic!("expected a run summary");
        };
        assert!(summary.report.outcome.is_success());
        assert_eq!(summary.advanced_to, Some(2));

        let mut saw_coins = false;
        while let Ok(event) = events.try_recv() {
            saw_coins |= matches!(event, Event::CoinsEarned { amount: 5 });
        }
        assert!(saw_coins);
    }

    #[tokio::test]
    async fn huge_loop_from_a_client_is_capped() {
        let state = state();
        let (tx, mut rx) = mpsc::channel(8);
        let command = parse(r#"{"cmd": "assign", "slot": 0, "block": {"type": "loop", "count": 4294967295}}"#);
        execute(&state, command, &tx).await;
        execute(&state, Command::Run, &tx).await;

        let Some(Reply::RunSummary(summary)) = rx.recv().await else {
            panic!("expected a run summary");
        };
        assert_eq!(summary.report.steps, MAX_LOOP_COUNT as usize);
    }

    #[tokio::test]
    async fn clear_accepts_slot_ids() {
        let state = state();
        let (tx, _rx) = mpsc::channel(8);
        for slot in ["slot-0", "slot-1"] {
            let command = Command::Assign {
                slot: SlotRef::Id(slot.to_string()),
                block: BlockChoice::Move,
            };
            execute(&state, command, &tx).await;
        }
        execute(&state, parse(r#"{"cmd": "clear", "slot": "slot-1"}"#), &tx).await;
        execute(&state, parse(r#"{"cmd": "clear", "slot": "slot-x"}"#), &tx).await;

        let session = state.session.lock().await;
        let blocks = session.store().blocks();
        assert!(blocks[0].is_some());
        assert!(blocks[1].is_none());
    }

    #[tokio::test]
    async fn commands_during_a_run_are_busy() {
        let state = state();
        let (tx, mut rx) = mpsc::channel(8);
        let guard = state.session.lock().await;
        execute(&state, Command::Hint, &tx).await;
        assert!(matches!(rx.recv().await, Some(Reply::Busy { .. })));
        drop(guard);

        execute(&state, Command::ExportProgress, &tx).await;
        let Some(Reply::Progress { json }) = rx.recv().await else {
            panic!("expected exported progress");
        };
        assert!(json.contains("\"currentLevel\""));
    }
}
