use std::sync::Arc;

use boardsync::{
    BoardSession, ConnectionState, Edit, ErrorCode, EventKind, LocalUser, OperationKind,
    ResourceKind, SessionDeps, SessionKey, Subscription, SyncConfig, SyncError,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const CONNECT_WAIT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("edit rejected: {0}")]
    Rejected(String),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "boardsync", about = "Board sync engine client")]
struct Cli {
    #[arg(long, env = "BOARDSYNC_BASE_URL", default_value = boardsync::config::DEFAULT_BASE_URL)]
    base_url: String,

    /// Credential for the board socket and the persistence API.
    #[arg(long, env = "BOARDSYNC_TOKEN")]
    token: String,

    #[arg(long, env = "BOARDSYNC_USER_ID")]
    user_id: String,

    #[arg(long, env = "BOARDSYNC_USER_NAME")]
    user_name: Option<String>,

    /// Defaults to a fresh id per invocation.
    #[arg(long)]
    session_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream board events, presence and health as JSON lines until Ctrl-C.
    Watch(WatchArgs),
    /// Apply one edit through the optimistic pipeline and print the result.
    Submit(SubmitArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long)]
    board: String,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    #[arg(long)]
    board: String,
    /// task, column or board.
    #[arg(long)]
    resource: String,
    /// create, update, delete or move.
    #[arg(long)]
    op: String,
    #[arg(long)]
    id: String,
    /// JSON object sent as the mutation payload.
    #[arg(long, default_value = "{}")]
    data: String,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    config.connection.base_url.clone_from(&cli.base_url);

    let session_id = cli
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let name = cli.user_name.clone().unwrap_or_else(|| cli.user_id.clone());
    let local = LocalUser::new(cli.user_id.clone(), name);
    let deps = SessionDeps::http(&cli.base_url, Some(cli.token.clone()))?;

    match cli.command {
        Command::Watch(args) => {
            let key = SessionKey::new(session_id, args.board);
            let session = BoardSession::open(key, &cli.token, local, &config, deps)?;
            run_watch(Arc::new(session)).await
        }
        Command::Submit(args) => {
            let key = SessionKey::new(session_id, args.board.clone());
            let session = BoardSession::open(key, &cli.token, local, &config, deps)?;
            run_submit(&session, args).await
        }
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

async fn run_watch(session: Arc<BoardSession>) -> Result<(), CliError> {
    let mut subscriptions: Vec<Subscription> = EventKind::ALL
        .into_iter()
        .filter(|kind| !matches!(kind, EventKind::Ping | EventKind::Pong))
        .map(|kind| {
            session.subscribe(kind, |event| {
                let envelope = event.event.to_envelope();
                print_line(&json!({
                    "event": envelope.kind,
                    "data": envelope.data,
                    "timestamp": event.timestamp,
                }));
            })
        })
        .collect();

    subscriptions.push(session.on_status_change(|state| {
        print_line(&json!({ "status": state.as_str() }));
    }));
    subscriptions.push(session.on_presence_change(|entries| {
        print_line(&json!({ "presence": entries }));
    }));
    subscriptions.push(session.on_health(|report| {
        print_line(&json!({ "health": report }));
    }));

    session.connect()?;
    tokio::signal::ctrl_c().await?;

    drop(subscriptions);
    session.disconnect().await?;
    Ok(())
}

async fn run_submit(session: &BoardSession, args: SubmitArgs) -> Result<(), CliError> {
    let resource: ResourceKind = args.resource.parse().map_err(CliError::InvalidArgument)?;
    let kind: OperationKind = args.op.parse().map_err(CliError::InvalidArgument)?;
    let payload: Value = serde_json::from_str(&args.data)?;
    if !payload.is_object() {
        return Err(CliError::InvalidArgument("--data must be a JSON object".to_owned()));
    }

    // Broadcast suppression needs the socket; the edit itself only needs HTTP.
    session.connect()?;
    let mut state = session.watch_state();
    let reached = tokio::time::timeout(
        CONNECT_WAIT,
        state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Error)),
    )
    .await;
    match reached {
        Ok(Ok(s)) if *s == ConnectionState::Connected => {}
        Ok(Ok(_)) => warn!("board socket failed to connect; own broadcasts will not be suppressed"),
        Ok(Err(_)) => warn!("connection driver stopped before connecting"),
        Err(_) => warn!(
            wait_secs = CONNECT_WAIT.as_secs(),
            "board socket not connected in time; submitting without broadcast suppression"
        ),
    }

    let result = session.submit_edit(Edit::new(resource, args.id, kind, payload)).await;
    session.disconnect().await?;

    match result {
        Ok(data) => {
            print_line(&json!({ "ok": true, "data": data }));
            Ok(())
        }
        Err(e) => {
            print_line(&json!({ "ok": false, "code": e.error_code(), "message": e.user_message() }));
            Err(CliError::Rejected(e.to_string()))
        }
    }
}

fn print_line(value: &Value) {
    println!("{value}");
}
