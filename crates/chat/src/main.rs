//! Replays model replies through the chat core and prints the rendered transcript.

use std::io::Read;
use std::path::PathBuf;

use clap::Parser;
use murmur::chat::{Collaborators, HeadlessSurface};
use murmur::{ChatRuntime, ChatSettings, PersistenceSettings, RuntimeError, SettingsStore};
use murmur_storage::NewConversation;
use snafu::{ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

/// Lines equal to this separate two turns of the input.
const TURN_SEPARATOR: &str = "---";
/// Turns starting with this prefix are sent as the local user.
const USER_PREFIX: &str = "user:";

#[derive(Parser)]
#[command(name = "murmur-replay")]
#[command(about = "Replay raw model replies through the chat pipeline")]
struct Cli {
    /// File holding the turns, separated by `---` lines (default: stdin)
    input: Option<PathBuf>,

    /// Display name of the companion
    #[arg(long, default_value = "Companion")]
    participant: String,

    /// Keep history in this directory instead of memory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Settings file to load (default: built-in settings)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Records rendered per window
    #[arg(long)]
    batch_size: Option<usize>,

    /// Deliver every record without pacing delays
    #[arg(long)]
    instant: bool,
}

#[derive(Debug, Snafu)]
enum ReplayError {
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    Input {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("chat runtime failed on `{stage}`: {source}"))]
    Runtime {
        stage: &'static str,
        source: RuntimeError,
    },
}

#[tokio::main]
async fn main() -> Result<(), ReplayError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let input = read_input(cli.input.as_ref())?;
    let settings = settings_for(&cli);

    let runtime = match &cli.data_dir {
        Some(_) => ChatRuntime::open(settings, Collaborators::local()).context(RuntimeSnafu {
            stage: "replay-open-runtime",
        })?,
        None => ChatRuntime::in_memory(settings, Collaborators::local()),
    };

    let conversation = runtime.create_conversation(NewConversation::with_participant(&cli.participant));
    let view = runtime
        .open_view(conversation.id(), HeadlessSurface::default())
        .context(RuntimeSnafu {
            stage: "replay-open-view",
        })?;

    for turn in turns(&input) {
        if let Some(text) = turn.strip_prefix(USER_PREFIX) {
            runtime
                .send_user_message(conversation.id(), text)
                .context(RuntimeSnafu {
                    stage: "replay-send-user-message",
                })?;
        } else {
            let ticket = runtime.ingest(conversation.id(), &turn).context(RuntimeSnafu {
                stage: "replay-ingest",
            })?;
            if let Some(thinking) = &ticket.thinking {
                tracing::info!("thinking: {thinking}");
            }
            let delivered = ticket.delivered().await;
            tracing::debug!(delivered, "turn replayed");
        }
        view.lock().on_frame();
    }

    println!("{}", view.lock().renderer().surface().dump());

    runtime.shutdown().await.context(RuntimeSnafu {
        stage: "replay-shutdown",
    })?;
    Ok(())
}

fn settings_for(cli: &Cli) -> ChatSettings {
    let mut settings = match &cli.config {
        Some(path) => (*SettingsStore::new(path.clone()).settings()).clone(),
        None => ChatSettings::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        settings.persistence = PersistenceSettings::rooted_at(data_dir);
    }
    if let Some(batch_size) = cli.batch_size {
        settings.render.batch_size = batch_size;
    }
    if cli.instant {
        settings.pacing.paragraph_gap_ms = 0;
        settings.pacing.line_gap_ms = 0;
        settings.pacing.wait_default_ms = 0;
        settings.pacing.action_gap_ms = 0;
        settings.pacing.max_wait_ms = 0;
    }
    settings
}

fn read_input(path: Option<&PathBuf>) -> Result<String, ReplayError> {
    match path {
        Some(path) => std::fs::read_to_string(path).context(InputSnafu {
            stage: "replay-read-file",
        }),
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context(InputSnafu {
                    stage: "replay-read-stdin",
                })?;
            Ok(input)
        }
    }
}

fn turns(input: &str) -> Vec<String> {
    let mut turns = Vec::new();
    let mut current = String::new();
    for line in input.lines() {
        if line.trim() == TURN_SEPARATOR {
            turns.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    turns.push(current);
    turns
        .into_iter()
        .map(|turn| turn.trim().to_string())
        .filter(|turn| !turn.is_empty())
        .collect()
}
