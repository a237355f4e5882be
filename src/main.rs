use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use recall::history::{generate_conversation_id, with_unique_suffix};
use recall::{
    Config, ConversationManager, Error, FileHistoryStore, HistoryStore, OpenAiCompatibleClient,
    ProfileReader, TokenEstimator, TurnEvent, TurnRequest,
};

/// Recall - chat with an LLM that remembers the conversation
#[derive(Parser)]
#[command(name = "recall", version, about)]
struct Cli {
    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the profile path
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat (default)
    Chat {
        /// Resume an existing conversation
        #[arg(short, long, env = "RECALL_CONVERSATION")]
        conversation: Option<String>,
    },
    /// Send one message and print the reply
    Send {
        #[arg(short, long)]
        conversation: String,
        message: String,
    },
    /// List stored conversations
    List,
    /// Print a conversation's history
    Show { conversation: String },
    /// Drop the oldest turns of a conversation
    Trim {
        conversation: String,
        /// Number of newest turns to keep
        #[arg(short, long)]
        keep: usize,
    },
    /// Show the context window the next message would use
    Preview {
        conversation: String,
        message: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info,recall=debug",
        2 => "debug",
        _ => "trace",
    };

    // Replies stream to stdout; keep logs out of the way
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(path) = cli.profile {
        config.profile_path = path;
    }
    tracing::debug!(?config, "loaded configuration");

    let store = Arc::new(FileHistoryStore::open(config.conversations_dir())?);

    match cli.command.unwrap_or(Command::Chat { conversation: None }) {
        Command::Chat { conversation } => {
            let manager = build_manager(&config, Arc::clone(&store))?;
            let id = match conversation {
                Some(id) => id,
                None => {
                    let id = generate_conversation_id();
                    if store.exists(&id)? { with_unique_suffix(&id) } else { id }
                }
            };
            chat(&manager, &id).await
        }
        Command::Send {
            conversation,
            message,
        } => {
            let manager = build_manager(&config, store)?;
            send(&manager, &conversation, message).await
        }
        Command::List => cmd_list(store.as_ref()),
        Command::Show { conversation } => cmd_show(store.as_ref(), &conversation),
        Command::Trim { conversation, keep } => {
            let removed = store.trim_to(&conversation, keep)?;
            println!("removed {removed} turn(s) from {conversation}");
            Ok(())
        }
        Command::Preview {
            conversation,
            message,
        } => {
            let manager = build_manager(&config, store)?;
            cmd_preview(&manager, &conversation, &message)
        }
    }
}

fn build_manager(
    config: &Config,
    store: Arc<FileHistoryStore>,
) -> anyhow::Result<ConversationManager> {
    let profile = ProfileReader::read_or_init(&config.profile_path)?;
    let client =
        OpenAiCompatibleClient::new(config.llm.base_url.clone(), config.llm.api_key.clone());

    Ok(ConversationManager::new(
        store,
        Arc::new(client),
        TokenEstimator::default(),
        profile,
        config.turn_config(),
    ))
}

async fn chat(manager: &ConversationManager, conversation_id: &str) -> anyhow::Result<()> {
    let history = manager.history(conversation_id)?;
    println!(
        "conversation {conversation_id} ({} stored turns); type 'exit' to quit",
        history.len()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        // Ctrl-C at the prompt quits; during a turn it only abandons the reply
        let Some(line) = next_input(&mut lines, tokio::signal::ctrl_c()).await? else {
            println!();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        // A single failed turn leaves the conversation usable
        if let Err(e) = send(manager, conversation_id, line.to_string()).await {
            eprintln!("error: {e}");
        }
    }
    Ok(())
}

/// Next input line, or `None` at end of input or on interrupt
async fn next_input<R>(
    lines: &mut Lines<R>,
    interrupt: impl Future<Output = std::io::Result<()>>,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        line = lines.next_line() => line,
        _ = interrupt => Ok(None),
    }
}

async fn send(
    manager: &ConversationManager,
    conversation_id: &str,
    message: String,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::Delta(text) => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                TurnEvent::Warning(warning) => eprintln!("\nwarning: {warning}"),
                TurnEvent::State(state) => tracing::trace!(?state, "turn state"),
            }
        }
    });

    let request = TurnRequest::new(conversation_id, message).with_notify(tx);
    let result = tokio::select! {
        result = manager.run_turn(request) => result,
        _ = tokio::signal::ctrl_c() => Err(Error::Cancelled),
    };
    printer.await?;
    println!();

    let outcome = result?;
    tracing::debug!(
        included = outcome.included_turns,
        excluded = outcome.excluded_turns,
        prompt_tokens = outcome.prompt_tokens,
        "turn finished"
    );
    Ok(())
}

fn cmd_list(store: &dyn HistoryStore) -> anyhow::Result<()> {
    let summaries = store.list()?;
    if summaries.is_empty() {
        println!("no conversations yet");
        return Ok(());
    }
    for summary in summaries {
        let updated = summary
            .updated_at
            .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        println!(
            "{:<40} {:>5} turns {:>7} tokens  {updated}",
            summary.id, summary.turns, summary.total_tokens
        );
    }
    Ok(())
}

fn cmd_show(store: &dyn HistoryStore, conversation_id: &str) -> anyhow::Result<()> {
    let conversation = store.load(conversation_id)?;
    if conversation.is_empty() {
        println!("no stored turns for {conversation_id}");
        return Ok(());
    }
    for turn in conversation.turns() {
        println!(
            "[{}] {} ({} tokens)\n{}\n",
            turn.timestamp().format("%Y-%m-%d %H:%M:%S"),
            turn.role(),
            turn.token_count(),
            turn.content()
        );
    }
    Ok(())
}

fn cmd_preview(
    manager: &ConversationManager,
    conversation_id: &str,
    message: &str,
) -> anyhow::Result<()> {
    let window = manager.preview(conversation_id, message)?;
    println!(
        "budget {}: preamble {} + history {} = {} tokens",
        window.budget, window.preamble_tokens, window.history_tokens, window.total_tokens
    );
    println!(
        "{} turn(s) included, {} excluded",
        window.included_turns.len(),
        window.excluded_turns
    );
    if let Some(oversized) = window.oversized {
        println!(
            "latest turn exceeds the remaining budget ({} > {})",
            oversized.turn_tokens, oversized.available_tokens
        );
    }
    for turn in &window.included_turns {
        println!(
            "  {:<9} {:>5}  {}",
            turn.role().as_str(),
            turn.token_count(),
            first_line(turn.content())
        );
    }
    Ok(())
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > 60 {
        let cut: String = line.chars().take(57).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}
