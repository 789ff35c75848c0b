//! A terminal chat with the tool-calling agent.

#[macro_use]
extern crate tracing;

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use tokio::io::{self, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use toolloop::core::transcript::FileTranscriptStore;
use toolloop::core::{AgentError, LoopConfig, ToolOutcome, Turn};
use toolloop::{Memory, Session, SessionBuilder};
use toolloop_openai_model::{OpenAIConfigBuilder, OpenAIProvider};
use tracing_subscriber::EnvFilter;

const DEFAULT_SYSTEM_PROMPT: &str = "You are my AI assistant, please answer \
    my query to the best of your ability. Make things into smaller parts if \
    it needed.";
const EXIT_COMMAND: &str = "exit";
const BAR_CHAR: &str = "▎";

/// Chat with a model that can call arithmetic tools.
///
/// The model is configured with `OPENAI_API_KEY`, `OPENAI_BASE_URL` and
/// `OPENAI_MODEL`, which may also be set in a `.env` file.
#[derive(Debug, Parser)]
#[command(name = "toolloop", version)]
struct Cli {
    /// Answer this prompt and exit, instead of starting a chat.
    prompt: Option<String>,

    /// Load the conversation from this file and save it back on exit.
    #[arg(long, value_name = "PATH")]
    transcript: Option<PathBuf>,

    /// Forget earlier messages, every message starts a new conversation.
    #[arg(long, conflicts_with = "transcript")]
    stateless: bool,

    /// Do not offer any tool to the model.
    #[arg(long)]
    no_tools: bool,

    /// The system prompt sent ahead of the conversation.
    #[arg(long, value_name = "TEXT", default_value = DEFAULT_SYSTEM_PROMPT)]
    system_prompt: String,

    /// How many tool round trips a single message may take.
    #[arg(long, value_name = "N", default_value_t = 25)]
    max_round_trips: usize,

    /// How many times a failed model request is retried.
    #[arg(long, value_name = "N", default_value_t = 3)]
    max_retries: usize,

    /// Run the tool calls of one round trip concurrently.
    #[arg(long)]
    parallel_tools: bool,

    /// Print debug logs (`RUST_LOG` takes precedence).
    #[arg(short, long)]
    verbose: bool,
}

enum SessionEvent {
    Turn(Turn),
    Transcript,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = OpenAIConfigBuilder::from_env().build();
    if !config.has_api_key() {
        warn!("OPENAI_API_KEY is not set, model requests will fail");
    }
    debug!("using model {}", config.model());
    let model_provider = OpenAIProvider::new(config);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let loop_config = LoopConfig {
        max_round_trips: cli.max_round_trips,
        max_retries: cli.max_retries,
        parallel_tool_calls: cli.parallel_tools,
        ..Default::default()
    };
    let memory = if cli.stateless {
        Memory::Stateless
    } else {
        Memory::Persistent
    };

    let mut builder = SessionBuilder::with_model_provider(model_provider)
        .with_system_prompt(cli.system_prompt.as_str())
        .with_loop_config(loop_config)
        .with_arithmetic_tools(!cli.no_tools)
        .with_memory(memory)
        .on_turn({
            let event_tx = event_tx.clone();
            move |turn| {
                event_tx.send(SessionEvent::Turn(turn.clone())).ok();
            }
        })
        .on_transcript(move |_| {
            event_tx.send(SessionEvent::Transcript).ok();
        });
    if let Some(path) = &cli.transcript {
        builder = builder.with_transcript_store(FileTranscriptStore::new(path));
    }
    let mut session = builder.build().context("failed to start a session")?;

    let exit_code = match &cli.prompt {
        Some(prompt) => {
            print_turn(&Turn::user(prompt.as_str()));
            match chat(&mut session, prompt, &mut event_rx).await {
                Ok(_) => ExitCode::SUCCESS,
                Err(err) => {
                    print_error(&err);
                    ExitCode::FAILURE
                }
            }
        }
        None => {
            repl(&mut session, &mut event_rx).await?;
            ExitCode::SUCCESS
        }
    };

    if let Some(path) = &cli.transcript {
        session.save().with_context(|| {
            format!("failed to save the conversation to {}", path.display())
        })?;
        println!(
            "{}",
            format!("Conversation history saved to {}", path.display())
                .dimmed()
        );
    }

    Ok(exit_code)
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn repl(
    session: &mut Session,
    event_rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        print!("Enter: ");
        std::io::stdout().flush()?;

        let Some(line) = read_line(&mut lines).await else {
            println!();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == EXIT_COMMAND {
            break;
        }

        if let Err(err) = chat(session, line, event_rx).await {
            print_error(&err);
        }
        println!();
    }
    Ok(())
}

/// Reads a line, or returns `None` on end of input or Ctrl-C.
async fn read_line(lines: &mut Lines<BufReader<Stdin>>) -> Option<String> {
    select! {
        line = lines.next_line() => match line {
            Ok(line) => line,
            Err(err) => {
                error!("error reading input: {err}");
                None
            }
        },
        _ = tokio::signal::ctrl_c() => None,
    }
}

/// Sends one message, printing turns as they are appended.
///
/// Ctrl-C cancels the run instead of quitting the program.
async fn chat(
    session: &mut Session,
    message: &str,
    event_rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> Result<String, AgentError> {
    let progress_style = ProgressStyle::with_template("{spinner} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
    let progress_bar = ProgressBar::new_spinner();
    progress_bar.set_style(progress_style);
    progress_bar.set_message("🤔 Thinking...");

    let cancel = CancellationToken::new();
    let run = session.send_message(message, &cancel);
    tokio::pin!(run);
    let mut ticker = interval(Duration::from_millis(100));

    let outcome = loop {
        select! {
            outcome = &mut run => break outcome,
            Some(event) = event_rx.recv() => match event {
                SessionEvent::Turn(turn) => {
                    progress_bar.suspend(|| print_turn(&turn));
                    progress_bar.set_message("🤔 Thinking...");
                }
                SessionEvent::Transcript => {
                    progress_bar.set_message("✍️  Writing...");
                }
            },
            _ = ticker.tick() => progress_bar.tick(),
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                cancel.cancel();
                progress_bar.set_message("Cancelling...");
            }
        }
    };
    progress_bar.finish_and_clear();

    // Turns appended right before the run finished.
    while let Ok(event) = event_rx.try_recv() {
        if let SessionEvent::Turn(turn) = event {
            print_turn(&turn);
        }
    }
    outcome
}

fn print_error(err: &AgentError) {
    match err {
        AgentError::Cancelled => {
            println!("{}", "Cancelled.".bright_yellow());
        }
        err => {
            eprintln!("{} {err}", "Error:".bright_red().bold());
        }
    }
}

fn print_turn(turn: &Turn) {
    match turn {
        Turn::User { text } => {
            println!("{}👤 {}", BAR_CHAR.bright_green(), text.bright_white());
        }
        Turn::Assistant { text, tool_calls } => {
            if !text.is_empty() {
                println!(
                    "{}🤖 {}",
                    BAR_CHAR.bright_cyan(),
                    text.bright_white()
                );
            }
            for call in tool_calls {
                println!(
                    "{}🔧 {} {}",
                    BAR_CHAR.bright_yellow(),
                    call.tool_name.bold(),
                    call.arguments.dimmed()
                );
            }
        }
        Turn::ToolResult {
            tool_name, outcome, ..
        } => match outcome {
            ToolOutcome::Success(output) => {
                println!(
                    "{}   {} → {}",
                    BAR_CHAR.bright_yellow(),
                    tool_name.dimmed(),
                    output
                );
            }
            ToolOutcome::Failure(reason) => {
                println!(
                    "{}   {} ✗ {}",
                    BAR_CHAR.bright_red(),
                    tool_name.dimmed(),
                    reason.red()
                );
            }
        },
    }
}
