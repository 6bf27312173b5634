use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chat_engine::{init_logging, Engine, EngineConfig, SendOutcome};
use clap::{Parser, Subcommand};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Parser)]
#[command(name = "chat_engine")]
#[command(about = "Drive chat generations against a local state directory", long_about = None)]
struct Cli {
    /// Generation server root
    #[arg(long, env = "CHAT_ENGINE_BASE_URL")]
    base_url: Option<String>,

    /// Directory holding persisted conversations and registry
    #[arg(long, env = "CHAT_ENGINE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message, to a new conversation unless one is given
    Send {
        #[arg(long, short)]
        conversation: Option<String>,
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Replace the last assistant reply of a conversation
    Regenerate { conversation: String },
    /// Continue a conversation in a new one seeded with its summary
    Continue { conversation: String },
    /// List conversations, most recent first
    List {
        /// Print the full conversations as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show conversations marked as generating
    Generating,
    /// Reconcile a conversation with the server transcript
    Resync { conversation: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn Error>> {
    let mut config = EngineConfig::from_env();
    if let Some(base_url) = cli.base_url {
        config = config.with_base_url(base_url);
    }
    if let Some(state_dir) = cli.state_dir {
        config = config.with_state_dir(state_dir);
    }
    let engine = Engine::open(config)?;

    match cli.command {
        Commands::Send { conversation, text } => {
            let lifecycle = Arc::clone(engine.lifecycle());
            let conversation_id = match conversation {
                Some(id) => {
                    lifecycle.select(&id)?;
                    id
                }
                None => lifecycle.new_conversation()?,
            };
            abort_on_interrupt(&engine);
            let outcome = lifecycle.send_to(&conversation_id, &text.join(" ")).await?;
            Ok(report(&engine, &conversation_id, &outcome))
        }
        Commands::Regenerate { conversation } => {
            abort_on_interrupt(&engine);
            let outcome = engine.lifecycle().regenerate_in(&conversation).await?;
            Ok(report(&engine, &conversation, &outcome))
        }
        Commands::Continue { conversation } => {
            abort_on_interrupt(&engine);
            let (created, outcome) = engine
                .lifecycle()
                .continue_in_new_chat(&conversation)
                .await?;
            println!("continued in {created}");
            Ok(report(&engine, &created, &outcome))
        }
        Commands::List { json } => {
            let conversations = engine.conversations().list();
            if json {
                println!("{}", serde_json::to_string_pretty(&conversations)?);
                return Ok(ExitCode::SUCCESS);
            }
            for conversation in conversations {
                println!(
                    "{}\t{}\t{} messages",
                    conversation.id,
                    conversation.title,
                    conversation.messages.len()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Generating => {
            for entry in engine.registry().refresh()?.values() {
                println!(
                    "{}\t{}\tstarted {}",
                    entry.conversation_id,
                    entry.backend,
                    format_millis(entry.started_at)
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Resync { conversation } => {
            let outcome = engine.activate(&conversation).await?;
            println!("{outcome:?}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn abort_on_interrupt(engine: &Engine) {
    let lifecycle = Arc::clone(engine.lifecycle());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            lifecycle.abort();
        }
    });
}

fn format_millis(millis: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| millis.to_string())
}

fn report(engine: &Engine, conversation_id: &str, outcome: &SendOutcome) -> ExitCode {
    let reply = engine
        .conversations()
        .get(conversation_id)
        .and_then(|conversation| conversation.latest_assistant().cloned());
    if let Some(reply) = reply {
        println!("{}", reply.content);
        for tool in &reply.tool_uses {
            println!("[tool {} {:?}]", tool.name, tool.status);
        }
    }

    match outcome {
        SendOutcome::Completed => ExitCode::SUCCESS,
        SendOutcome::Aborted => {
            eprintln!("stream aborted; the server may still be generating");
            ExitCode::from(130)
        }
        SendOutcome::Errored(_) => ExitCode::FAILURE,
    }
}
