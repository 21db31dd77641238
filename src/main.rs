use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sitewise::config::load_config;
use sitewise::engine::Engine;
use sitewise::models::TrainingStatus;

#[derive(Parser)]
#[command(name = "sitewise")]
#[command(about = "Train a website into a personal knowledge base and ask it questions")]
#[command(version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "./sitewise.toml")]
    config: PathBuf,

    /// User the command acts for.
    #[arg(long, global = true, default_value = "default")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter configuration file.
    Init,
    /// Crawl a website and train it into the user's knowledge base.
    Train {
        /// Origin URL to crawl.
        url: String,
        /// Return immediately instead of waiting for training to finish.
        #[arg(long)]
        no_wait: bool,
    },
    /// Show the user's training status.
    Status,
    /// Ask a question.
    Ask {
        /// The question text.
        question: Vec<String>,
    },
    /// Turn grounded answering on or off.
    Mode {
        /// "on" or "off".
        state: String,
    },
    /// Clear the user's conversation history.
    Reset,
    /// Forget the user's knowledge base, history, and mode.
    Forget,
}

const STARTER_CONFIG: &str = r#"[store]
path = "./data/sitewise.sqlite"

[crawl]
max_pages = 12
max_depth = 2

[chunking]
max_chunk_len = 1000
overlap_len = 50

[embedding]
provider = "openai"
model = "text-embedding-3-small"
dims = 1536

[generation]
provider = "openai"
model = "gpt-4o-mini"

[retrieval]
top_k = 4
candidate_k = 8
min_score = 0.25
"#;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sitewise=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Command::Init = cli.command {
        if cli.config.exists() {
            anyhow::bail!("Config file already exists: {}", cli.config.display());
        }
        std::fs::write(&cli.config, STARTER_CONFIG)
            .with_context(|| format!("Failed to write {}", cli.config.display()))?;
        println!("Wrote starter config to {}", cli.config.display());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let engine = Engine::from_config(config).await?;

    match cli.command {
        Command::Init => unreachable!("handled above"),
        Command::Train { url, no_wait } => {
            let record = engine.start_training(&cli.user, &url).await?;
            println!("Training started: {}", record.source_id);
            if no_wait {
                return Ok(());
            }
            wait_for_training(&engine, &cli.user).await?;
        }
        Command::Status => match engine.training_status(&cli.user).await {
            Some(record) => {
                println!("Source:  {}", record.origin_url);
                println!("Status:  {}", record.status);
                if let Some(trained_at) = record.trained_at {
                    println!("Trained: {}", trained_at.to_rfc3339());
                }
            }
            None => println!("No knowledge source trained yet."),
        },
        Command::Ask { question } => {
            let question = question.join(" ");
            if question.trim().is_empty() {
                anyhow::bail!("Question is empty");
            }
            let answer = engine.ask(&cli.user, &question).await?;
            println!("{}", answer.text);
            if !answer.citations.is_empty() {
                println!();
                println!("Sources:");
                for url in &answer.citations {
                    println!("  - {}", url);
                }
            }
        }
        Command::Mode { state } => {
            let enabled = match state.as_str() {
                "on" => true,
                "off" => false,
                other => anyhow::bail!("Mode must be 'on' or 'off', got '{}'", other),
            };
            let mode = engine.set_mode(&cli.user, enabled).await?;
            println!(
                "Grounded answering is {}.",
                if mode.rag_enabled { "on" } else { "off" }
            );
        }
        Command::Reset => {
            engine.reset(&cli.user);
            println!("Cleared conversation history for '{}'.", cli.user);
        }
        Command::Forget => {
            engine.forget(&cli.user).await?;
            println!("Forgot knowledge base, history, and mode for '{}'.", cli.user);
        }
    }

    Ok(())
}

async fn wait_for_training(engine: &Engine, user: &str) -> Result<()> {
    let mut last = String::new();
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let Some(record) = engine.training_status(user).await else {
            continue;
        };
        let label = record.status.to_string();
        if label != last {
            println!("  {}", label);
            last = label;
        }
        match record.status {
            TrainingStatus::Ready => {
                println!("Training complete. Grounded answering is now on.");
                return Ok(());
            }
            TrainingStatus::Failed(reason) => {
                anyhow::bail!("Training failed: {}", reason);
            }
            _ => {}
        }
    }
}
