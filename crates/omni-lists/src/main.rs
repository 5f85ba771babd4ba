//! Inspect smart lists, their items and summaries from the command line.
//!
//! Talks to the Omni backend at `--base-url` (or `OMNI_API_BASE_URL`,
//! default `http://localhost:8000`) on behalf of `--user` (or
//! `OMNI_USER_EMAIL`). Output is JSON on stdout; logs go to stderr and
//! honour `RUST_LOG`.
//!
//! # Examples
//!
//! ```sh
//! # All lists
//! omni-lists lists
//!
//! # Items of list 1
//! omni-lists items 1
//!
//! # Regenerate the summary of list 1 and wait for it
//! omni-lists --poll-interval-secs 2 summary 1 --refresh
//!
//! # Full presenter snapshot with list 1 active
//! omni-lists snapshot --select 1
//!
//! # Offline walkthrough against the in-memory source
//! omni-lists demo
//! ```

use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use omni_lists::config::EngineConfig;
use omni_lists::model::{Item, ListDraft, ListId, SourceBinding, SourceFilters, UserContext};
use omni_lists::source::JobStatus;
use omni_lists::source::http::{HttpDataSource, HttpSourceConfig};
use omni_lists::source::memory::MemoryDataSource;
use omni_lists::{Engine, EngineError};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const USER_ENV: &str = "OMNI_USER_EMAIL";
const DEFAULT_USER: &str = "dev@example.com";

/// Inspect smart lists, their items and summaries.
#[derive(Parser)]
#[command(name = "omni-lists", version)]
struct Cli {
    /// Backend base URL [env: OMNI_API_BASE_URL]
    #[arg(long)]
    base_url: Option<String>,

    /// Email of the user the requests are made for [env: OMNI_USER_EMAIL]
    #[arg(long)]
    user: Option<String>,

    /// Seconds between summary job polls
    #[arg(long, default_value_t = 5)]
    poll_interval_secs: u64,

    /// Polls before a running summary job is given up on
    #[arg(long, default_value_t = 30)]
    max_poll_attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print all lists
    Lists,
    /// Print the items of a list
    Items { id: u64 },
    /// Request a list's summary and print the resulting record
    Summary {
        id: u64,
        /// Regenerate even if a completed summary exists
        #[arg(long)]
        refresh: bool,
        /// Print the record right after the request instead of waiting
        #[arg(long)]
        no_wait: bool,
    },
    /// Print a snapshot of all observable engine state
    Snapshot {
        /// Make this list active (and fetch its items) first
        #[arg(long)]
        select: Option<u64>,
    },
    /// Run a scripted session against the in-memory source
    Demo,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn to_json<T: Serialize>(value: &T) -> Result<String, EngineError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| EngineError::invalid_state(format!("failed to encode output: {e}")))
}

fn user_context(cli: &Cli) -> UserContext {
    let email = cli
        .user
        .clone()
        .or_else(|| std::env::var(USER_ENV).ok())
        .unwrap_or_else(|| DEFAULT_USER.to_string());
    UserContext::new(email)
}

fn engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig::default()
        .with_poll_interval(Duration::from_secs(cli.poll_interval_secs))
        .with_max_poll_attempts(cli.max_poll_attempts)
}

async fn run(cli: &Cli) -> Result<String, EngineError> {
    if let Command::Demo = cli.command {
        return demo(cli).await;
    }

    let mut http = HttpSourceConfig::from_env();
    if let Some(url) = &cli.base_url {
        http = http.with_base_url(url.clone());
    }
    let source = HttpDataSource::new(http)?;
    let engine = Engine::builder(Arc::new(source), user_context(cli))
        .config(engine_config(cli))
        .build();
    engine.load_lists().await?;

    match cli.command {
        Command::Lists => to_json(&engine.lists()),
        Command::Items { id } => {
            let id = ListId(id);
            engine.list(id).ok_or(EngineError::NotFound(id))?;
            let items = engine.refresh_items(id).await?;
            to_json(&items)
        }
        Command::Summary {
            id,
            refresh,
            no_wait,
        } => {
            let id = ListId(id);
            engine.select_list(id)?;
            let record = if refresh {
                engine.refresh_summary(id).await?
            } else {
                engine.request_summary(id).await?
            };
            let record = if no_wait {
                record
            } else {
                engine.wait_summary(id).await?
            };
            to_json(&record)
        }
        Command::Snapshot { select } => {
            if let Some(id) = select {
                let id = ListId(id);
                engine.select_list(id)?;
                engine.items(id).await;
            }
            engine.snapshot().to_json()
        }
        Command::Demo => demo(cli).await,
    }
}

/// Create a list, fetch its items and summarize it, all in memory.
async fn demo(cli: &Cli) -> Result<String, EngineError> {
    let first = ListId(1);
    let source = MemoryDataSource::new()
        .with_items(
            first,
            vec![
                Item::new(1, "Retrieval beats fine-tuning for fresh facts")
                    .with_author("Ann", "@ann"),
                Item::new(2, "Chunk size matters more than the embedding model")
                    .with_author("Bo", "@bo"),
            ],
        )
        .with_poll_script(
            first,
            vec![
                JobStatus::Running,
                JobStatus::Done {
                    result: "Two takes on retrieval quality.".into(),
                    model: Some("demo".into()),
                },
            ],
        );
    let config = engine_config(cli).with_poll_interval(Duration::from_millis(200));
    let engine = Engine::builder(Arc::new(source), user_context(cli))
        .config(config)
        .build();

    let id = engine
        .create_list(
            &ListDraft::new("RAG").with_source(SourceBinding::new(
                "twitter",
                SourceFilters {
                    rag_query: Some("retrieval augmented generation".into()),
                    ..Default::default()
                },
            )),
        )
        .await?;
    engine.select_list(id)?;
    engine.items(id).await;
    engine.request_summary(id).await?;
    engine.wait_summary(id).await?;
    engine.snapshot().to_json()
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    match run(&cli).await {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
