//! Binary entry point for engrammar.
//!
//! Wires the loaded configuration into a [`Runtime`] and dispatches to
//! one of the ten subcommands. Each subcommand owns its own output
//! formatting; this file only parses arguments, builds the shared
//! capabilities, and reports the final `Result`.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// The CLI's job is to print results, not just diagnostics, to stdout.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{CommandFactory, Parser, Subcommand};
use engrammar::cli::{
    AddArgs, BackfillTagsArgs, ConfigArgs, DedupArgs, DeprecateArgs, EvaluateArgs, ExtractArgs,
    HookArgs, PinnedArgs, Runtime, SearchArgs, ServeArgs, StatusArgs,
};
use engrammar::config::{self, EngrammarConfig};
use engrammar::context::SystemEnvironmentProbe;
use engrammar::embedding;
use engrammar::llm::ExternalLlm;
use engrammar::observability::{self, LogTarget};
use engrammar::services::HybridRetriever;
use engrammar::storage::sqlite::{connection, schema};
use engrammar::storage::{MmapVectorIndex, SqliteEngramStore};

#[derive(Parser)]
#[command(name = "engrammar")]
#[command(about = "A personal lesson-memory engine for an AI coding assistant")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Adds an engram directly.
    Add(AddArgs),
    /// Soft-deletes an engram.
    Deprecate(DeprecateArgs),
    /// Runs the hybrid retriever against a query.
    Search(SearchArgs),
    /// Lists pinned engrams matching the current environment.
    Pinned(PinnedArgs),
    /// Dispatches one hook invocation read from stdin.
    Hook(HookArgs),
    /// Runs the long-lived retrieval daemon.
    Serve(ServeArgs),
    /// Reports whether the daemon is reachable.
    Status(StatusArgs),
    /// Inspects configuration.
    Config(ConfigArgs),
    /// Extracts candidate engrams from session facets or transcripts.
    Extract(ExtractArgs),
    /// Scores completed sessions and folds results into the EMA table.
    Evaluate(EvaluateArgs),
    /// Finds and merges near-duplicate engrams.
    Dedup(DedupArgs),
    /// Backfills missing environment tags on session-audit rows.
    BackfillTags(BackfillTagsArgs),
    /// Generates a shell completion script.
    Completions {
        /// Shell to generate a completion script for.
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "engrammar", &mut std::io::stdout());
        return std::process::ExitCode::SUCCESS;
    }

    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("engrammar: failed to initialize: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    match dispatch(&cli.command, &runtime).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("engrammar: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

/// Builds every capability a subcommand might need from the loaded
/// configuration: storage, vector index, embedder, environment probe,
/// retriever, and LLM client.
fn build_runtime() -> engrammar::Result<Runtime> {
    let home = config::home_dir();
    std::fs::create_dir_all(&home).map_err(|e| engrammar::Error::OperationFailed {
        operation: "home_dir_create".to_string(),
        cause: e.to_string(),
    })?;

    observability::init(LogTarget::Stderr, Some(&home.join("engrammar.log")));

    let config_path = home.join("config.json");
    let engrammar_config = EngrammarConfig::load_from_file(&config_path)?;

    let db_path = home.join("engrams.db");
    let conn = rusqlite::Connection::open(&db_path)
        .map_err(|e| engrammar::Error::OperationFailed { operation: "db_open".to_string(), cause: e.to_string() })?;
    connection::configure_connection(&conn)?;
    let conn = Mutex::new(conn);
    schema::migrate(&conn)?;
    let store: Arc<dyn engrammar::EngramStore> = Arc::new(SqliteEngramStore::new(conn));

    let embedder: Arc<dyn engrammar::Embedder> = Arc::from(embedding::default_embedder()?);
    let vector_index: Arc<dyn engrammar::VectorIndex> =
        Arc::new(MmapVectorIndex::open(home.join("vectors.idx"), embedder.dimensions()));

    let mcp_config_path = engrammar_mcp_config_path();
    let environment: Arc<dyn engrammar::EnvironmentProbe> = Arc::new(SystemEnvironmentProbe::new(mcp_config_path));

    let retriever = Arc::new(HybridRetriever::new(
        Arc::clone(&store),
        Arc::clone(&vector_index),
        Arc::clone(&embedder),
        Arc::clone(&environment),
    ));

    let llm = ExternalLlm::new(engrammar_config.llm.binary.clone(), engrammar_config.llm.model.clone());
    let binary = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("engrammar"));

    Ok(Runtime { store, vector_index, embedder, environment, retriever, llm, config: engrammar_config, binary, home })
}

fn engrammar_mcp_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".claude.json"))
}

async fn dispatch(command: &Commands, runtime: &Runtime) -> engrammar::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match command {
        Commands::Add(args) => args.run(runtime, &mut out),
        Commands::Deprecate(args) => args.run(runtime, &mut out),
        Commands::Search(args) => args.run(runtime, &mut out),
        Commands::Pinned(args) => args.run(runtime, &mut out),
        Commands::Hook(args) => args.run(runtime, &mut out),
        Commands::Serve(args) => args.run(runtime, &mut out).await,
        Commands::Status(args) => args.run(runtime, &mut out).await,
        Commands::Config(args) => args.run(runtime, &mut out),
        Commands::Extract(args) => args.run(runtime, &mut out).await,
        Commands::Evaluate(args) => args.run(runtime, &mut out).await,
        Commands::Dedup(args) => args.run(runtime, &mut out).await,
        Commands::BackfillTags(args) => args.run(runtime, &mut out),
        Commands::Completions { .. } => unreachable!("handled before runtime construction"),
    }
}
