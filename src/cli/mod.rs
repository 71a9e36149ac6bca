//! Command-line subcommands, one module per command, mirroring the
//! request server's own verbs (search, pinned, extract, evaluate, dedup)
//! plus the CLI-only surface (add, deprecate, hook, serve, status,
//! config, backfill-tags).

mod backfill_tags;
mod capture;
mod config;
mod dedup;
mod evaluate;
mod extract;
mod hook;
mod recall;
mod serve;
mod status;

pub use backfill_tags::BackfillTagsArgs;
pub use capture::{AddArgs, DeprecateArgs};
pub use config::ConfigArgs;
pub use dedup::DedupArgs;
pub use evaluate::EvaluateArgs;
pub use extract::ExtractArgs;
pub use hook::HookArgs;
pub use recall::{PinnedArgs, SearchArgs};
pub use serve::ServeArgs;
pub use status::StatusArgs;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::EngrammarConfig;
use crate::context::EnvironmentProbe;
use crate::embedding::Embedder;
use crate::llm::ExternalLlm;
use crate::services::HybridRetriever;
use crate::storage::{EngramStore, VectorIndex};

/// Every capability a subcommand might need, composed once in `main`
/// from the loaded configuration and handed by reference to whichever
/// subcommand the user invoked. Cheap to construct per process since
/// each CLI invocation is short-lived (unlike the daemon, which holds
/// these for its whole lifetime).
pub struct Runtime {
    /// Durable engram table and session-audit ledger.
    pub store: Arc<dyn EngramStore>,
    /// Dense vector index, shared with the retriever and the
    /// extract/dedup maintenance jobs that rebuild it.
    pub vector_index: Arc<dyn VectorIndex>,
    /// Embedding model backing both retrieval and index rebuilds.
    pub embedder: Arc<dyn Embedder>,
    /// Environment probe, independent of the retriever's internal copy
    /// so commands that need a raw snapshot (status, backfill-tags)
    /// don't have to go through search.
    pub environment: Arc<dyn EnvironmentProbe>,
    /// Hybrid retriever composed over the above.
    pub retriever: Arc<HybridRetriever>,
    /// External LLM subprocess client for extract/evaluate/dedup.
    pub llm: ExternalLlm,
    /// Loaded configuration.
    pub config: EngrammarConfig,
    /// Path to this binary, passed to the daemon so its maintenance
    /// subprocesses re-invoke the same executable.
    pub binary: PathBuf,
    /// Resolved engrammar home directory (`~/.engrammar` by default).
    pub home: PathBuf,
}
