//! Extract CLI command: the maintenance subcommand the daemon spawns
//! as a detached subprocess (§4.H `run_maintenance`) and that an operator
//! can also run by hand.
//!
//! Invoked with no arguments by the daemon, so every flag here must have
//! a usable default.

use std::io::Write;
use std::path::PathBuf;

use clap::Args;

use super::Runtime;
use crate::Result;
use crate::services::Extractor;

pub(super) fn default_home_subpath(parts: &[&str]) -> PathBuf {
    let base = directories::BaseDirs::new().map_or_else(|| PathBuf::from("."), |b| b.home_dir().to_path_buf());
    parts.iter().fold(base, |acc, part| acc.join(part))
}

/// Runs lesson extraction from session facets, falling back to raw
/// transcripts when no facet data is available.
#[derive(Debug, Clone, Args)]
pub struct ExtractArgs {
    /// Directory of session-facet files (defaults to
    /// `~/.claude/usage-data/facets`).
    #[arg(long)]
    pub facets_dir: Option<PathBuf>,
    /// Root directory of raw session transcripts (defaults to
    /// `~/.claude/projects`).
    #[arg(long)]
    pub transcripts_root: Option<PathBuf>,
    /// Analyzes which sessions would be sent for extraction without
    /// calling the external LLM or writing anything.
    #[arg(long)]
    pub dry_run: bool,
    /// Falls back to scanning raw transcripts directly, bypassing
    /// facet files entirely.
    #[arg(long)]
    pub transcripts: bool,
    /// Caps how many transcripts are examined when `--transcripts` is set.
    #[arg(long)]
    pub limit: Option<usize>,
}

impl ExtractArgs {
    /// Runs one extraction pass and writes a one-line summary.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub async fn run<W: Write>(&self, runtime: &Runtime, writer: &mut W) -> Result<()> {
        let facets_dir = self.facets_dir.clone().unwrap_or_else(|| default_home_subpath(&[".claude", "usage-data", "facets"]));
        let transcripts_root = self.transcripts_root.clone().unwrap_or_else(|| default_home_subpath(&[".claude", "projects"]));

        let extractor = Extractor::new(
            runtime.store.clone(),
            runtime.llm.clone(),
            runtime.embedder.clone(),
            runtime.vector_index.clone(),
            facets_dir,
            transcripts_root,
        );

        if self.transcripts {
            let summary = extractor.run_from_transcripts(self.limit, self.dry_run).await?;
            writeln!(
                writer,
                "processed {}, extracted {}, merged {}, skipped {}",
                summary.processed, summary.extracted, summary.merged, summary.skipped
            )
            .map_err(io_err)?;
            return Ok(());
        }

        let summary = extractor.run_from_facets(self.dry_run).await?;
        writeln!(
            writer,
            "new_sessions {}, with_friction {}, extracted {}, merged {}",
            summary.new_sessions, summary.with_friction, summary.extracted, summary.merged
        )
        .map_err(io_err)?;
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> crate::Error {
    crate::Error::OperationFailed { operation: "cli_write".to_string(), cause: e.to_string() }
}
