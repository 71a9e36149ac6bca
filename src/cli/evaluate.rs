//! Evaluate CLI command: the other maintenance subcommand the daemon
//! spawns (§4.H `run_maintenance`).
//!
//! The daemon always passes `--limit <n>` when it has one; a bare
//! invocation (no limit) must still behave sensibly for a by-hand run.

use std::io::Write;
use std::path::PathBuf;

use clap::Args;

use super::Runtime;
use crate::Result;
use crate::services::RelevanceEvaluator;

/// Scores completed sessions against the shown-engram set and folds the
/// result into the tag-relevance EMA table.
#[derive(Debug, Clone, Args)]
pub struct EvaluateArgs {
    /// Root directory of raw session transcripts (defaults to
    /// `~/.claude/projects`).
    #[arg(long)]
    pub transcripts_root: Option<PathBuf>,
    /// Caps how many pending session audits are evaluated in this run.
    #[arg(long)]
    pub limit: Option<usize>,
}

impl EvaluateArgs {
    /// Runs one evaluation pass and writes a one-line summary.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub async fn run<W: Write>(&self, runtime: &Runtime, writer: &mut W) -> Result<()> {
        let transcripts_root = self
            .transcripts_root
            .clone()
            .unwrap_or_else(|| super::extract::default_home_subpath(&[".claude", "projects"]));

        let evaluator = RelevanceEvaluator::new(runtime.store.clone(), runtime.llm.clone(), transcripts_root);
        let summary = evaluator.run_pending_limited(self.limit).await?;

        writeln!(
            writer,
            "completed {}, failed {}, skipped {}",
            summary.completed, summary.failed, summary.skipped
        )
        .map_err(io_err)?;
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> crate::Error {
    crate::Error::OperationFailed { operation: "cli_write".to_string(), cause: e.to_string() }
}
