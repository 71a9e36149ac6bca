//! Dedup CLI command: runs the LLM-assisted merge engine (§4.G) by hand.
//! Not invoked by the daemon's `run_maintenance` — dedup is operator- or
//! cron-triggered, since merges are irreversible and worth a deliberate
//! run rather than an automatic one.

use std::io::Write;

use clap::Args;

use super::Runtime;
use crate::Result;
use crate::services::DedupEngine;
use crate::services::dedup::DedupConfig;

/// Tuning flags mapped onto [`DedupConfig`]; omitted flags keep its
/// defaults.
#[derive(Debug, Clone, Args)]
pub struct DedupArgs {
    /// Minimum cosine similarity for a pair to be considered a candidate.
    #[arg(long)]
    pub min_similarity: Option<f32>,
    /// Candidates kept per engram.
    #[arg(long)]
    pub max_candidates: Option<usize>,
    /// Approximate character budget per LLM batch.
    #[arg(long)]
    pub char_budget: Option<usize>,
    /// Confidence hint passed to the scorer.
    #[arg(long)]
    pub min_confidence: Option<f32>,
    /// Runs exactly one pass instead of looping to convergence.
    #[arg(long)]
    pub single_pass: bool,
    /// Upper bound on passes within this run.
    #[arg(long)]
    pub max_passes: Option<u32>,
    /// Cap on unverified engrams considered in one pass.
    #[arg(long)]
    pub limit: Option<usize>,
}

impl DedupArgs {
    fn config(&self) -> DedupConfig {
        let mut config = DedupConfig::default();
        if let Some(v) = self.min_similarity {
            config.min_similarity = v;
        }
        if let Some(v) = self.max_candidates {
            config.max_candidates = v;
        }
        if let Some(v) = self.char_budget {
            config.char_budget = v;
        }
        if let Some(v) = self.min_confidence {
            config.min_confidence = v;
        }
        if self.single_pass {
            config.max_passes = 1;
        } else if let Some(v) = self.max_passes {
            config.max_passes = v;
        }
        config.limit = self.limit;
        config
    }

    /// Runs dedup to convergence (or one pass, with `--single-pass`) and
    /// writes a one-line summary.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub async fn run<W: Write>(&self, runtime: &Runtime, writer: &mut W) -> Result<()> {
        let engine = DedupEngine::new(
            runtime.store.clone(),
            runtime.embedder.clone(),
            runtime.llm.clone(),
            Some(runtime.vector_index.clone()),
        );
        let summary = engine.run(&self.config()).await?;

        writeln!(
            writer,
            "processed {}, merged {}, verified {}, failed {}, passes {}",
            summary.processed, summary.merged, summary.verified, summary.failed, summary.passes
        )
        .map_err(io_err)?;
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> crate::Error {
    crate::Error::OperationFailed { operation: "cli_write".to_string(), cause: e.to_string() }
}
