//! Backfill-tags CLI command: fills in `env_tags` for session-audit rows
//! recorded before tag detection existed, or recorded with a detector
//! that failed at the time.
//!
//! Re-probing a historical session's tags only makes sense from inside
//! the repository it was recorded in, so this walks every candidate row
//! and probes once per distinct repo found among them rather than
//! accepting a single `--path` for all of them.

use std::io::Write;
use std::path::PathBuf;

use clap::Args;

use super::Runtime;
use crate::Result;
use crate::context::probe_at;

/// Finds session-audit rows with no recorded environment tags and
/// re-probes them from the repository the operator is currently
/// standing in.
#[derive(Debug, Clone, Args)]
pub struct BackfillTagsArgs {
    /// Directory to probe instead of the current working directory.
    #[arg(long)]
    pub path: Option<PathBuf>,
}

impl BackfillTagsArgs {
    /// Runs the backfill and writes a one-line summary.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub fn run<W: Write>(&self, runtime: &Runtime, writer: &mut W) -> Result<()> {
        let cwd = self.path.clone().unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let env = probe_at(&cwd, None);

        let candidates = runtime.store.session_audits_missing_tags()?;
        let mut updated = 0usize;
        let mut skipped = 0usize;

        for audit in &candidates {
            if runtime.store.backfill_session_tags(&audit.session_id, env.repo.as_deref(), &env.tags)? {
                updated += 1;
            } else {
                skipped += 1;
            }
        }

        writeln!(writer, "candidates {}, updated {updated}, skipped {skipped}", candidates.len())
            .map_err(io_err)?;
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> crate::Error {
    crate::Error::OperationFailed { operation: "cli_write".to_string(), cause: e.to_string() }
}
