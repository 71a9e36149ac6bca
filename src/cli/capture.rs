//! Capture CLI commands: `add` and `deprecate`.

use std::io::Write;

use chrono::Utc;
use clap::Args;

use super::Runtime;
use crate::Result;
use crate::models::{Prerequisites, Source, normalize_category};

/// Adds an engram directly (§4.B `add`), bypassing the extractor.
#[derive(Debug, Clone, Args)]
pub struct AddArgs {
    /// The lesson text (one to two actionable sentences).
    pub text: String,
    /// Primary category path, slash-delimited.
    pub category: String,
    /// Additional category paths.
    #[arg(long = "extra-category")]
    pub extra_categories: Vec<String>,
    /// Prerequisites as a JSON object; malformed input is treated as no
    /// prerequisites (§4.B "malformed prerequisite").
    #[arg(long)]
    pub prerequisites: Option<String>,
    /// Pins the engram immediately after creation.
    #[arg(long)]
    pub pin: bool,
}

impl AddArgs {
    /// Runs the add and writes the new engram's id to `writer`.
    ///
    /// # Errors
    /// Returns an error if the category normalizes to empty or on a
    /// storage failure.
    pub fn run<W: Write>(&self, runtime: &Runtime, writer: &mut W) -> Result<()> {
        let category = normalize_category(&self.category)?;
        let prerequisites = Prerequisites::from_json_lenient(
            self.prerequisites.as_deref().map(|s| serde_json::Value::String(s.to_string())).as_ref(),
        );
        let now = Utc::now();
        let id = runtime.store.add(
            &self.text,
            &category,
            &self.extra_categories,
            Source::Manual,
            None,
            prerequisites.clone(),
            now,
        )?;

        if self.pin {
            runtime.store.pin(id, prerequisites, now)?;
        }

        writeln!(writer, "added EG#{id}").map_err(io_err)?;
        Ok(())
    }
}

/// Soft-deletes an engram (§4.B `deprecate`). Idempotent.
#[derive(Debug, Clone, Args)]
pub struct DeprecateArgs {
    /// Id of the engram to deprecate.
    pub id: i64,
}

impl DeprecateArgs {
    /// Runs the deprecation and confirms it on `writer`.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub fn run<W: Write>(&self, runtime: &Runtime, writer: &mut W) -> Result<()> {
        let id = crate::models::EngramId::new(self.id);
        runtime.store.deprecate(id, Utc::now())?;
        writeln!(writer, "deprecated EG#{id}").map_err(io_err)?;
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> crate::Error {
    crate::Error::OperationFailed { operation: "cli_write".to_string(), cause: e.to_string() }
}
