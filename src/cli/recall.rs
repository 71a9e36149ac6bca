//! Recall CLI commands: `search` and `pinned`.

use std::io::{self, Write};

use clap::Args;
use serde::Serialize;

use super::Runtime;
use crate::Result;
use crate::models::{Engram, SearchFilter};

/// Runs the hybrid retriever against a query (§4.D), the same path the
/// `UserPromptSubmit` hook uses.
#[derive(Debug, Clone, Args)]
pub struct SearchArgs {
    /// Query text.
    pub query: String,
    /// Number of results to return.
    #[arg(long, default_value_t = crate::services::retriever::DEFAULT_PROMPT_TOP_K)]
    pub top_k: usize,
    /// Keep only engrams whose category starts with this prefix.
    #[arg(long)]
    pub category: Option<String>,
    /// Keep only engrams that declare all of these tags (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,
    /// Emit JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct HitRow {
    id: i64,
    category: String,
    text: String,
    score: f32,
    vector_score: Option<f32>,
    bm25_score: Option<f32>,
}

impl SearchArgs {
    /// Runs the search and writes the result to `writer`.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub fn run<W: Write>(&self, runtime: &Runtime, writer: &mut W) -> Result<()> {
        let filter = SearchFilter {
            category_prefix: self.category.clone(),
            tag_filter: if self.tags.is_empty() { None } else { Some(self.tags.clone()) },
        };
        let session_id = format!("cli-{}", uuid::Uuid::new_v4());
        let hits =
            runtime.retriever.search(&self.query, &filter, self.top_k, &session_id, "cli_search")?;

        let ids: Vec<_> = hits.iter().map(|h| h.engram_id).collect();
        let engrams = runtime.store.get_many(&ids)?;
        let by_id: std::collections::HashMap<_, _> = engrams.iter().map(|e| (e.id, e)).collect();

        let rows: Vec<HitRow> = hits
            .iter()
            .filter_map(|hit| {
                let engram = *by_id.get(&hit.engram_id)?;
                Some(HitRow {
                    id: engram.id.as_i64(),
                    category: engram.category.clone(),
                    text: engram.text.clone(),
                    score: hit.score,
                    vector_score: hit.vector_score,
                    bm25_score: hit.bm25_score,
                })
            })
            .collect();

        write_rows(writer, &rows, self.json)
    }
}

/// Returns pinned engrams matching the current environment (§4.H
/// `pinned {}`), bypassing ranking entirely.
#[derive(Debug, Clone, Default, Args)]
pub struct PinnedArgs {
    /// Emit JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

impl PinnedArgs {
    /// Runs the lookup and writes the result to `writer`.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub fn run<W: Write>(&self, runtime: &Runtime, writer: &mut W) -> Result<()> {
        let engrams = runtime.retriever.pinned()?;
        let rows: Vec<HitRow> = engrams
            .iter()
            .map(|e: &Engram| HitRow {
                id: e.id.as_i64(),
                category: e.category.clone(),
                text: e.text.clone(),
                score: 0.0,
                vector_score: None,
                bm25_score: None,
            })
            .collect();
        write_rows(writer, &rows, self.json)
    }
}

fn write_rows<W: Write>(writer: &mut W, rows: &[HitRow], json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(rows)
            .map_err(|e| crate::Error::OperationFailed { operation: "cli_json".to_string(), cause: e.to_string() })?;
        writeln!(writer, "{text}").map_err(io_err)?;
        return Ok(());
    }

    if rows.is_empty() {
        writeln!(writer, "no matches").map_err(io_err)?;
        return Ok(());
    }

    for row in rows {
        writeln!(writer, "EG#{:<6} [{}] {}", row.id, row.category, row.text).map_err(io_err)?;
    }
    Ok(())
}

fn io_err(e: io::Error) -> crate::Error {
    crate::Error::OperationFailed { operation: "cli_write".to_string(), cause: e.to_string() }
}
