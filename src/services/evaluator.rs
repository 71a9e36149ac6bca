//! The relevance evaluator (component F, §4.F).
//!
//! For each completed session, sends the shown-engram set and a
//! transcript excerpt to the external scorer and folds per-tag scores
//! into the EMA table with evidence counters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use crate::llm::{ExternalLlm, extract_json_from_response};
use crate::models::{SessionStatus, TagRelevance};
use crate::storage::EngramStore;
use crate::Result;

/// Tail length kept from a transcript excerpt, per §4.F step 2.
const TRANSCRIPT_MAX_CHARS: usize = 4096;
/// Per-message truncation applied before joining, mirroring the
/// original's per-line cap so one verbose turn cannot crowd out the
/// rest of the excerpt.
const PER_MESSAGE_MAX_CHARS: usize = 500;
/// How many most-recently-modified transcripts to check by content when
/// no filename match exists.
const GLOB_SEARCH_LIMIT: usize = 20;

/// One scored engram returned by the external evaluator.
#[derive(Debug, Clone, Deserialize)]
struct Evaluation {
    engram_id: i64,
    #[serde(default)]
    tag_scores: HashMap<String, f32>,
    #[allow(dead_code)]
    #[serde(default)]
    reason: Option<String>,
}

/// Outcome of processing one session-audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The scorer returned a usable evaluation and the EMA table was updated.
    Completed,
    /// Nothing to evaluate (no shown engrams, or all have been deleted).
    NothingToDo,
    /// The scorer failed (timeout, bad exit, unparsable output, or empty result).
    Failed,
}

/// Aggregate result of a `run_pending` pass.
#[derive(Debug, Clone, Default)]
pub struct EvaluationSummary {
    /// Sessions folded successfully into the EMA table.
    pub completed: usize,
    /// Sessions marked failed (retry counter incremented).
    pub failed: usize,
    /// Sessions skipped because they carried no shown engrams.
    pub skipped: usize,
}

/// Folds session outcomes into the store's tag-relevance EMA table.
pub struct RelevanceEvaluator {
    store: Arc<dyn EngramStore>,
    llm: ExternalLlm,
    transcripts_root: PathBuf,
}

impl RelevanceEvaluator {
    /// Creates an evaluator over `store`, invoking `llm` for scoring and
    /// searching `transcripts_root` (normally `~/.claude/projects`) when
    /// an audit row's stored transcript path is missing or unreadable.
    #[must_use]
    pub fn new(store: Arc<dyn EngramStore>, llm: ExternalLlm, transcripts_root: PathBuf) -> Self {
        Self { store, llm, transcripts_root }
    }

    /// Processes every unprocessed session-audit row (§4.F): those with
    /// no `completed` marker and `retry_count < 3`, in creation order.
    ///
    /// # Errors
    /// Returns an error on a storage failure; an external-LLM or
    /// transcript-resolution failure is recorded per-session instead of
    /// propagated.
    pub async fn run_pending(&self) -> Result<EvaluationSummary> {
        self.run_pending_limited(None).await
    }

    /// As [`Self::run_pending`], but stops after `limit` sessions have
    /// been considered (retryable or not). `None` processes everything
    /// eligible, matching `run_maintenance`'s optional `evaluate_limit`.
    ///
    /// # Errors
    /// Returns an error on a storage failure; an external-LLM or
    /// transcript-resolution failure is recorded per-session instead of
    /// propagated.
    pub async fn run_pending_limited(&self, limit: Option<usize>) -> Result<EvaluationSummary> {
        let mut summary = EvaluationSummary::default();
        let mut considered = 0usize;
        for (audit, marker) in self.store.unprocessed_session_audits()? {
            if limit.is_some_and(|l| considered >= l) {
                break;
            }
            considered += 1;
            if !marker.is_retryable() {
                continue;
            }
            match self.evaluate_session(&audit.session_id).await? {
                SessionOutcome::Completed => summary.completed += 1,
                SessionOutcome::NothingToDo => summary.skipped += 1,
                SessionOutcome::Failed => summary.failed += 1,
            }
        }
        Ok(summary)
    }

    /// Evaluates a single session by id (§4.F steps 1-5).
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub async fn evaluate_session(&self, session_id: &str) -> Result<SessionOutcome> {
        let Some((audit, _)) =
            self.store.unprocessed_session_audits()?.into_iter().find(|(a, _)| a.session_id == session_id)
        else {
            return Ok(SessionOutcome::NothingToDo);
        };

        if audit.shown_engram_ids.is_empty() {
            self.store.mark_session_processed(session_id, SessionStatus::Completed, Utc::now())?;
            return Ok(SessionOutcome::NothingToDo);
        }

        let engrams = self.store.get_many(&audit.shown_engram_ids)?;
        if engrams.is_empty() {
            self.store.mark_session_processed(session_id, SessionStatus::Completed, Utc::now())?;
            return Ok(SessionOutcome::NothingToDo);
        }

        let transcript = audit
            .transcript_path
            .as_deref()
            .and_then(|p| read_transcript_tail(Path::new(p), TRANSCRIPT_MAX_CHARS))
            .or_else(|| find_transcript_excerpt(&self.transcripts_root, session_id, TRANSCRIPT_MAX_CHARS));

        let prompt = build_evaluation_prompt(
            audit.repo.as_deref(),
            &audit.env_tags,
            &engrams.iter().map(|e| (e.id.as_i64(), e.text.clone())).collect::<Vec<_>>(),
            transcript.as_deref(),
        );

        let outcome = match self.llm.complete(&prompt).await {
            Ok(response) => self.apply_evaluations(&response),
            Err(_) => false,
        };

        if outcome {
            self.store.mark_session_processed(session_id, SessionStatus::Completed, Utc::now())?;
            Ok(SessionOutcome::Completed)
        } else {
            self.store.mark_session_processed(session_id, SessionStatus::Failed, Utc::now())?;
            Ok(SessionOutcome::Failed)
        }
    }

    /// Parses the scorer's response and folds every valid evaluation into
    /// the EMA table. Returns `false` if the response was empty or
    /// entirely unparsable (§4.F step 5's failure condition).
    fn apply_evaluations(&self, response: &str) -> bool {
        let json = extract_json_from_response(response);
        let Ok(evaluations) = serde_json::from_str::<Vec<Evaluation>>(json) else {
            return false;
        };
        if evaluations.is_empty() {
            return false;
        }

        let now = Utc::now();
        let mut folded_any = false;
        for evaluation in evaluations {
            if evaluation.tag_scores.is_empty() {
                continue;
            }
            if self
                .store
                .update_tag_relevance(evaluation.engram_id.into(), &evaluation.tag_scores, 1.0, now)
                .is_ok()
            {
                folded_any = true;
            }
        }
        folded_any
    }
}

/// `new = clamp(old*(1-α) + raw*α*weight, -1, 1)`, exposed standalone so
/// storage backends can share the exact math without depending on the
/// evaluator for it (§4.F "EMA math").
#[must_use]
pub fn fold_ema(existing: Option<&TagRelevance>, raw: f32, weight: f32, now: chrono::DateTime<Utc>) -> TagRelevance {
    let mut relevance = existing.cloned().unwrap_or_else(|| TagRelevance::new(0i64.into(), String::new(), now));
    relevance.fold(raw, weight, now);
    relevance
}

fn build_evaluation_prompt(repo: Option<&str>, env_tags: &[String], engrams: &[(i64, String)], transcript: Option<&str>) -> String {
    let engrams_block =
        engrams.iter().map(|(id, text)| format!("- ID {id}: {text}")).collect::<Vec<_>>().join("\n");

    format!(
        "You are evaluating which engrams were relevant during a coding session.\n\n\
         Each engram was shown to the assistant during the session. Based on the transcript, \
         determine how relevant each engram was to the actual work done, broken down by \
         environment tag.\n\n\
         Session info:\n\
         - Repository: {}\n\
         - Environment tags: {}\n\n\
         Engrams shown (ID and text):\n{engrams_block}\n\n\
         Session transcript excerpt:\n{}\n\n\
         For each engram, output a JSON object with:\n\
         - \"engram_id\": the engram ID number\n\
         - \"tag_scores\": a map from each relevant environment tag to a score from -1.0 to 1.0 \
           (-1.0 = actively wrong or misleading in this context, 0 = irrelevant, 1.0 = very helpful)\n\
         - \"reason\": optional brief explanation, only for negative scores\n\n\
         Output ONLY a valid JSON array. No markdown fences, no explanation.",
        repo.unwrap_or("unknown"),
        serde_json::to_string(env_tags).unwrap_or_default(),
        transcript.unwrap_or("(transcript not available)"),
    )
}

/// Reads `path` directly, keeping only `user`/`assistant` message text
/// and truncating to the last `max_chars` characters.
fn read_transcript_tail(path: &Path, max_chars: usize) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    Some(tail_messages(&contents, max_chars))
}

/// Searches `root` for a transcript matching `session_id`: first by
/// filename (`<root>/*/<session_id>.jsonl`), then by content (the
/// `GLOB_SEARCH_LIMIT` most recently modified files), matching §4.F
/// step 2's fallback.
fn find_transcript_excerpt(root: &Path, session_id: &str, max_chars: usize) -> Option<String> {
    if !root.exists() {
        return None;
    }

    let mut by_name = None;
    let mut all_jsonl: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

    for project_dir in std::fs::read_dir(root).ok()?.filter_map(std::result::Result::ok) {
        let project_path = project_dir.path();
        if !project_path.is_dir() {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(&project_path) else { continue };
        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if path.extension().and_then(std::ffi::OsStr::to_str) != Some("jsonl") {
                continue;
            }
            if path.file_stem().and_then(std::ffi::OsStr::to_str) == Some(session_id) {
                by_name = Some(path.clone());
            }
            let modified = entry.metadata().and_then(|m| m.modified()).unwrap_or(std::time::UNIX_EPOCH);
            all_jsonl.push((path, modified));
        }
    }

    if let Some(path) = by_name {
        return read_transcript_tail(&path, max_chars);
    }

    all_jsonl.sort_by(|a, b| b.1.cmp(&a.1));
    for (path, _) in all_jsonl.into_iter().take(GLOB_SEARCH_LIMIT) {
        if let Ok(file) = std::fs::File::open(&path) {
            use std::io::BufRead;
            let mut lines = std::io::BufReader::new(file).lines();
            if let Some(Ok(first_line)) = lines.next() {
                if first_line.contains(session_id) {
                    return read_transcript_tail(&path, max_chars);
                }
            }
        }
    }

    None
}

/// Parses newline-delimited transcript entries, keeps `user`/`assistant`
/// message text (flattening content-block arrays to their `text`
/// parts), and returns the joined tail truncated to `max_chars`.
pub(crate) fn tail_messages(contents: &str, max_chars: usize) -> String {
    let mut lines = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<serde_json::Value>(line) else { continue };
        let entry_type = entry.get("type").and_then(serde_json::Value::as_str).unwrap_or("");
        if entry_type != "user" && entry_type != "assistant" {
            continue;
        }
        let message = entry.get("message").cloned().unwrap_or(serde_json::Value::Null);
        let content = message.get("content").cloned().unwrap_or(serde_json::Value::Null);
        let text = match content {
            serde_json::Value::String(s) => s,
            serde_json::Value::Array(parts) => parts
                .iter()
                .filter(|p| p.get("type").and_then(serde_json::Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(serde_json::Value::as_str))
                .collect::<Vec<_>>()
                .join(" "),
            _ => continue,
        };
        if text.is_empty() {
            continue;
        }
        let role = message.get("role").and_then(serde_json::Value::as_str).unwrap_or(entry_type);
        let truncated: String = text.chars().take(PER_MESSAGE_MAX_CHARS).collect();
        lines.push(format!("{role}: {truncated}"));
    }

    let joined = lines.join("\n");
    if joined.chars().count() > max_chars {
        let skip = joined.chars().count() - max_chars;
        joined.chars().skip(skip).collect()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_messages_keeps_only_user_and_assistant_roles() {
        let contents = r#"{"type":"user","message":{"role":"user","content":"hello"}}
{"type":"system","message":{"role":"system","content":"ignored"}}
{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hi there"}]}}"#;
        let tail = tail_messages(contents, 4096);
        assert!(tail.contains("user: hello"));
        assert!(tail.contains("assistant: hi there"));
        assert!(!tail.contains("ignored"));
    }

    #[test]
    fn tail_messages_truncates_to_max_chars() {
        let long_text = "x".repeat(10_000);
        let contents = format!(r#"{{"type":"user","message":{{"role":"user","content":"{long_text}"}}}}"#);
        let tail = tail_messages(&contents, 100);
        assert!(tail.chars().count() <= 100);
    }

    #[test]
    fn build_evaluation_prompt_includes_engram_ids_and_tags() {
        let prompt = build_evaluation_prompt(
            Some("my-repo"),
            &["rust".to_string()],
            &[(1, "use rebase not merge".to_string())],
            Some("some transcript"),
        );
        assert!(prompt.contains("ID 1"));
        assert!(prompt.contains("my-repo"));
        assert!(prompt.contains("rust"));
        assert!(prompt.contains("some transcript"));
    }

    #[test]
    fn find_transcript_excerpt_matches_by_filename() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("proj1");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(
            project.join("abc123.jsonl"),
            r#"{"type":"user","message":{"role":"user","content":"fix the bug"}}"#,
        )
        .unwrap();

        let excerpt = find_transcript_excerpt(dir.path(), "abc123", 4096).unwrap();
        assert!(excerpt.contains("fix the bug"));
    }

    #[test]
    fn missing_transcripts_root_yields_none() {
        assert!(find_transcript_excerpt(Path::new("/nonexistent/path/xyz"), "abc", 4096).is_none());
    }
}
