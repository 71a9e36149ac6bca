//! The extractor (component J, §4.J).
//!
//! Turns friction signals from host-recorded session facets, or failing
//! that raw transcripts, into candidate engrams. A lexical word-overlap
//! check against the active pool runs before any new engram is inserted,
//! folding near-duplicates into the existing row instead of multiplying
//! entries for the same lesson; the vector index is rebuilt once per run
//! if — and only if — at least one brand-new engram was added.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::Result;
use crate::embedding::Embedder;
use crate::llm::{ExternalLlm, extract_json_from_response};
use crate::models::{Engram, EngramId, Prerequisites, Source};
use crate::services::evaluator::tail_messages;
use crate::storage::{EngramStore, VectorIndex};

/// Sessions batched per extraction call when working from facet data.
const MAX_LESSONS_PER_BATCH: usize = 30;
/// Tail length kept from a raw transcript before sending it for extraction.
const TRANSCRIPT_MAX_CHARS: usize = 8000;
/// Below this length a transcript is too thin to bother analyzing.
const MIN_TRANSCRIPT_CHARS: usize = 100;
/// Lexical pre-dedup threshold: word-overlap fraction of the smaller of
/// the two texts above which a newly extracted lesson folds into an
/// existing engram instead of being inserted as a new one.
const DEDUP_OVERLAP_THRESHOLD: f64 = 0.5;

/// keyword substring -> inferred `mcp_servers` prerequisite. Only
/// structural signals go here; tag prerequisites are left to the
/// tag-relevance EMA and auto-pin engine rather than guessed at
/// extraction time.
const KEYWORD_PREREQUISITES: &[(&str, &[&str])] =
    &[("figma mcp", &["figma"]), ("figma server", &["figma"])];

/// extraction topic -> category, checked before falling back to
/// `general/<topic>`.
const TOPIC_CATEGORY_MAP: &[(&str, &str)] = &[
    ("tool-usage", "tools/figma"),
    ("git-workflow", "development/git"),
    ("styling", "development/frontend/styling"),
    ("project-structure", "development/architecture"),
    ("code-patterns", "development/frontend/components"),
    ("jira-integration", "tools/jira"),
    ("pr-creation", "development/git/pr"),
    ("debugging", "development/debugging"),
    ("permissions", "tools/claude-code"),
    ("request-clarification", "workflow/communication"),
    ("instructions", "workflow/setup"),
];

fn category_for_topic(topic: &str) -> String {
    TOPIC_CATEGORY_MAP
        .iter()
        .find(|(t, _)| *t == topic)
        .map_or_else(|| format!("general/{topic}"), |(_, c)| (*c).to_string())
}

/// One lesson candidate returned by the external extraction call.
#[derive(Debug, Clone, Deserialize)]
struct ExtractedLesson {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    lesson: String,
    #[serde(default)]
    source_sessions: Vec<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    project_signals: Vec<String>,
}

/// One session facet file under the host's usage-data directory.
#[derive(Debug, Clone, Deserialize)]
struct SessionFacet {
    session_id: String,
    #[serde(default)]
    brief_summary: Option<String>,
    #[serde(default)]
    friction_detail: Option<String>,
    #[serde(default)]
    friction_counts: serde_json::Value,
    #[serde(default)]
    outcome: Option<String>,
}

impl SessionFacet {
    fn has_friction(&self) -> bool {
        self.friction_detail.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

/// Result of running extraction against session facets.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacetExtractionSummary {
    /// Facet files not previously seen by the extractor.
    pub new_sessions: usize,
    /// Of those, how many carried a recorded friction signal.
    pub with_friction: usize,
    /// New engrams inserted.
    pub extracted: usize,
    /// Extracted lessons folded into an existing engram instead.
    pub merged: usize,
}

/// Result of running extraction against raw transcripts.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranscriptExtractionSummary {
    /// Transcripts analyzed (including ones that yielded nothing).
    pub processed: usize,
    /// New engrams inserted.
    pub extracted: usize,
    /// Extracted lessons folded into an existing engram instead.
    pub merged: usize,
    /// Transcripts too short to bother sending for extraction.
    pub skipped: usize,
}

enum ImportOutcome {
    Added(EngramId),
    Merged(EngramId),
}

/// Produces candidate engrams from friction signals and imports them,
/// deduplicating lexically against the active pool.
pub struct Extractor {
    store: Arc<dyn EngramStore>,
    llm: ExternalLlm,
    embedder: Arc<dyn Embedder>,
    vector_index: Arc<dyn VectorIndex>,
    facets_dir: PathBuf,
    transcripts_root: PathBuf,
}

impl Extractor {
    /// Creates an extractor reading facets from `facets_dir` (normally
    /// `~/.claude/usage-data/facets`) and transcripts from
    /// `transcripts_root` (normally `~/.claude/projects`), scoring
    /// candidates with `llm` and rebuilding `vector_index` via `embedder`
    /// after a run that added at least one engram.
    #[must_use]
    pub fn new(
        store: Arc<dyn EngramStore>,
        llm: ExternalLlm,
        embedder: Arc<dyn Embedder>,
        vector_index: Arc<dyn VectorIndex>,
        facets_dir: PathBuf,
        transcripts_root: PathBuf,
    ) -> Self {
        Self { store, llm, embedder, vector_index, facets_dir, transcripts_root }
    }

    /// Runs extraction over every session-facet file not yet considered.
    /// `dry_run` analyzes which sessions would be sent for extraction
    /// without calling the external LLM or writing anything.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub async fn run_from_facets(&self, dry_run: bool) -> Result<FacetExtractionSummary> {
        let now = Utc::now();
        let mut summary = FacetExtractionSummary::default();

        let facets = load_facets(&self.facets_dir);
        if facets.is_empty() {
            return Ok(summary);
        }

        let mut new_facets = Vec::with_capacity(facets.len());
        for facet in facets {
            if !self.store.is_extraction_processed(&facet.session_id)? {
                new_facets.push(facet);
            }
        }
        summary.new_sessions = new_facets.len();

        let (friction, no_friction): (Vec<_>, Vec<_>) =
            new_facets.into_iter().partition(SessionFacet::has_friction);
        summary.with_friction = friction.len();

        if friction.is_empty() {
            if !dry_run {
                for facet in &no_friction {
                    self.store.mark_extraction_processed(&facet.session_id, false, 0, now)?;
                }
            }
            return Ok(summary);
        }

        if dry_run {
            return Ok(summary);
        }

        let mut all_extracted = Vec::new();
        for batch in friction.chunks(MAX_LESSONS_PER_BATCH) {
            let prompt = build_facet_prompt(batch);
            if let Ok(response) = self.llm.complete(&prompt).await
                && let Ok(lessons) =
                    serde_json::from_str::<Vec<ExtractedLesson>>(extract_json_from_response(&response))
            {
                all_extracted.extend(lessons);
            }
        }

        if all_extracted.is_empty() {
            for facet in &friction {
                self.store.mark_extraction_processed(&facet.session_id, true, 0, now)?;
            }
            for facet in &no_friction {
                self.store.mark_extraction_processed(&facet.session_id, false, 0, now)?;
            }
            return Ok(summary);
        }

        let mut active = self.store.list_active()?;
        for lesson in &all_extracted {
            let fallback = lesson.source_sessions.first().cloned().unwrap_or_default();
            match self.import_lesson(lesson, &fallback, &mut active, now)? {
                Some(ImportOutcome::Added(_)) => summary.extracted += 1,
                Some(ImportOutcome::Merged(_)) => summary.merged += 1,
                None => {}
            }
        }

        if summary.extracted > 0 {
            self.rebuild_index()?;
        }

        // Whether or not a specific friction session's own lesson survived
        // dedup, the batch call considered it: mark it processed with a
        // binary friction flag rather than trying to attribute extracted
        // count back to one session out of a batched call.
        for facet in &friction {
            self.store.mark_extraction_processed(&facet.session_id, true, 1, now)?;
        }
        for facet in &no_friction {
            self.store.mark_extraction_processed(&facet.session_id, false, 0, now)?;
        }

        Ok(summary)
    }

    /// Runs extraction over raw conversation transcripts not yet
    /// considered, most recently modified first. `limit` caps how many
    /// transcripts are examined in one run.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub async fn run_from_transcripts(
        &self,
        limit: Option<usize>,
        dry_run: bool,
    ) -> Result<TranscriptExtractionSummary> {
        let now = Utc::now();
        let mut summary = TranscriptExtractionSummary::default();

        if !self.transcripts_root.exists() {
            return Ok(summary);
        }

        let mut files = list_transcript_files(&self.transcripts_root);
        files.sort_by(|a, b| b.1.cmp(&a.1));
        if let Some(limit) = limit {
            files.truncate(limit);
        }

        let mut unprocessed = Vec::new();
        for (path, _) in files {
            let Some(session_id) = path.file_stem().and_then(std::ffi::OsStr::to_str) else { continue };
            if !self.store.is_extraction_processed(session_id)? {
                unprocessed.push((session_id.to_string(), path));
            }
        }

        if unprocessed.is_empty() {
            return Ok(summary);
        }

        let mut active = self.store.list_active()?;

        for (session_id, path) in unprocessed {
            let transcript = read_transcript_messages(&path, TRANSCRIPT_MAX_CHARS);
            if transcript.chars().count() < MIN_TRANSCRIPT_CHARS {
                summary.skipped += 1;
                if !dry_run {
                    self.store.mark_extraction_processed(&session_id, false, 0, now)?;
                }
                continue;
            }

            if dry_run {
                summary.processed += 1;
                continue;
            }

            let prompt = build_transcript_prompt(&transcript, &session_id);
            let extracted: Vec<ExtractedLesson> = match self.llm.complete(&prompt).await {
                Ok(response) => {
                    serde_json::from_str(extract_json_from_response(&response)).unwrap_or_default()
                }
                Err(_) => Vec::new(),
            };

            if extracted.is_empty() {
                self.store.mark_extraction_processed(&session_id, false, 0, now)?;
                summary.processed += 1;
                continue;
            }

            let mut added = 0usize;
            let mut merged = 0usize;
            for lesson in &extracted {
                match self.import_lesson(lesson, &session_id, &mut active, now)? {
                    Some(ImportOutcome::Added(_)) => added += 1,
                    Some(ImportOutcome::Merged(_)) => merged += 1,
                    None => {}
                }
            }

            self.store.mark_extraction_processed(&session_id, true, (added + merged) as u32, now)?;
            summary.processed += 1;
            summary.extracted += added;
            summary.merged += merged;
        }

        if summary.extracted > 0 && !dry_run {
            self.rebuild_index()?;
        }

        Ok(summary)
    }

    /// Imports one extracted lesson: dedups lexically against `active`,
    /// folding into the match if found (backfilling prerequisites only if
    /// the existing engram had none), otherwise inserting a new
    /// auto-extracted engram and keeping `active` current so later
    /// lessons in the same batch can dedup against it too.
    fn import_lesson(
        &self,
        lesson: &ExtractedLesson,
        fallback_session: &str,
        active: &mut Vec<Engram>,
        now: DateTime<Utc>,
    ) -> Result<Option<ImportOutcome>> {
        let text = lesson.lesson.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let topic = if lesson.topic.trim().is_empty() { "general" } else { lesson.topic.trim() };
        let source_sessions = if lesson.source_sessions.is_empty() {
            vec![fallback_session.to_string()]
        } else {
            lesson.source_sessions.clone()
        };

        let prerequisites = self.infer_prerequisites(text, lesson, &source_sessions);

        if let Some(existing_id) = find_similar_lesson(active, text) {
            self.store.fold_duplicate_sessions(existing_id, &source_sessions, now)?;
            if let Some(prereqs) = prerequisites {
                let needs_backfill =
                    self.store.get(existing_id)?.is_some_and(|e| e.prerequisites.is_empty());
                if needs_backfill {
                    self.store.update(existing_id, None, None, Some(prereqs), now)?;
                }
            }
            if let Some(engram) = active.iter_mut().find(|e| e.id == existing_id) {
                engram.occurrence_count = engram.source_sessions.len() as u32;
            }
            return Ok(Some(ImportOutcome::Merged(existing_id)));
        }

        let category = category_for_topic(topic);
        let mut sessions_iter = source_sessions.iter();
        let first_session = sessions_iter.next().map(String::as_str);
        let id = self.store.add(
            text,
            &category,
            &[],
            Source::AutoExtracted,
            first_session,
            prerequisites.unwrap_or_default(),
            now,
        )?;
        let remaining: Vec<String> = sessions_iter.cloned().collect();
        if !remaining.is_empty() {
            self.store.fold_duplicate_sessions(id, &remaining, now)?;
        }
        if let Some(new_engram) = self.store.get(id)? {
            active.push(new_engram);
        }

        Ok(Some(ImportOutcome::Added(id)))
    }

    /// Infers prerequisites from keywords in the lesson text and any
    /// project signals the extraction call returned. When that yields
    /// nothing and the lesson was flagged `project-specific`, falls back
    /// to the environment tags already recorded for its first source
    /// session, if any — a project-specific lesson starts scoped to where
    /// it was actually observed rather than matching everywhere.
    fn infer_prerequisites(
        &self,
        text: &str,
        lesson: &ExtractedLesson,
        source_sessions: &[String],
    ) -> Option<Prerequisites> {
        if let Some(prereqs) = infer_keyword_prerequisites(text, &lesson.project_signals) {
            return Some(prereqs);
        }
        if lesson.scope.as_deref() != Some("project-specific") {
            return None;
        }
        let session_id = source_sessions.first()?;
        let audit = self.store.session_audit(session_id).ok().flatten()?;
        if audit.env_tags.is_empty() {
            return None;
        }
        Some(Prerequisites { tags: Some(audit.env_tags), ..Prerequisites::default() })
    }

    /// Re-embeds every active engram and replaces the vector index
    /// wholesale. Called once per run when at least one new engram was
    /// added; a pure merge does not change the active text pool and so
    /// does not warrant a rebuild.
    fn rebuild_index(&self) -> Result<()> {
        let active = self.store.list_active()?;
        if active.is_empty() {
            return self.vector_index.build(&[]);
        }
        let texts: Vec<&str> = active.iter().map(|e| e.text.as_str()).collect();
        let embeddings = self.embedder.embed_batch(&texts)?;
        let items: Vec<(EngramId, Vec<f32>)> =
            active.iter().map(|e| e.id).zip(embeddings).collect();
        self.vector_index.build(&items)
    }
}

fn infer_keyword_prerequisites(text: &str, project_signals: &[String]) -> Option<Prerequisites> {
    let mut mcp_servers: Vec<String> = Vec::new();
    let text_lower = text.to_lowercase();

    for (keyword, servers) in KEYWORD_PREREQUISITES {
        if text_lower.contains(keyword) {
            for server in *servers {
                if !mcp_servers.iter().any(|s| s == server) {
                    mcp_servers.push((*server).to_string());
                }
            }
        }
    }

    for signal in project_signals {
        let signal_lower = signal.to_lowercase();
        for (keyword, servers) in KEYWORD_PREREQUISITES {
            if signal_lower.contains(keyword) || keyword.contains(signal_lower.as_str()) {
                for server in *servers {
                    if !mcp_servers.iter().any(|s| s == server) {
                        mcp_servers.push((*server).to_string());
                    }
                }
            }
        }
    }

    if mcp_servers.is_empty() {
        return None;
    }
    mcp_servers.sort();
    Some(Prerequisites { mcp_servers: Some(mcp_servers), ..Prerequisites::default() })
}

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase().split_whitespace().map(str::to_string).collect()
}

/// Finds an active engram whose text overlaps `text` by more than
/// [`DEDUP_OVERLAP_THRESHOLD`] of the smaller bag-of-words size.
fn find_similar_lesson(active: &[Engram], text: &str) -> Option<EngramId> {
    let text_words = word_set(text);
    if text_words.is_empty() {
        return None;
    }
    for engram in active {
        let lesson_words = word_set(&engram.text);
        if lesson_words.is_empty() {
            continue;
        }
        let smaller = text_words.len().min(lesson_words.len());
        let overlap = text_words.intersection(&lesson_words).count();
        if (overlap as f64 / smaller as f64) > DEDUP_OVERLAP_THRESHOLD {
            return Some(engram.id);
        }
    }
    None
}

fn load_facets(dir: &Path) -> Vec<SessionFacet> {
    let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
    let mut facets = Vec::new();
    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if path.extension().and_then(std::ffi::OsStr::to_str) != Some("json") {
            continue;
        }
        if let Ok(contents) = std::fs::read_to_string(&path)
            && let Ok(facet) = serde_json::from_str::<SessionFacet>(&contents)
        {
            facets.push(facet);
        }
    }
    facets
}

fn list_transcript_files(root: &Path) -> Vec<(PathBuf, std::time::SystemTime)> {
    let Ok(project_dirs) = std::fs::read_dir(root) else { return Vec::new() };
    let mut files = Vec::new();
    for project_dir in project_dirs.filter_map(std::result::Result::ok) {
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
            let modified = entry.metadata().and_then(|m| m.modified()).unwrap_or(std::time::UNIX_EPOCH);
            files.push((path, modified));
        }
    }
    files
}

fn read_transcript_messages(path: &Path, max_chars: usize) -> String {
    std::fs::read_to_string(path).map(|contents| tail_messages(&contents, max_chars)).unwrap_or_default()
}

fn build_facet_prompt(sessions: &[SessionFacet]) -> String {
    let sessions_block = sessions
        .iter()
        .map(|s| {
            format!(
                "Session {}:\n  Summary: {}\n  Friction: {}\n  Friction types: {}\n  Outcome: {}",
                s.session_id.chars().take(8).collect::<String>(),
                s.brief_summary.as_deref().unwrap_or("N/A"),
                s.friction_detail.as_deref().unwrap_or("N/A"),
                s.friction_counts,
                s.outcome.as_deref().unwrap_or("N/A"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are analyzing coding-assistant session data to extract SPECIFIC, ACTIONABLE lessons.\n\n\
         Do not produce generic advice like \"investigate methodically\" or \"ask for clarification\". \
         Produce concrete, reusable knowledge a future session could act on immediately — a corrected \
         approach, a project convention, a tool quirk, or a workaround for a specific gotcha.\n\n\
         Here are the session summaries and friction details:\n\n{sessions_block}\n\n\
         Output a JSON array of objects, each with:\n\
         - \"topic\": short category (e.g. \"browser-testing\", \"git-workflow\", \"styling\", \
           \"project-structure\", \"tool-usage\", \"pr-creation\")\n\
         - \"lesson\": the specific, concrete lesson (1-2 sentences max)\n\
         - \"source_sessions\": list of session IDs this was derived from\n\
         - \"scope\": \"general\" if the lesson applies to any project, or \"project-specific\" if it \
           only applies to a particular project, tool, or framework\n\
         - \"project_signals\": list of project/tool names when scope is \"project-specific\", empty \
           otherwise\n\n\
         Output ONLY valid JSON, no markdown fences, no explanation."
    )
}

fn build_transcript_prompt(transcript: &str, session_id: &str) -> String {
    format!(
        "You are analyzing a coding-assistant conversation transcript to extract SPECIFIC, ACTIONABLE \
         lessons.\n\n\
         Look for these signals:\n\
         - User corrections: the user steered the assistant away from an approach, tool, or pattern. \
           Capture what was wrong and the preferred alternative.\n\
         - Significant effort: the assistant spent multiple turns debugging or iterating. Capture the \
           root cause and fix so a future session skips the struggle.\n\
         - Discovered conventions: a project-specific pattern, naming rule, or workflow preference was \
           established. Capture it as a reusable rule.\n\
         - Environment or tooling quirks: a tool, API, or library behaved unexpectedly. Capture the gotcha \
           and workaround.\n\n\
         Do not produce generic advice like \"investigate methodically\". Each lesson should be something \
         that saves time if known in advance.\n\n\
         Session transcript:\n{transcript}\n\n\
         Output a JSON array of objects, each with:\n\
         - \"topic\": short category (e.g. \"browser-testing\", \"git-workflow\", \"styling\", \
           \"project-structure\", \"tool-usage\", \"pr-creation\")\n\
         - \"lesson\": the specific, concrete lesson (1-2 sentences max)\n\
         - \"source_sessions\": [\"{session_id}\"]\n\
         - \"scope\": \"general\" if the lesson applies broadly, or \"project-specific\" if it only \
           applies to a particular project or tool\n\
         - \"project_signals\": list of project/tool names when scope is \"project-specific\", empty \
           otherwise\n\n\
         If no lessons are worth extracting, output an empty array: []\n\n\
         Output ONLY valid JSON, no markdown fences, no explanation."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::{SqliteEngramStore, schema::migrate};
    use rusqlite::Connection;
    use std::sync::Mutex;

    fn store() -> SqliteEngramStore {
        let conn = Mutex::new(Connection::open_in_memory().unwrap());
        migrate(&conn).unwrap();
        SqliteEngramStore::new(conn)
    }

    #[test]
    fn category_for_topic_falls_back_to_general_prefix() {
        assert_eq!(category_for_topic("git-workflow"), "development/git");
        assert_eq!(category_for_topic("browser-testing"), "general/browser-testing");
    }

    #[test]
    fn infer_keyword_prerequisites_matches_text_substring() {
        let prereqs = infer_keyword_prerequisites("connect the figma mcp before starting", &[]).unwrap();
        assert_eq!(prereqs.mcp_servers, Some(vec!["figma".to_string()]));
    }

    #[test]
    fn infer_keyword_prerequisites_matches_project_signal_either_direction() {
        let prereqs =
            infer_keyword_prerequisites("use the design tool first", &["Figma MCP".to_string()]).unwrap();
        assert_eq!(prereqs.mcp_servers, Some(vec!["figma".to_string()]));
    }

    #[test]
    fn infer_keyword_prerequisites_none_when_no_match() {
        assert!(infer_keyword_prerequisites("use rebase not merge", &[]).is_none());
    }

    #[test]
    fn find_similar_lesson_requires_majority_overlap() {
        let s = store();
        let id = s
            .add(
                "always run cargo fmt before committing rust code",
                "general",
                &[],
                Source::AutoExtracted,
                None,
                Prerequisites::default(),
                Utc::now(),
            )
            .unwrap();
        let active = s.list_active().unwrap();

        let hit = find_similar_lesson(&active, "run cargo fmt before every commit of rust code");
        assert_eq!(hit, Some(id));

        let miss = find_similar_lesson(&active, "use the playwright mcp for browser automation");
        assert!(miss.is_none());
    }

    #[test]
    fn find_similar_lesson_ignores_empty_text() {
        let active = vec![];
        assert!(find_similar_lesson(&active, "").is_none());
    }

    #[tokio::test]
    async fn import_lesson_merges_into_existing_and_unions_sessions() {
        let store: Arc<dyn EngramStore> = Arc::new(store());
        let existing = store
            .add(
                "prefer rebase over merge for feature branches",
                "general",
                &[],
                Source::AutoExtracted,
                Some("s1"),
                Prerequisites::default(),
                Utc::now(),
            )
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let embedder = crate::embedding::FallbackEmbedder::new();
        let dims = embedder.dimensions();
        let extractor = Extractor::new(
            store.clone(),
            ExternalLlm::new("unused", None),
            Arc::new(embedder),
            Arc::new(crate::storage::MmapVectorIndex::open(dir.path().join("vectors.bin"), dims)),
            PathBuf::from("/nonexistent/facets"),
            PathBuf::from("/nonexistent/transcripts"),
        );

        let lesson = ExtractedLesson {
            topic: "git-workflow".to_string(),
            lesson: "rebase feature branches instead of merging them".to_string(),
            source_sessions: vec!["s2".to_string()],
            scope: Some("general".to_string()),
            project_signals: vec![],
        };

        let mut active = store.list_active().unwrap();
        let outcome = extractor.import_lesson(&lesson, "s2", &mut active, Utc::now()).unwrap();
        assert!(matches!(outcome, Some(ImportOutcome::Merged(id)) if id == existing));

        let merged = store.get(existing).unwrap().unwrap();
        assert_eq!(merged.source_sessions, vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(merged.occurrence_count, 2);
    }
}
