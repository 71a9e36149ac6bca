//! The request server (component H, §4.H).
//!
//! A long-lived Unix-socket daemon that keeps the embedding model warm and
//! serves `search`/`tool_context`/`pinned`/`ping` requests without ever
//! touching the LLM. `run_maintenance` is the one request type that does
//! something slower: it forks detached OS subprocesses (re-invoking this
//! binary's `extract`/`evaluate` subcommands with the internal-run env
//! flag set) rather than running extraction or evaluation in-process, so a
//! stuck LLM call never blocks the accept loop or shares the daemon's
//! SQLite connection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};

use crate::llm::INTERNAL_RUN_ENV_VAR;
use crate::models::{Engram, SearchFilter, SearchHit};
use crate::storage::EngramStore;
use crate::{Error, Result};

use super::retriever::{DEFAULT_PROMPT_TOP_K, DEFAULT_TOOL_TOP_K, HybridRetriever, build_tool_query};

/// How often the accept loop wakes up even with no connection pending;
/// also the granularity of the idle-timeout check.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Shuts the daemon down after this much time with no handled request
/// (§4.H).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// One of the two maintenance jobs `run_maintenance` may spawn. Kept
/// distinct from the CLI's own subcommand enum since the daemon only
/// needs the subcommand name and a single-flight key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MaintenanceTask {
    Extract,
    Evaluate,
}

impl MaintenanceTask {
    const fn subcommand(self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Evaluate => "evaluate",
        }
    }
}

/// Filesystem paths the daemon owns under the engrammar home directory.
pub struct ServerPaths {
    /// Unix domain socket the daemon listens on.
    pub socket: PathBuf,
    /// PID file written on startup and removed on clean shutdown.
    pub pid: PathBuf,
}

impl ServerPaths {
    /// Derives the conventional socket and PID file locations under
    /// `home` (`.daemon.sock` / `.daemon.pid`, §6 "Host paths").
    #[must_use]
    pub fn under(home: &Path) -> Self {
        Self { socket: home.join(".daemon.sock"), pid: home.join(".daemon.pid") }
    }
}

/// The long-lived retrieval daemon.
pub struct RequestServer {
    store: Arc<dyn EngramStore>,
    retriever: Arc<HybridRetriever>,
    paths: ServerPaths,
    /// Path to this binary, re-invoked for maintenance subprocesses.
    binary: PathBuf,
    start_time: Instant,
    last_activity: Mutex<Instant>,
    running: Arc<AtomicBool>,
    maintenance: Mutex<HashMap<MaintenanceTask, Child>>,
}

impl RequestServer {
    /// Composes the daemon over a store and retriever already wired to
    /// the vector index, embedder, and environment probe; `binary` is the
    /// path re-invoked for `run_maintenance`'s detached subprocesses.
    #[must_use]
    pub fn new(
        store: Arc<dyn EngramStore>,
        retriever: Arc<HybridRetriever>,
        paths: ServerPaths,
        binary: PathBuf,
    ) -> Self {
        Self {
            store,
            retriever,
            paths,
            binary,
            start_time: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            running: Arc::new(AtomicBool::new(true)),
            maintenance: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the accept loop until idle timeout, a `shutdown` request, or
    /// SIGINT/SIGTERM. Removes the socket and PID files before returning.
    ///
    /// If another daemon already owns the socket, returns immediately
    /// without disturbing it (§4.H "stale-socket detection" — the
    /// inverse case, a *live* socket, just means this instance loses the
    /// race and exits).
    ///
    /// # Errors
    /// Returns an error if the PID file cannot be written or the socket
    /// cannot be bound.
    pub async fn run(&self) -> Result<()> {
        if self.another_daemon_is_running().await {
            tracing::info!("another daemon already owns the socket, exiting");
            return Ok(());
        }

        let _ = std::fs::remove_file(&self.paths.socket);
        std::fs::write(&self.paths.pid, std::process::id().to_string()).map_err(|e| {
            Error::OperationFailed { operation: "daemon_pid_write".to_string(), cause: e.to_string() }
        })?;

        let listener = UnixListener::bind(&self.paths.socket).map_err(|e| Error::OperationFailed {
            operation: "daemon_bind".to_string(),
            cause: e.to_string(),
        })?;

        let running = Arc::clone(&self.running);
        if let Err(e) = ctrlc::set_handler(move || running.store(false, Ordering::SeqCst)) {
            tracing::warn!("failed to install signal handler: {e}");
        }

        tracing::info!(
            pid = std::process::id(),
            socket = %self.paths.socket.display(),
            idle_timeout_secs = IDLE_TIMEOUT.as_secs(),
            "daemon started"
        );

        while self.running.load(Ordering::SeqCst) {
            if self.idle_for() > IDLE_TIMEOUT {
                tracing::info!("idle timeout reached, shutting down");
                break;
            }

            match tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, _))) => self.handle_connection(stream).await,
                Ok(Err(e)) => {
                    tracing::warn!("accept failed: {e}");
                    break;
                }
                Err(_) => {}
            }
        }

        let _ = std::fs::remove_file(&self.paths.socket);
        let _ = std::fs::remove_file(&self.paths.pid);
        tracing::info!("daemon stopped");
        Ok(())
    }

    /// A stale socket (daemon crashed without cleanup) connects with an
    /// error; a live one accepts. Mirrors daemon.py's connect-probe.
    async fn another_daemon_is_running(&self) -> bool {
        if !self.paths.socket.exists() {
            return false;
        }
        UnixStream::connect(&self.paths.socket).await.is_ok()
    }

    fn touch_activity(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().map(|t| t.elapsed()).unwrap_or_default()
    }

    /// One request, one response, newline-framed JSON, per connection
    /// (§4.H). The server is single-threaded and cooperative: a handler
    /// never awaits anything slower than a SQLite read or an already-spawned
    /// subprocess's launch.
    async fn handle_connection(&self, stream: UnixStream) {
        self.touch_activity();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let Ok(Some(line)) = lines.next_line().await else { return };

        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => self.handle_request(&request).await,
            Err(e) => json!({ "error": format!("invalid request: {e}") }),
        };

        let mut out = serde_json::to_vec(&response)
            .unwrap_or_else(|_| b"{\"error\":\"response serialization failed\"}".to_vec());
        out.push(b'\n');
        let _ = writer.write_all(&out).await;
    }

    async fn handle_request(&self, request: &Value) -> Value {
        match request.get("type").and_then(Value::as_str).unwrap_or("") {
            "search" => self.handle_search(request),
            "tool_context" => self.handle_tool_context(request),
            "pinned" => self.handle_pinned(),
            "ping" => self.handle_ping(),
            "run_maintenance" => self.handle_run_maintenance(request),
            "shutdown" => {
                self.running.store(false, Ordering::SeqCst);
                json!({ "status": "shutting_down" })
            }
            other => json!({ "error": format!("unknown request type: {other}") }),
        }
    }

    fn handle_search(&self, request: &Value) -> Value {
        let query = request.get("query").and_then(Value::as_str).unwrap_or("");
        let top_k = request
            .get("top_k")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_PROMPT_TOP_K, |n| n as usize);
        let session_id = request.get("session_id").and_then(Value::as_str).unwrap_or("daemon");
        let filter = SearchFilter {
            category_prefix: request.get("category_filter").and_then(Value::as_str).map(str::to_string),
            tag_filter: request
                .get("tag_filter")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()),
        };

        match self.retriever.search(query, &filter, top_k, session_id, "search") {
            Ok(hits) => json!({ "results": self.enrich_hits(&hits) }),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }

    fn handle_tool_context(&self, request: &Value) -> Value {
        let tool_name = request.get("tool_name").and_then(Value::as_str).unwrap_or("");
        let tool_input = request.get("tool_input").cloned().unwrap_or(Value::Null);
        let session_id = request.get("session_id").and_then(Value::as_str).unwrap_or("daemon");
        let query = build_tool_query(tool_name, &tool_input);

        match self.retriever.search(&query, &SearchFilter::default(), DEFAULT_TOOL_TOP_K, session_id, "tool_context") {
            Ok(hits) => json!({ "results": self.enrich_hits(&hits) }),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }

    fn handle_pinned(&self) -> Value {
        match self.retriever.pinned() {
            Ok(engrams) => json!({ "results": engrams.iter().map(engram_json).collect::<Vec<_>>() }),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }

    fn handle_ping(&self) -> Value {
        json!({
            "status": "ok",
            "pid": std::process::id(),
            "uptime_secs": self.start_time.elapsed().as_secs(),
            "idle_secs": self.idle_for().as_secs(),
        })
    }

    /// Kicks off extraction and evaluation as independent detached
    /// subprocesses, each single-flighted against its own previously
    /// spawned handle (§4.H / §5: "forked detached processes ... with
    /// independent write-ahead logging", not in-process tasks sharing this
    /// daemon's connection).
    fn handle_run_maintenance(&self, request: &Value) -> Value {
        let evaluate_limit = request.get("evaluate_limit").and_then(Value::as_u64);
        let extract = self.spawn_maintenance(MaintenanceTask::Extract, &[]);

        let evaluate_args: Vec<String> = evaluate_limit
            .map(|limit| vec!["--limit".to_string(), limit.to_string()])
            .unwrap_or_default();
        let evaluate = self.spawn_maintenance(MaintenanceTask::Evaluate, &evaluate_args);

        json!({ "extract": extract, "evaluate": evaluate })
    }

    fn spawn_maintenance(&self, task: MaintenanceTask, extra_args: &[String]) -> &'static str {
        let Ok(mut handles) = self.maintenance.lock() else { return "already_running" };

        if let Some(child) = handles.get_mut(&task) {
            match child.try_wait() {
                Ok(None) => return "already_running",
                _ => {
                    handles.remove(&task);
                }
            }
        }

        let mut command = Command::new(&self.binary);
        command
            .arg(task.subcommand())
            .args(extra_args)
            .env(INTERNAL_RUN_ENV_VAR, "1")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        match command.spawn() {
            Ok(child) => {
                handles.insert(task, child);
                "started"
            }
            Err(e) => {
                tracing::warn!("failed to spawn {}: {e}", task.subcommand());
                "already_running"
            }
        }
    }

    /// `SearchHit` carries only an id and scores; the response needs the
    /// engram's text and category, so this does the one extra round trip
    /// the hit list alone can't avoid.
    fn enrich_hits(&self, hits: &[SearchHit]) -> Vec<Value> {
        let ids: Vec<_> = hits.iter().map(|h| h.engram_id).collect();
        let engrams = self.store.get_many(&ids).unwrap_or_default();

        hits.iter()
            .filter_map(|hit| {
                let engram = engrams.iter().find(|e| e.id == hit.engram_id)?;
                let mut value = engram_json(engram);
                if let Value::Object(map) = &mut value {
                    map.insert("score".to_string(), json!(hit.score));
                    map.insert("vector_score".to_string(), json!(hit.vector_score));
                    map.insert("bm25_score".to_string(), json!(hit.bm25_score));
                }
                Some(value)
            })
            .collect()
    }
}

fn engram_json(engram: &Engram) -> Value {
    json!({
        "id": engram.id.as_i64(),
        "text": engram.text,
        "category": engram.category,
        "source": engram.source.to_string(),
        "pinned": engram.pinned,
        "occurrence_count": engram.occurrence_count,
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex as StdMutex};

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::context::{Environment, EnvironmentProbe};
    use crate::embedding::FallbackEmbedder;
    use crate::models::{Prerequisites, Source};
    use crate::storage::sqlite::{SqliteEngramStore, schema};
    use crate::storage::{MmapVectorIndex, VectorIndex};

    fn fixture(dir: &std::path::Path) -> (Arc<dyn EngramStore>, Arc<HybridRetriever>) {
        let conn = rusqlite::Connection::open(dir.join("store.db")).unwrap();
        let conn = StdMutex::new(conn);
        schema::migrate(&conn).unwrap();
        let store: Arc<dyn EngramStore> = Arc::new(SqliteEngramStore::new(conn));

        let embedder = Arc::new(FallbackEmbedder::new());
        let vector_index: Arc<dyn VectorIndex> =
            Arc::new(MmapVectorIndex::open(dir.join("vectors.bin"), embedder.dimensions()));
        let environment: Arc<dyn EnvironmentProbe> = Arc::new(StubEnvironment);

        let retriever = Arc::new(HybridRetriever::new(
            Arc::clone(&store),
            vector_index,
            embedder,
            environment,
        ));
        (store, retriever)
    }

    struct StubEnvironment;
    impl EnvironmentProbe for StubEnvironment {
        fn probe(&self) -> Environment {
            Environment {
                os: "linux".to_string(),
                repo: None,
                cwd: PathBuf::from("."),
                mcp_servers: Vec::new(),
                tags: Vec::new(),
            }
        }
    }

    fn server(dir: &std::path::Path) -> RequestServer {
        let (store, retriever) = fixture(dir);
        RequestServer::new(store, retriever, ServerPaths::under(dir), PathBuf::from("/bin/true"))
    }

    #[tokio::test]
    async fn unknown_request_type_is_a_graceful_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let response = server.handle_request(&json!({ "type": "nonsense" })).await;
        assert_eq!(response["error"], "unknown request type: nonsense");
    }

    #[tokio::test]
    async fn ping_reports_ok_with_uptime_and_idle_fields() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let response = server.handle_request(&json!({ "type": "ping" })).await;
        assert_eq!(response["status"], "ok");
        assert!(response["uptime_secs"].is_u64());
        assert!(response["idle_secs"].is_u64());
    }

    #[tokio::test]
    async fn search_enriches_hits_with_text_and_category() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _retriever) = fixture(dir.path());
        let server = server(dir.path());

        let now: DateTime<Utc> = Utc::now();
        store
            .add(
                "run cargo fmt before committing",
                "workflow/formatting",
                &[],
                Source::Manual,
                Some("s1"),
                Prerequisites::default(),
                now,
            )
            .unwrap();

        let response = server
            .handle_request(&json!({ "type": "search", "query": "cargo fmt", "session_id": "s1" }))
            .await;
        let results = response["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["category"], "workflow/formatting");
        assert!(results[0]["score"].is_number());
    }

    #[tokio::test]
    async fn pinned_request_lists_pinned_engrams_matching_environment() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _retriever) = fixture(dir.path());
        let server = server(dir.path());

        let now: DateTime<Utc> = Utc::now();
        let id = store
            .add(
                "always show this",
                "workflow/x",
                &[],
                Source::Manual,
                None,
                Prerequisites::default(),
                now,
            )
            .unwrap();
        store.pin(id, Prerequisites::default(), now).unwrap();

        let response = server.handle_request(&json!({ "type": "pinned" })).await;
        let results = response["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["id"], id.as_i64());
    }

    #[tokio::test]
    async fn shutdown_request_clears_the_running_flag() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        assert!(server.running.load(Ordering::SeqCst));
        let response = server.handle_request(&json!({ "type": "shutdown" })).await;
        assert_eq!(response["status"], "shutting_down");
        assert!(!server.running.load(Ordering::SeqCst));
    }

    #[test]
    fn server_paths_under_derives_conventional_names() {
        let home = PathBuf::from("/home/user/.engrammar");
        let paths = ServerPaths::under(&home);
        assert_eq!(paths.socket, home.join(".daemon.sock"));
        assert_eq!(paths.pid, home.join(".daemon.pid"));
    }
}
