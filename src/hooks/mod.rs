//! Claude Code hooks: the host assistant's entry points into retrieval
//! and session bookkeeping.
//!
//! Each handler is deliberately thin — the real work lives in
//! [`crate::services::HybridRetriever`] and [`crate::storage::EngramStore`].
//! A handler's only job is to read the hook's JSON payload, decide
//! whether to act at all (config gates, skip lists), and format the
//! result as the wire block described in §6. Handlers never panic on a
//! malformed payload; the hook-exceptional error class (§7) means a
//! failure here is logged and the hook answers with nothing rather than
//! blocking the host assistant.

mod pre_tool_use;
mod session_start;
mod stop;
mod user_prompt;

pub use pre_tool_use::PreToolUseHandler;
pub use session_start::SessionStartHandler;
pub use stop::StopHandler;
pub use user_prompt::UserPromptHandler;

use std::sync::Arc;

use crate::Result;
use crate::config::EngrammarConfig;
use crate::context::EnvironmentProbe;
use crate::models::EngramId;
use crate::services::HybridRetriever;
use crate::storage::EngramStore;

/// Trait for hook handlers. Input and output are the JSON payloads the
/// host assistant's hook runtime exchanges with the subprocess it runs
/// per event.
pub trait HookHandler: Send + Sync {
    /// The hook event type this handler processes (e.g. `"SessionStart"`).
    fn event_type(&self) -> &'static str;

    /// Handles the hook event.
    ///
    /// # Errors
    /// Returns an error if handling fails. Callers at the process
    /// boundary (the `hook` CLI command) must catch this, log it to the
    /// error log, and emit an empty response rather than propagate it.
    fn handle(&self, input: &serde_json::Value) -> Result<serde_json::Value>;
}

/// The capabilities every hook handler is composed over. Shared behind
/// an `Arc` so `cli::hook` can build it once per process invocation and
/// hand it to whichever handler the event name selects.
pub struct HookContext {
    /// Durable engram table, session-audit ledger, shown-lesson log.
    pub store: Arc<dyn EngramStore>,
    /// Dense+lexical retrieval over the current environment.
    pub retriever: Arc<HybridRetriever>,
    /// Independent environment probe, used where a handler needs the
    /// raw environment snapshot rather than retrieval's internal one
    /// (the `Stop` handler's audit-row tags and repo).
    pub environment: Arc<dyn EnvironmentProbe>,
    /// Hook gating and display settings (§6 `hooks`/`display` sections).
    pub config: EngrammarConfig,
}

/// Builds the wire format exposed to the host assistant (§6): the
/// literal `[ENGRAMMAR_V1]`/`[/ENGRAMMAR_V1]` markers wrapping one line
/// per engram, followed by a feedback-tool instruction. `None` when
/// there is nothing to inject, so callers can skip emitting a block at
/// all rather than an empty one.
fn format_injection_block(engrams: &[(EngramId, &str, &str)], show_categories: bool) -> Option<String> {
    if engrams.is_empty() {
        return None;
    }

    let mut block = String::from("[ENGRAMMAR_V1]\n");
    for (id, category, text) in engrams {
        if show_categories {
            block.push_str(&format!("- [EG#{id}][{category}] {text}\n"));
        } else {
            block.push_str(&format!("- [EG#{id}] {text}\n"));
        }
    }
    block.push_str("[/ENGRAMMAR_V1]\n");
    block.push_str(
        "If a lesson above does not apply here, call the engrammar feedback tool to say so.\n",
    );
    Some(block)
}

/// Wraps a formatted injection block (or nothing) in the
/// `hookSpecificOutput.additionalContext` shape the host assistant's
/// hook runtime expects from `SessionStart`/`UserPromptSubmit`/
/// `PreToolUse` hooks.
fn additional_context_response(block: Option<String>) -> serde_json::Value {
    match block {
        Some(text) => serde_json::json!({
            "hookSpecificOutput": {
                "additionalContext": text,
            }
        }),
        None => serde_json::json!({}),
    }
}
