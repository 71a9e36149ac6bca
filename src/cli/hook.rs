//! Hook CLI command: the subprocess entry point the host assistant's
//! hook runtime invokes per event.

use std::io::{Read, Write};
use std::sync::Arc;

use clap::Args;

use super::Runtime;
use crate::Result;
use crate::hooks::{
    HookContext, HookHandler, PreToolUseHandler, SessionStartHandler, StopHandler,
    UserPromptHandler,
};

/// Dispatches one hook invocation by reading a JSON payload from stdin
/// and writing the handler's JSON response to stdout.
///
/// Hook-exceptional (§7): any failure below is logged and answered with
/// an empty object rather than propagated, so a broken hook never blocks
/// the host assistant. The process still exits 0 in that case — only a
/// failure to even read stdin is treated as a CLI-usage error.
#[derive(Debug, Clone, Default, Args)]
pub struct HookArgs {
    /// Overrides the event name instead of reading `hook_event_name`
    /// from the payload (useful for manual testing).
    #[arg(long)]
    pub event: Option<String>,
}

impl HookArgs {
    /// Reads the payload, dispatches to the matching handler, and writes
    /// the response.
    ///
    /// # Errors
    /// Returns an error only if stdin cannot be read or stdout cannot be
    /// written; handler failures are caught and logged instead.
    pub fn run<W: Write>(&self, runtime: &Runtime, writer: &mut W) -> Result<()> {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw).map_err(io_err)?;
        let input: serde_json::Value = serde_json::from_str(&raw).unwrap_or_default();

        let event = self
            .event
            .clone()
            .or_else(|| input.get("hook_event_name").and_then(serde_json::Value::as_str).map(str::to_string))
            .unwrap_or_default();

        let context = Arc::new(HookContext {
            store: Arc::clone(&runtime.store),
            retriever: Arc::clone(&runtime.retriever),
            environment: Arc::clone(&runtime.environment),
            config: runtime.config.clone(),
        });

        let response = dispatch(&event, context, &input);
        writeln!(writer, "{response}").map_err(io_err)?;
        Ok(())
    }
}

fn dispatch(event: &str, context: Arc<HookContext>, input: &serde_json::Value) -> serde_json::Value {
    let result = match event {
        "SessionStart" => SessionStartHandler::new(context).handle(input),
        "UserPromptSubmit" => UserPromptHandler::new(context).handle(input),
        "PreToolUse" => PreToolUseHandler::new(context).handle(input),
        "Stop" => StopHandler::new(context).handle(input),
        other => {
            tracing::warn!("unrecognized hook event: {other}");
            Ok(serde_json::json!({}))
        }
    };

    result.unwrap_or_else(|e| {
        tracing::error!("hook {event} failed: {e}");
        serde_json::json!({})
    })
}

fn io_err(e: std::io::Error) -> crate::Error {
    crate::Error::OperationFailed { operation: "cli_hook_io".to_string(), cause: e.to_string() }
}
