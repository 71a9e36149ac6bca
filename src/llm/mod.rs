//! External LLM subprocess interface (§6).
//!
//! The extraction, evaluation, and dedup model is an external
//! collaborator, not a library dependency: a subprocess that takes a
//! text prompt and returns a single text response on stdout. This module
//! owns only that boundary; prompt construction and response parsing
//! live with each caller ([`crate::services::evaluator`],
//! [`crate::services::dedup`], [`crate::services::extractor`]).

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::{Error, Result};

/// Environment variable set on spawned LLM subprocesses so the host
/// assistant's hook runtime does not treat the call as a live session
/// and recurse into retrieval.
pub const INTERNAL_RUN_ENV_VAR: &str = "ENGRAMMAR_INTERNAL_RUN";

/// Per-call subprocess timeout (§6).
pub const LLM_TIMEOUT: Duration = Duration::from_secs(300);

/// Invokes an external LLM binary as a subprocess, one prompt per call.
#[derive(Debug, Clone)]
pub struct ExternalLlm {
    binary: String,
    model: Option<String>,
}

impl ExternalLlm {
    /// Creates a client invoking `binary`, optionally pinning `--model`.
    #[must_use]
    pub fn new(binary: impl Into<String>, model: Option<String>) -> Self {
        Self { binary: binary.into(), model }
    }

    /// Sends `prompt` on stdin and returns the trimmed stdout text.
    ///
    /// Always passes `--no-session-persistence` and the internal-run
    /// environment flag, per the external interface contract.
    ///
    /// # Errors
    /// Returns [`Error::Transient`] if the binary cannot be spawned, the
    /// call exceeds [`LLM_TIMEOUT`], or the process exits non-zero.
    pub async fn complete(&self, prompt: &str) -> Result<String> {
        let mut command = Command::new(&self.binary);
        command
            .arg("--no-session-persistence")
            .env(INTERNAL_RUN_ENV_VAR, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(model) = &self.model {
            command.arg("--model").arg(model);
        }

        let mut child = command.spawn().map_err(|e| Error::Transient {
            operation: "llm_spawn".to_string(),
            cause: e.to_string(),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await.map_err(|e| Error::Transient {
                operation: "llm_write_stdin".to_string(),
                cause: e.to_string(),
            })?;
        }

        let output = timeout(LLM_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::Transient {
                operation: "llm_complete".to_string(),
                cause: format!("timed out after {LLM_TIMEOUT:?}"),
            })?
            .map_err(|e| Error::Transient {
                operation: "llm_complete".to_string(),
                cause: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Transient {
                operation: "llm_complete".to_string(),
                cause: format!("exited with {}: {}", output.status, stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Extracts a JSON value from LLM output, tolerating surrounding prose
/// or a markdown fenced code block — the common failure mode of a
/// text-completion model asked to return structured data.
#[must_use]
pub fn extract_json_from_response(response: &str) -> &str {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        let content_start = after_fence.find('\n').map_or(0, |i| i + 1);
        if let Some(end) = after_fence[content_start..].find("```") {
            return after_fence[content_start..content_start + end].trim();
        }
    }

    let obj = trimmed.find('{').zip(trimmed.rfind('}'));
    let arr = trimmed.find('[').zip(trimmed.rfind(']'));
    match (obj, arr) {
        (Some((os, _)), Some((as_, ae))) if as_ < os => &trimmed[as_..=ae],
        (Some((os, oe)), _) => &trimmed[os..=oe],
        (None, Some((as_, ae))) => &trimmed[as_..=ae],
        (None, None) => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_transient_error() {
        let llm = ExternalLlm::new("engrammar-llm-binary-that-does-not-exist", None);
        let err = llm.complete("hello").await.unwrap_err();
        assert!(matches!(err, Error::Transient { .. }));
    }

    #[tokio::test]
    async fn echoes_stdout_on_success() {
        let llm = ExternalLlm::new("cat", None);
        let result = llm.complete("hello world").await.unwrap();
        assert_eq!(result, "hello world");
    }

    #[tokio::test]
    async fn nonzero_exit_is_transient_error() {
        let llm = ExternalLlm::new("false", None);
        let err = llm.complete("x").await.unwrap_err();
        assert!(matches!(err, Error::Transient { .. }));
    }

    #[test]
    fn extracts_json_object_from_fenced_block() {
        let response = "Here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json_from_response(response), "{\"a\": 1}");
    }

    #[test]
    fn extracts_raw_json_array() {
        let response = "  [1, 2, 3]  ";
        assert_eq!(extract_json_from_response(response), "[1, 2, 3]");
    }

    #[test]
    fn extracts_object_embedded_in_prose() {
        let response = "The result is {\"ok\":true} as expected";
        assert_eq!(extract_json_from_response(response), "{\"ok\":true}");
    }
}
