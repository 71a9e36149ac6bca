//! Configuration (§6).
//!
//! JSON, loaded from `~/.engrammar/config.json` with code defaults for
//! every recognized key; unrecognized keys are ignored rather than
//! rejected, matching the rest of the crate's lenient-on-read posture.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable that overrides the engrammar home directory
/// (`~/.engrammar` by default).
pub const HOME_ENV_VAR: &str = "ENGRAMMAR_HOME";

/// Resolves the single root directory (§6 "Host paths") containing the
/// database, vector indices, configuration file, socket, PID file, and
/// logs. `ENGRAMMAR_HOME` overrides the default `~/.engrammar`.
#[must_use]
pub fn home_dir() -> PathBuf {
    if let Ok(path) = std::env::var(HOME_ENV_VAR) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    directories::BaseDirs::new()
        .map_or_else(|| PathBuf::from("."), |b| b.home_dir().to_path_buf())
        .join(".engrammar")
}

/// `search` section: defaults for the hybrid retriever.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Default number of results returned by a prompt-driven search.
    pub top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

/// `hooks` section: gates the two retrieval hook paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Whether `UserPromptSubmit` triggers a search.
    pub prompt_enabled: bool,
    /// Whether `PreToolUse` triggers a tool-context search.
    pub tool_use_enabled: bool,
    /// Tool names for which no retrieval is performed.
    pub skip_tools: Vec<String>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            prompt_enabled: true,
            tool_use_enabled: true,
            skip_tools: vec!["TodoWrite".to_string(), "Task".to_string()],
        }
    }
}

/// `display` section: per-hook caps and formatting of the injected block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Caps results injected on `UserPromptSubmit`, overriding `search.top_k`.
    pub max_engrams_per_prompt: usize,
    /// Caps results injected on `PreToolUse`, overriding `search.top_k`.
    pub max_engrams_per_tool: usize,
    /// Whether to prefix injected lines with a `[category]` bracket.
    pub show_categories: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { max_engrams_per_prompt: 5, max_engrams_per_tool: 3, show_categories: true }
    }
}

/// `llm` section: the external subprocess used by the extractor,
/// evaluator, and dedup engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Binary invoked as a subprocess (`${VAR}`-expanded).
    pub binary: String,
    /// Optional `--model` value passed through opaquely.
    pub model: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self { binary: "claude".to_string(), model: Some("haiku".to_string()) }
    }
}

/// Top-level configuration, deserialized from `config.json`. Every field
/// has a code default, so a missing or partially-specified file is fully
/// usable; unrecognized top-level keys or sections are ignored by serde's
/// default struct deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngrammarConfig {
    /// Hybrid retriever defaults.
    pub search: SearchConfig,
    /// Hook gating.
    pub hooks: HooksConfig,
    /// Injected-block formatting and per-hook caps.
    pub display: DisplayConfig,
    /// External LLM subprocess used by extraction, evaluation, and dedup.
    pub llm: LlmConfig,
}

impl EngrammarConfig {
    /// Loads configuration from `path`, falling back to defaults if the
    /// file does not exist. A malformed file is an error: unlike
    /// prerequisite parsing, a config typo should be loud rather than
    /// silently ignored.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&expand_env_vars(&contents))
                .map_err(|e| Error::InvalidInput(format!("invalid config at {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::OperationFailed {
                operation: "config_load".to_string(),
                cause: e.to_string(),
            }),
        }
    }

    /// Loads `~/.engrammar/config.json` (or `$ENGRAMMAR_HOME/config.json`).
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_default() -> Result<Self> {
        Self::load_from_file(&home_dir().join("config.json"))
    }

    /// Result of applying `display.max_engrams_per_prompt` on top of
    /// `search.top_k` for the `UserPromptSubmit` hook.
    #[must_use]
    pub const fn prompt_result_cap(&self) -> usize {
        self.display.max_engrams_per_prompt
    }

    /// Result of applying `display.max_engrams_per_tool` on top of
    /// `search.top_k` for the `PreToolUse` hook.
    #[must_use]
    pub const fn tool_result_cap(&self) -> usize {
        self.display.max_engrams_per_tool
    }
}

/// Expands `${VAR}` references in `input` against the process
/// environment, leaving unresolved references untouched. Used for string
/// values that may need an environment override, such as an LLM binary
/// path.
#[must_use]
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    let bytes = input.as_bytes();

    while let Some((i, c)) = chars.next() {
        if c == '$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = input[i + 2..].find('}') {
                let var_name = &input[i + 2..i + 2 + end];
                match std::env::var(var_name) {
                    Ok(value) => {
                        out.push_str(&value);
                        for _ in 0..=end + 1 {
                            chars.next();
                        }
                        continue;
                    }
                    Err(_) => {
                        out.push(c);
                        continue;
                    }
                }
            }
        }
        out.push(c);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = EngrammarConfig::default();
        assert_eq!(config.search.top_k, 5);
        assert!(config.hooks.prompt_enabled);
        assert!(config.hooks.tool_use_enabled);
        assert!(config.display.show_categories);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngrammarConfig::load_from_file(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.search.top_k, 5);
    }

    #[test]
    fn unrecognized_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"search":{"top_k":9},"totally_unknown":{"x":1}}"#).unwrap();
        let config = EngrammarConfig::load_from_file(&path).unwrap();
        assert_eq!(config.search.top_k, 9);
    }

    #[test]
    fn env_var_expansion_substitutes_known_vars() {
        // SAFETY-adjacent note: tests run single-threaded per process here
        // is not guaranteed, so this test only asserts on a var unlikely to
        // collide and restores nothing since it does not mutate global state
        // other tests depend on.
        unsafe {
            std::env::set_var("ENGRAMMAR_TEST_VAR", "resolved");
        }
        assert_eq!(expand_env_vars("prefix/${ENGRAMMAR_TEST_VAR}/suffix"), "prefix/resolved/suffix");
        assert_eq!(expand_env_vars("${ENGRAMMAR_UNSET_VAR}"), "${ENGRAMMAR_UNSET_VAR}");
    }
}
