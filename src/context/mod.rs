//! The environment probe (component C): detects OS, repository, working
//! directory, available assistant plug-ins, and environment tags.
//!
//! Production wiring composes [`GitContext`] and [`tag_detectors`] behind
//! the [`EnvironmentProbe`] capability trait named in the design notes;
//! tests inject a stub implementation.

mod detector;
pub mod tag_detectors;

pub use detector::GitContext;

use std::path::{Path, PathBuf};

/// The dict consumed by prerequisite checks and tag-stat writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    /// Lowercase platform identifier (`linux`, `macos`, `windows`).
    pub os: String,
    /// Last path segment of the origin remote URL, `.git` stripped; `None`
    /// on failure (outside a repo, or a repo with no remote resolvable to
    /// a name).
    pub repo: Option<String>,
    /// Working directory at probe time.
    pub cwd: PathBuf,
    /// Names of assistant plug-ins declared in the host config.
    pub mcp_servers: Vec<String>,
    /// Sorted, deduplicated union of detected tags.
    pub tags: Vec<String>,
}

/// Capability seam for deterministic testing: production code probes the
/// real OS/git/filesystem state; tests inject a fixed [`Environment`].
pub trait EnvironmentProbe: Send + Sync {
    /// Probes the current environment. Best-effort: any failing detector
    /// contributes nothing rather than failing the whole probe.
    fn probe(&self) -> Environment;
}

/// Production [`EnvironmentProbe`] backed by the real OS, git repository,
/// and host assistant config file.
pub struct SystemEnvironmentProbe {
    mcp_config_path: Option<PathBuf>,
}

impl SystemEnvironmentProbe {
    /// Creates a probe that reads declared plug-in names from
    /// `mcp_config_path` (the host assistant's own config file), if given.
    #[must_use]
    pub const fn new(mcp_config_path: Option<PathBuf>) -> Self {
        Self { mcp_config_path }
    }
}

impl EnvironmentProbe for SystemEnvironmentProbe {
    fn probe(&self) -> Environment {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        probe_at(&cwd, self.mcp_config_path.as_deref())
    }
}

/// Probes the environment rooted at `cwd`, reading `mcp_config_path` for
/// plug-in names. Split out from [`SystemEnvironmentProbe::probe`] so CLI
/// paths and tests can probe an arbitrary directory directly.
#[must_use]
pub fn probe_at(cwd: &Path, mcp_config_path: Option<&Path>) -> Environment {
    let os = std::env::consts::OS.to_lowercase();
    let git = GitContext::from_path(cwd);
    let repo = git
        .project_id
        .as_ref()
        .map(|id| id.rsplit('/').next().unwrap_or(id).trim_end_matches(".git").to_string());
    let remote_url = GitContext::origin_remote_url(cwd);
    let tags = tag_detectors::detect_tags(cwd, remote_url.as_deref());

    let mcp_servers = mcp_config_path
        .and_then(|p| std::fs::read_to_string(p).ok())
        .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
        .and_then(|v| {
            v.get("mcpServers")
                .and_then(|s| s.as_object())
                .map(|obj| obj.keys().cloned().collect::<Vec<_>>())
        })
        .unwrap_or_default();

    Environment {
        os,
        repo,
        cwd: cwd.to_path_buf(),
        mcp_servers,
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn probe_on_plain_directory_has_no_repo() {
        let dir = TempDir::new().unwrap();
        let env = probe_at(dir.path(), None);
        assert!(env.repo.is_none());
        assert!(!env.os.is_empty());
    }

    #[test]
    fn probe_is_stable_on_unchanged_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        let a = probe_at(dir.path(), None);
        let b = probe_at(dir.path(), None);
        assert_eq!(a.tags, b.tags);
    }
}
