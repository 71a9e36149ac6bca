//! Structured environment gate evaluated against a probed [`Environment`].

use serde::{Deserialize, Serialize};

use crate::context::Environment;

/// Structured prerequisite map with the recognised keys `{os, repos, paths,
/// mcp_servers, tags, auto_pinned}`. An engram with no prerequisites (the
/// default) matches any environment.
///
/// Evaluation is strictly AND across recognised keys; unknown keys are
/// ignored; a malformed prerequisite is treated as no prerequisites at all
/// (handled by the caller when deserializing from a loosely-typed source).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prerequisites {
    /// Environment's OS must be one of these (case-insensitive).
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "string_or_seq")]
    pub os: Option<Vec<String>>,
    /// Environment's repo must be non-null and one of these. Fail-closed:
    /// a null environment repo never matches a non-empty `repos` list.
    #[serde(skip_serializing_if = "Option::is_none", alias = "repo", deserialize_with = "string_or_seq")]
    pub repos: Option<Vec<String>>,
    /// Environment's cwd must start with one of these prefixes.
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "string_or_seq")]
    pub paths: Option<Vec<String>>,
    /// All of these plug-in names must be present in the environment.
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "string_or_seq")]
    pub mcp_servers: Option<Vec<String>>,
    /// All of these tags must be present in the environment's tag set.
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "string_or_seq")]
    pub tags: Option<Vec<String>>,
    /// Set alongside `repos` or `tags` when the auto-pin engine pinned
    /// this engram, recording *why* it did so.
    #[serde(default)]
    pub auto_pinned: bool,
}

/// Deserializes a recognised-key value that may be given as either a
/// bare string or a list of strings (§4.B: "value or list" for `os` and
/// `repos`, extended to the other list-valued keys for consistency).
/// Missing/null fields still fall through to `None` via the struct-level
/// `#[serde(default)]`.
fn string_or_seq<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(Option::<OneOrMany>::deserialize(deserializer)?.map(|v| match v {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    }))
}

impl Prerequisites {
    /// Whether this prerequisite set has no gating keys at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.os.is_none()
            && self.repos.is_none()
            && self.paths.is_none()
            && self.mcp_servers.is_none()
            && self.tags.is_none()
    }

    /// Evaluates every recognised key except `tags` against `env`.
    /// Used by the retriever's structural filtering pass, which applies
    /// the `tags` key separately as a requested-tag filter.
    #[must_use]
    pub fn matches_structural(&self, env: &Environment) -> bool {
        if let Some(os_list) = &self.os
            && !os_list.iter().any(|o| o.eq_ignore_ascii_case(&env.os))
        {
            return false;
        }

        if let Some(repos) = &self.repos {
            match &env.repo {
                Some(repo) if repos.iter().any(|r| r == repo) => {}
                _ => return false,
            }
        }

        if let Some(paths) = &self.paths {
            let cwd = env.cwd.to_string_lossy();
            if !paths.iter().any(|p| cwd.starts_with(p.as_str())) {
                return false;
            }
        }

        if let Some(servers) = &self.mcp_servers
            && !servers.iter().all(|s| env.mcp_servers.iter().any(|e| e == s))
        {
            return false;
        }

        true
    }

    /// Evaluates the `tags` key: all listed tags must be present in
    /// `env.tags`.
    #[must_use]
    pub fn matches_tags(&self, env: &Environment) -> bool {
        match &self.tags {
            None => true,
            Some(required) => required.iter().all(|t| env.tags.iter().any(|e| e == t)),
        }
    }

    /// Full AND across all recognised keys, including `tags`.
    #[must_use]
    pub fn matches(&self, env: &Environment) -> bool {
        self.matches_structural(env) && self.matches_tags(env)
    }

    /// Parses a prerequisite set from a loosely-typed JSON value, treating
    /// anything that doesn't parse as a structured object as "no
    /// prerequisites" rather than failing.
    #[must_use]
    pub fn from_json_lenient(value: Option<&serde_json::Value>) -> Self {
        match value {
            Some(v) if v.is_object() => {
                serde_json::from_value(v.clone()).unwrap_or_default()
            }
            Some(serde_json::Value::String(s)) if !s.is_empty() => {
                serde_json::from_str(s).unwrap_or_default()
            }
            _ => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn env(repo: Option<&str>, tags: &[&str]) -> Environment {
        Environment {
            os: "linux".to_string(),
            repo: repo.map(str::to_string),
            cwd: PathBuf::from("/home/user/project"),
            mcp_servers: vec![],
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
        }
    }

    #[test]
    fn empty_prerequisites_match_anything() {
        let p = Prerequisites::default();
        assert!(p.matches(&env(None, &[])));
    }

    #[test]
    fn repos_fail_closed_on_null_repo() {
        let p = Prerequisites {
            repos: Some(vec!["app-repo".to_string()]),
            ..Default::default()
        };
        assert!(!p.matches(&env(None, &[])));
        assert!(!p.matches(&env(Some("other"), &[])));
        assert!(p.matches(&env(Some("app-repo"), &[])));
    }

    #[test]
    fn tags_require_all_present() {
        let p = Prerequisites {
            tags: Some(vec!["frontend".to_string(), "react".to_string()]),
            ..Default::default()
        };
        assert!(!p.matches(&env(None, &["frontend"])));
        assert!(p.matches(&env(None, &["frontend", "react", "extra"])));
    }

    #[test]
    fn malformed_json_is_no_prerequisites() {
        let v = serde_json::Value::String("not json".to_string());
        let p = Prerequisites::from_json_lenient(Some(&v));
        assert!(p.is_empty());
    }

    #[test]
    fn scalar_repos_is_read_as_single_element_list() {
        let v = serde_json::json!({"repos": "app-repo"});
        let p = Prerequisites::from_json_lenient(Some(&v));
        assert_eq!(p.repos, Some(vec!["app-repo".to_string()]));
        assert!(!p.matches(&env(None, &[])));
        assert!(p.matches(&env(Some("app-repo"), &[])));
    }

    #[test]
    fn scalar_os_is_read_as_single_element_list() {
        let v = serde_json::json!({"os": "linux"});
        let p: Prerequisites = serde_json::from_value(v).unwrap();
        assert_eq!(p.os, Some(vec!["linux".to_string()]));
        assert!(p.matches(&env(Some("app-repo"), &[])));
    }
}
