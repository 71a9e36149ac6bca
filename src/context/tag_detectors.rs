//! Environment tag detection: git remote host, marker files, manifest
//! dependencies, and directory structure.
//!
//! Detects environment tags from git remote host, marker files, manifest
//! dependencies, and directory naming conventions, generalised away from
//! any one installation's specific paths and dependency entries.

use std::collections::BTreeSet;
use std::path::Path;

/// File marker -> tags it implies when present in `cwd`.
const FILE_MARKERS: &[(&str, &[&str])] = &[
    ("tsconfig.json", &["typescript"]),
    ("package.json", &["nodejs"]),
    ("Gemfile", &["ruby"]),
    ("Cargo.toml", &["rust"]),
    ("go.mod", &["golang"]),
    ("pom.xml", &["java"]),
    ("build.gradle", &["java"]),
    ("Dockerfile", &["docker"]),
    ("docker-compose.yml", &["docker"]),
    (".rubocop.yml", &["ruby"]),
    ("jest.config.js", &["jest"]),
    ("jest.config.ts", &["jest"]),
    ("playwright.config.ts", &["playwright"]),
    ("vite.config.ts", &["vite"]),
    ("next.config.js", &["nextjs"]),
    ("nuxt.config.ts", &["nuxtjs"]),
    ("requirements.txt", &["python"]),
    ("pyproject.toml", &["python"]),
];

/// Directory marker -> tags it implies when present under `cwd`.
const DIR_STRUCTURE_PATTERNS: &[(&str, &[&str])] = &[
    ("engines", &["monorepo", "rails-engines"]),
    ("apps", &["monorepo"]),
    ("packages", &["monorepo"]),
    ("libs", &["monorepo"]),
    ("frontend", &["frontend"]),
    ("backend", &["backend"]),
    ("src", &["source"]),
    ("components", &["frontend", "react"]),
    ("pages", &["frontend"]),
];

/// `package.json` dependency name -> tags it implies.
const PACKAGE_DEPENDENCY_TAGS: &[(&str, &[&str])] = &[
    ("react", &["react", "frontend"]),
    ("next", &["nextjs", "react", "frontend"]),
    ("nuxt", &["nuxtjs", "vue", "frontend"]),
    ("vue", &["vue", "frontend"]),
    ("svelte", &["svelte", "frontend"]),
    ("angular", &["angular", "frontend"]),
    ("@angular/core", &["angular", "frontend"]),
    ("express", &["nodejs", "backend"]),
    ("fastify", &["nodejs", "backend"]),
    ("nest", &["nestjs", "nodejs", "backend"]),
    ("@nestjs/core", &["nestjs", "nodejs", "backend"]),
    ("typescript", &["typescript"]),
    ("jest", &["jest", "testing"]),
    ("vitest", &["vitest", "testing"]),
    ("playwright", &["playwright", "testing"]),
    ("cypress", &["cypress", "testing"]),
];

/// `Gemfile` dependency name -> tags it implies.
const GEMFILE_DEPENDENCY_TAGS: &[(&str, &[&str])] = &[
    ("rails", &["rails", "backend"]),
    ("rspec", &["rspec", "testing"]),
    ("rubocop", &["ruby"]),
];

/// Detects the union of environment tags present under `cwd`: git remote
/// host, marker files, manifest dependencies, and directory structure.
/// Best-effort — each detector is independent and failures contribute
/// nothing. Result is sorted and deduplicated.
#[must_use]
pub fn detect_tags(cwd: &Path, remote_url: Option<&str>) -> Vec<String> {
    let mut tags = BTreeSet::new();

    if let Some(url) = remote_url {
        tags.extend(detect_host_tags(url));
    }

    for (marker, marker_tags) in FILE_MARKERS {
        if cwd.join(marker).is_file() {
            tags.extend(marker_tags.iter().map(|t| (*t).to_string()));
        }
    }

    for (dir, dir_tags) in DIR_STRUCTURE_PATTERNS {
        if cwd.join(dir).is_dir() {
            tags.extend(dir_tags.iter().map(|t| (*t).to_string()));
        }
    }

    tags.extend(detect_package_json_deps(cwd));
    tags.extend(detect_gemfile_deps(cwd));

    tags.into_iter().collect()
}

/// Git hosting platform from the remote URL, e.g. `github.com/org/repo` ->
/// `{github}`.
fn detect_host_tags(remote_url: &str) -> Vec<String> {
    let lower = remote_url.to_lowercase();
    let mut tags = Vec::new();
    if lower.contains("github.com") {
        tags.push("github".to_string());
    }
    if lower.contains("gitlab.com") {
        tags.push("gitlab".to_string());
    }
    if lower.contains("bitbucket.org") {
        tags.push("bitbucket".to_string());
    }
    tags
}

fn detect_package_json_deps(cwd: &Path) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(cwd.join("package.json")) else {
        return Vec::new();
    };
    let Ok(json) = serde_json::from_str::<serde_json::Value>(&contents) else {
        return Vec::new();
    };

    let mut deps = BTreeSet::new();
    for section in ["dependencies", "devDependencies"] {
        if let Some(obj) = json.get(section).and_then(|v| v.as_object()) {
            deps.extend(obj.keys().cloned());
        }
    }

    PACKAGE_DEPENDENCY_TAGS
        .iter()
        .filter(|(dep, _)| deps.contains(*dep))
        .flat_map(|(_, tags)| tags.iter().map(|t| (*t).to_string()))
        .collect()
}

fn detect_gemfile_deps(cwd: &Path) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(cwd.join("Gemfile")) else {
        return Vec::new();
    };

    GEMFILE_DEPENDENCY_TAGS
        .iter()
        .filter(|(gem, _)| contents.contains(&format!("gem '{gem}'")) || contents.contains(&format!("gem \"{gem}\"")))
        .flat_map(|(_, tags)| tags.iter().map(|t| (*t).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn marker_files_are_detected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        let tags = detect_tags(dir.path(), None);
        assert!(tags.contains(&"rust".to_string()));
    }

    #[test]
    fn directory_structure_is_detected() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("packages")).unwrap();
        let tags = detect_tags(dir.path(), None);
        assert!(tags.contains(&"monorepo".to_string()));
    }

    #[test]
    fn package_json_dependencies_are_detected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"react": "^18.0.0"}}"#,
        )
        .unwrap();
        let tags = detect_tags(dir.path(), None);
        assert!(tags.contains(&"react".to_string()));
        assert!(tags.contains(&"frontend".to_string()));
    }

    #[test]
    fn remote_host_is_detected() {
        let dir = TempDir::new().unwrap();
        let tags = detect_tags(dir.path(), Some("git@github.com:org/repo.git"));
        assert!(tags.contains(&"github".to_string()));
    }

    #[test]
    fn unchanged_directory_returns_identical_sorted_lists() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module x").unwrap();
        let a = detect_tags(dir.path(), None);
        let b = detect_tags(dir.path(), None);
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(a, sorted);
    }
}
