//! User activity detection
//!
//! Any file change inside the repository counts as the user working, except for the
//! directories and files the guard itself (or git, or package managers) write to.

use crate::config::AppConfig;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ActivityFilter {
    roots: Vec<PathBuf>,
    ignored_dirs: Vec<PathBuf>,
    ignored_files: Vec<PathBuf>,
}

impl ActivityFilter {
    pub fn from_config(config: &AppConfig) -> Self {
        let mut ignored_dirs = config.evidence.activity_ignore.clone();
        ignored_dirs.push(config.paths.tmp_dir.clone());
        ignored_dirs.push(config.paths.reports_dir.clone());

        let ignored_files = vec![
            config.paths.pid_file.clone(),
            config.paths.evidence_file.clone(),
            config.paths.lock_dir.clone(),
        ];

        Self::new(&config.repo_root, ignored_dirs, ignored_files)
    }

    pub fn new(repo_root: &Path, ignored_dirs: Vec<PathBuf>, ignored_files: Vec<PathBuf>) -> Self {
        let mut roots = vec![repo_root.to_path_buf()];
        if let Ok(canonical) = repo_root.canonicalize() {
            if canonical != repo_root {
                roots.push(canonical);
            }
        }
        let relative = |paths: Vec<PathBuf>| -> Vec<PathBuf> {
            paths
                .into_iter()
                .filter_map(|p| {
                    if p.is_absolute() {
                        roots.iter().find_map(|root| p.strip_prefix(root).ok().map(Path::to_path_buf))
                    } else {
                        Some(p)
                    }
                })
                .filter(|p| !p.as_os_str().is_empty())
                .collect()
        };
        let ignored_dirs = relative(ignored_dirs);
        let ignored_files = relative(ignored_files);
        Self {
            roots,
            ignored_dirs,
            ignored_files,
        }
    }

    /// Repository directory the watcher should cover
    pub fn root(&self) -> &Path {
        &self.roots[0]
    }

    /// Whether a change at `path` should count as user activity
    pub fn is_user_activity(&self, path: &Path) -> bool {
        let Some(rel) = self.roots.iter().find_map(|root| path.strip_prefix(root).ok()) else {
            return false;
        };
        if rel.as_os_str().is_empty() {
            return false;
        }
        if self.ignored_files.iter().any(|file| rel == file.as_path()) {
            return false;
        }
        !self.ignored_dirs.iter().any(|dir| rel.starts_with(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(root: &Path) -> ActivityFilter {
        let config = AppConfig {
            repo_root: root.to_path_buf(),
            ..AppConfig::default()
        };
        ActivityFilter::from_config(&config)
    }

    #[test]
    fn test_source_edits_count() {
        let dir = tempfile::tempdir().unwrap();
        let filter = filter(dir.path());
        assert!(filter.is_user_activity(&dir.path().join("src/main.rs")));
        assert!(filter.is_user_activity(&dir.path().join("README.md")));
        // a directory merely named like an ignored one deeper in the tree still counts
        assert!(filter.is_user_activity(&dir.path().join("docs/.git-notes.md")));
    }

    #[test]
    fn test_guard_and_tool_output_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let filter = filter(dir.path());
        let root = dir.path();
        assert!(!filter.is_user_activity(&root.join(".git/index")));
        assert!(!filter.is_user_activity(&root.join("node_modules/x/index.js")));
        assert!(!filter.is_user_activity(&root.join(".audit_tmp/guard-heartbeat.json")));
        assert!(!filter.is_user_activity(&root.join(".audit-reports/guard-audit.jsonl")));
        assert!(!filter.is_user_activity(&root.join(".guard-supervisor.pid")));
        assert!(!filter.is_user_activity(&root.join(".AI_EVIDENCE.json")));
        assert!(!filter.is_user_activity(root));
        assert!(!filter.is_user_activity(Path::new("/somewhere/else.rs")));
    }

    #[test]
    fn test_canonical_event_paths() {
        let dir = tempfile::tempdir().unwrap();
        let filter = filter(dir.path());
        let canonical = dir.path().canonicalize().unwrap();
        assert!(filter.is_user_activity(&canonical.join("lib.rs")));
        assert!(!filter.is_user_activity(&canonical.join(".audit_tmp/health-status.json")));
    }
}
