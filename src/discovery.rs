use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const WORKSPACE_FILE: &str = "workspace.yaml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDir {
    pub dir: PathBuf,
    pub events_path: PathBuf,
    pub dir_name: String,
}

impl SessionDir {
    pub fn new(dir: PathBuf) -> Self {
        let events_path = dir.join(EVENTS_FILE);
        let dir_name = dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            dir,
            events_path,
            dir_name,
        }
    }
}

/// Immediate subdirectories of `root` that hold a readable event log, sorted by
/// name. A missing or unreadable root yields an empty list.
pub fn discover_sessions(root: &Path) -> Vec<SessionDir> {
    session_candidates(root)
        .into_iter()
        .filter(|dir| has_event_log(dir))
        .map(SessionDir::new)
        .collect()
}

/// Every immediate subdirectory of `root`, whether or not its log exists yet.
pub fn session_candidates(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .map(walkdir::DirEntry::into_path)
        .collect()
}

pub fn has_event_log(dir: &Path) -> bool {
    fs::metadata(dir.join(EVENTS_FILE)).is_ok_and(|meta| meta.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn only_directories_with_event_logs_qualify() {
        let tmp = TempDir::new().expect("temp dir");
        let root = tmp.path();
        for name in ["b-session", "a-session", "empty-dir"] {
            fs::create_dir(root.join(name)).expect("mkdir");
        }
        fs::write(root.join("a-session").join(EVENTS_FILE), "").expect("write");
        fs::write(root.join("b-session").join(EVENTS_FILE), "{}\n").expect("write");
        fs::write(root.join("stray.jsonl"), "{}\n").expect("write");
        fs::create_dir(root.join("empty-dir").join(EVENTS_FILE)).expect("mkdir");

        let sessions = discover_sessions(root);
        let names: Vec<&str> = sessions.iter().map(|s| s.dir_name.as_str()).collect();
        assert_eq!(names, vec!["a-session", "b-session"]);
        assert_eq!(sessions[0].events_path, root.join("a-session").join(EVENTS_FILE));

        let candidates = session_candidates(root);
        assert_eq!(
            candidates,
            vec![
                root.join("a-session"),
                root.join("b-session"),
                root.join("empty-dir")
            ]
        );
    }

    #[test]
    fn missing_root_is_empty() {
        let tmp = TempDir::new().expect("temp dir");
        assert!(discover_sessions(&tmp.path().join("nope")).is_empty());
    }
}
