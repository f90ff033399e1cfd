use std::path::Path;

use serde::Serialize;

use crate::discovery::WORKSPACE_FILE;
use crate::util::read_text;

/// Sidecar metadata written next to a session's event log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkspaceMetadata {
    pub id: String,
    pub cwd: Option<String>,
    pub git_root: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub summary: Option<String>,
    pub summary_count: Option<u32>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl WorkspaceMetadata {
    pub fn project_path(&self) -> Option<String> {
        non_blank(self.cwd.as_deref())
    }

    pub fn session_name(&self) -> Option<String> {
        non_blank(self.summary.as_deref())
    }
}

/// Parses the flat `key: value` sidecar format. A record without an `id` is
/// treated as absent.
pub fn parse_workspace(text: &str) -> Option<WorkspaceMetadata> {
    let mut metadata = WorkspaceMetadata::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = unquote(value.trim());
        if value.is_empty() {
            continue;
        }
        match key {
            "id" => metadata.id = value.to_string(),
            "cwd" => metadata.cwd = Some(value.to_string()),
            "git_root" => metadata.git_root = Some(value.to_string()),
            "repository" => metadata.repository = Some(value.to_string()),
            "branch" => metadata.branch = Some(value.to_string()),
            "summary" => metadata.summary = Some(value.to_string()),
            "summary_count" => metadata.summary_count = value.parse().ok(),
            "created_at" => metadata.created_at = Some(value.to_string()),
            "updated_at" => metadata.updated_at = Some(value.to_string()),
            _ => {}
        }
    }
    (!metadata.id.is_empty()).then_some(metadata)
}

pub fn read_workspace(session_dir: &Path) -> Option<WorkspaceMetadata> {
    read_text(&session_dir.join(WORKSPACE_FILE)).and_then(|text| parse_workspace(&text))
}

/// Sidecar `id` when present, otherwise the directory's base name.
pub fn resolve_session_id(session_dir: &Path, workspace: Option<&WorkspaceMetadata>) -> String {
    if let Some(metadata) = workspace {
        return metadata.id.clone();
    }
    session_dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown-session".to_string())
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn parses_flat_key_values() {
        let metadata = parse_workspace(
            "id: 7f1c\ncwd: /home/dev/app\ngit_root: /home/dev/app\nbranch: main\nsummary: \"Fix login flow\"\nsummary_count: 3\ncreated_at: 2026-02-09T16:33:13.000Z\n",
        )
        .expect("metadata");
        assert_eq!(metadata.id, "7f1c");
        assert_eq!(metadata.project_path().as_deref(), Some("/home/dev/app"));
        assert_eq!(metadata.session_name().as_deref(), Some("Fix login flow"));
        assert_eq!(metadata.summary_count, Some(3));
        assert_eq!(metadata.created_at.as_deref(), Some("2026-02-09T16:33:13.000Z"));
        assert_eq!(metadata.repository, None);
    }

    #[test]
    fn record_without_id_is_absent() {
        assert!(parse_workspace("cwd: /tmp\nsummary: hello\n").is_none());
        assert!(parse_workspace("").is_none());
        assert!(parse_workspace("id:   \n").is_none());
    }

    #[test]
    fn blank_summary_is_omitted() {
        let metadata = parse_workspace("id: a\nsummary: '  '\ncwd: \" \"\n").expect("metadata");
        assert_eq!(metadata.session_name(), None);
        assert_eq!(metadata.project_path(), None);
    }

    #[test]
    fn session_id_falls_back_to_directory_name() {
        let dir = PathBuf::from("/state/session-42");
        assert_eq!(resolve_session_id(&dir, None), "session-42");
        let metadata = WorkspaceMetadata {
            id: "from-sidecar".to_string(),
            ..WorkspaceMetadata::default()
        };
        assert_eq!(resolve_session_id(&dir, Some(&metadata)), "from-sidecar");
    }

    #[test]
    fn reads_sidecar_from_session_directory() {
        let tmp = TempDir::new().expect("temp dir");
        assert!(read_workspace(tmp.path()).is_none());
        std::fs::write(tmp.path().join(WORKSPACE_FILE), "id: on-disk\n").expect("write sidecar");
        assert_eq!(read_workspace(tmp.path()).map(|m| m.id).as_deref(), Some("on-disk"));
    }
}
