use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::discovery::EVENTS_FILE;
use crate::events::{AssistantMessage, Tokens, TypedEvent, classify};
use crate::util::{parse_timestamp_millis, read_jsonl};
use crate::workspace::{read_workspace, resolve_session_id};

pub const PROVIDER_ID: &str = "github-copilot";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRow {
    pub session_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub tokens: Tokens,
    pub timestamp: i64,
    pub session_updated_at: i64,
    pub metadata: UsageMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    pub is_estimated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ModelChangePoint {
    at: i64,
    model: String,
}

/// Model switches of one session, ordered by time.
#[derive(Debug, Clone, Default)]
pub struct ModelTimeline {
    changes: Vec<ModelChangePoint>,
}

impl ModelTimeline {
    pub fn push(&mut self, at: i64, model: impl Into<String>) {
        self.changes.push(ModelChangePoint {
            at,
            model: model.into(),
        });
    }

    /// Stable sort, so changes sharing a timestamp keep log order.
    pub fn sort(&mut self) {
        self.changes.sort_by_key(|change| change.at);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Model of the latest change at or before `at`, else `default_model`.
    pub fn resolve_at<'a>(&'a self, at: i64, default_model: &'a str) -> &'a str {
        self.changes
            .iter()
            .rev()
            .find(|change| change.at <= at)
            .map(|change| change.model.as_str())
            .unwrap_or(default_model)
    }
}

/// Rows keyed by message id: first sighting fixes the position, the latest
/// sighting supplies the value.
#[derive(Debug, Default)]
struct OrderedRows {
    positions: HashMap<String, usize>,
    rows: Vec<UsageRow>,
}

impl OrderedRows {
    /// Returns true when an earlier row was overwritten.
    fn upsert(&mut self, message_id: &str, row: UsageRow) -> bool {
        if let Some(&position) = self.positions.get(message_id) {
            self.rows[position] = row;
            return true;
        }
        self.positions.insert(message_id.to_string(), self.rows.len());
        self.rows.push(row);
        false
    }

    fn into_rows(self) -> Vec<UsageRow> {
        self.rows
    }
}

#[derive(Debug, Default)]
pub struct ParseReport {
    pub session_id: String,
    pub rows: Vec<UsageRow>,
    pub records: usize,
    pub lines_skipped: usize,
    pub assistant_messages: usize,
    pub duplicates: usize,
    pub model_changes: usize,
}

/// Usage rows for one session directory. Never fails: a missing, empty or
/// garbled log yields no rows.
pub fn parse_session(session_dir: &Path, mtime_ms: i64, default_model: &str) -> Vec<UsageRow> {
    parse_session_report(session_dir, mtime_ms, default_model).rows
}

pub fn parse_session_report(session_dir: &Path, mtime_ms: i64, default_model: &str) -> ParseReport {
    let workspace = read_workspace(session_dir);
    let session_id = resolve_session_id(session_dir, workspace.as_ref());
    let mut report = ParseReport {
        session_id: session_id.clone(),
        ..ParseReport::default()
    };

    let Some(read) = read_jsonl(&session_dir.join(EVENTS_FILE)) else {
        debug!(path = %session_dir.display(), "event log unreadable; session contributes no rows");
        return report;
    };
    report.records = read.records.len();
    report.lines_skipped = read.skipped;

    let session_name = workspace.as_ref().and_then(|meta| meta.session_name());
    let project_path = workspace.as_ref().and_then(|meta| meta.project_path());

    let mut timeline = ModelTimeline::default();
    let mut messages: Vec<AssistantMessage> = Vec::new();
    for record in &read.records {
        match classify(record) {
            TypedEvent::ModelChange(change) => {
                timeline.push(
                    parse_timestamp_millis(change.timestamp.as_deref(), 0),
                    change.new_model,
                );
            }
            TypedEvent::AssistantMessage(message) => messages.push(message),
            TypedEvent::SessionStart(_) | TypedEvent::Other(_) => {}
        }
    }
    timeline.sort();
    report.model_changes = timeline.len();
    report.assistant_messages = messages.len();

    let mut rows = OrderedRows::default();
    for message in messages {
        let timestamp = parse_timestamp_millis(message.timestamp.as_deref(), mtime_ms);
        let figures = message.token_figures();
        let model_id = message
            .model
            .clone()
            .unwrap_or_else(|| timeline.resolve_at(timestamp, default_model).to_string());
        let row = UsageRow {
            session_id: session_id.clone(),
            provider_id: PROVIDER_ID.to_string(),
            model_id,
            tokens: figures.tokens,
            timestamp,
            session_updated_at: mtime_ms,
            metadata: UsageMetadata {
                is_estimated: figures.is_estimated,
            },
            session_name: session_name.clone(),
            project_path: project_path.clone(),
        };
        if rows.upsert(&message.message_id, row) {
            report.duplicates += 1;
        }
    }
    report.rows = rows.into_rows();

    if report.lines_skipped > 0 {
        debug!(
            session_id = %report.session_id,
            skipped = report.lines_skipped,
            "skipped malformed event lines"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::WORKSPACE_FILE;
    use tempfile::TempDir;

    const MTIME: i64 = 1_770_654_800_000;

    fn session_with(events: &str) -> TempDir {
        let tmp = TempDir::new().expect("temp dir");
        std::fs::write(tmp.path().join(EVENTS_FILE), events).expect("write events");
        tmp
    }

    #[test]
    fn estimates_tokens_and_resolves_model_change() {
        let tmp = session_with(
            r#"{"type":"session.start","timestamp":"2026-02-09T16:33:13Z","data":{"sessionId":"s1"}}
{"type":"session.model_change","timestamp":"2026-02-09T16:33:14Z","data":{"newModel":"X"}}
{"type":"assistant.message","timestamp":"2026-02-09T16:33:15Z","data":{"messageId":"m1","content":"Hello world, this is a test response."}}"#,
        );
        let rows = parse_session(tmp.path(), MTIME, "default-model");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.tokens.output, 10);
        assert_eq!(row.tokens.input, 5);
        assert_eq!(row.model_id, "X");
        assert!(row.metadata.is_estimated);
        assert_eq!(row.provider_id, PROVIDER_ID);
        assert_eq!(row.session_updated_at, MTIME);
        assert_eq!(row.timestamp, 1_770_654_795_000);
    }

    #[test]
    fn messages_without_model_changes_use_default() {
        let tmp = session_with(
            r#"{"type":"assistant.message","data":{"messageId":"a","content":"one"}}
{"type":"assistant.message","data":{"messageId":"b","content":"two"}}
{"type":"assistant.message","data":{"messageId":"c","content":"three"}}"#,
        );
        let rows = parse_session(tmp.path(), MTIME, "gpt-default");
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.model_id == "gpt-default"));
        assert!(rows.iter().all(|row| row.timestamp == MTIME));
    }

    #[test]
    fn duplicate_message_ids_keep_first_position_and_last_value() {
        let tmp = session_with(
            r#"{"type":"assistant.message","data":{"messageId":"m1","content":"a"}}
{"type":"assistant.message","data":{"messageId":"m2","content":"b"}}
{"type":"assistant.message","data":{"messageId":"m1","content":"a much longer final answer","usage":{"prompt_tokens":50,"completion_tokens":7}}}"#,
        );
        let report = parse_session_report(tmp.path(), MTIME, "d");
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.rows[0].tokens.input, 50);
        assert_eq!(report.rows[0].tokens.output, 7);
        assert!(!report.rows[0].metadata.is_estimated);
        assert_eq!(report.rows[1].tokens.output, 1);
    }

    #[test]
    fn explicit_message_model_wins_over_timeline() {
        let tmp = session_with(
            r#"{"type":"session.model_change","timestamp":"2026-02-09T16:00:00Z","data":{"newModel":"timeline-model"}}
{"type":"assistant.message","timestamp":"2026-02-09T17:00:00Z","data":{"messageId":"m1","content":"x","model":"explicit-model"}}"#,
        );
        let rows = parse_session(tmp.path(), MTIME, "d");
        assert_eq!(rows[0].model_id, "explicit-model");
    }

    #[test]
    fn timeline_resolves_latest_change_not_after_message() {
        let mut timeline = ModelTimeline::default();
        timeline.push(300, "m3");
        timeline.push(100, "m1");
        timeline.push(200, "m2");
        timeline.sort();
        assert_eq!(timeline.resolve_at(50, "default"), "default");
        assert_eq!(timeline.resolve_at(100, "default"), "m1");
        assert_eq!(timeline.resolve_at(250, "default"), "m2");
        assert_eq!(timeline.resolve_at(10_000, "default"), "m3");
        assert_eq!(ModelTimeline::default().resolve_at(10, "default"), "default");
    }

    #[test]
    fn malformed_model_change_timestamp_sorts_first() {
        let tmp = session_with(
            r#"{"type":"session.model_change","timestamp":"2026-02-09T16:00:00Z","data":{"newModel":"later"}}
{"type":"session.model_change","timestamp":"garbage","data":{"newModel":"earliest"}}
{"type":"assistant.message","timestamp":"2026-02-09T15:00:00Z","data":{"messageId":"m1","content":"x"}}
{"type":"assistant.message","timestamp":"2026-02-09T16:30:00Z","data":{"messageId":"m2","content":"y"}}"#,
        );
        let rows = parse_session(tmp.path(), MTIME, "d");
        assert_eq!(rows[0].model_id, "earliest");
        assert_eq!(rows[1].model_id, "later");
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted() {
        let tmp = session_with(
            "{\"type\":\"assistant.message\",\"data\":{\"messageId\":\"m1\",\"content\":\"ok\"}}\n{broken\n\n{\"type\":\"assistant.message\",\"data\":{\"messageId\":\"m2\",\"content\":\"fine\"}}\n",
        );
        let report = parse_session_report(tmp.path(), MTIME, "d");
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.lines_skipped, 1);
    }

    #[test]
    fn sidecar_supplies_identity_and_labels() {
        let tmp = session_with(
            r#"{"type":"assistant.message","data":{"messageId":"m1","content":"x"}}"#,
        );
        std::fs::write(
            tmp.path().join(WORKSPACE_FILE),
            "id: sidecar-id\ncwd: /work/repo\nsummary:   Refactor parser  \n",
        )
        .expect("write sidecar");
        let rows = parse_session(tmp.path(), MTIME, "d");
        assert_eq!(rows[0].session_id, "sidecar-id");
        assert_eq!(rows[0].project_path.as_deref(), Some("/work/repo"));
        assert_eq!(rows[0].session_name.as_deref(), Some("Refactor parser"));
    }

    #[test]
    fn missing_log_yields_no_rows() {
        let tmp = TempDir::new().expect("temp dir");
        let report = parse_session_report(tmp.path(), MTIME, "d");
        assert!(report.rows.is_empty());
        let dir_name = tmp.path().file_name().expect("name").to_string_lossy().to_string();
        assert_eq!(report.session_id, dir_name);
    }

    #[test]
    fn rows_serialize_with_camel_case_and_omit_absent_fields() {
        let tmp = session_with(
            r#"{"type":"assistant.message","data":{"messageId":"m1","content":"abcd"}}"#,
        );
        let rows = parse_session(tmp.path(), MTIME, "d");
        let json = serde_json::to_value(&rows[0]).expect("serialize");
        assert_eq!(json["providerId"], "github-copilot");
        assert_eq!(json["metadata"]["isEstimated"], true);
        assert_eq!(json["tokens"]["output"], 1);
        assert!(json["tokens"].get("cacheRead").is_none());
        assert!(json.get("sessionName").is_none());
    }
}
