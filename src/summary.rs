use std::collections::HashMap;

use serde::Serialize;

use crate::parser::UsageRow;
use crate::util::format_tokens;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub session_name: Option<String>,
    pub project_path: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub message_count: u32,
    pub estimated_count: u32,
    pub models: Vec<String>,
    pub updated_at: i64,
}

impl SessionSummary {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_read_tokens)
            .saturating_add(self.cache_write_tokens)
    }

    /// One-line digest for terminal output.
    pub fn describe(&self) -> String {
        let label = self.session_name.as_deref().unwrap_or(&self.session_id);
        format!(
            "{label}: {} tokens ({} in / {} out) over {} messages [{}]",
            format_tokens(self.total_tokens()),
            format_tokens(self.input_tokens),
            format_tokens(self.output_tokens),
            self.message_count,
            self.models.join(", ")
        )
    }
}

/// Folds rows into one summary per session, in first-seen order.
pub fn summarize_sessions(rows: &[UsageRow]) -> Vec<SessionSummary> {
    let mut order: Vec<SessionSummary> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for row in rows {
        let slot = *index.entry(row.session_id.as_str()).or_insert_with(|| {
            order.push(SessionSummary {
                session_id: row.session_id.clone(),
                session_name: row.session_name.clone(),
                project_path: row.project_path.clone(),
                updated_at: row.session_updated_at,
                ..SessionSummary::default()
            });
            order.len() - 1
        });
        let entry = &mut order[slot];

        // Vendor counts are taken as reported, so sums saturate.
        entry.input_tokens = entry.input_tokens.saturating_add(row.tokens.input);
        entry.output_tokens = entry.output_tokens.saturating_add(row.tokens.output);
        entry.cache_read_tokens = entry
            .cache_read_tokens
            .saturating_add(row.tokens.cache_read.unwrap_or(0));
        entry.cache_write_tokens = entry
            .cache_write_tokens
            .saturating_add(row.tokens.cache_write.unwrap_or(0));
        entry.message_count = entry.message_count.saturating_add(1);
        if row.metadata.is_estimated {
            entry.estimated_count = entry.estimated_count.saturating_add(1);
        }
        if !entry.models.iter().any(|model| *model == row.model_id) {
            entry.models.push(row.model_id.clone());
        }
        entry.updated_at = entry.updated_at.max(row.session_updated_at);
    }

    order
}
