use std::fs;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt};

pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

/// Output tokens guessed from response text: one token per four characters, rounded up.
pub fn estimate_output_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Input tokens guessed as half the output estimate, rounded up.
pub fn estimate_input_tokens(output_tokens: u64) -> u64 {
    output_tokens.div_ceil(2)
}

/// Parses an event timestamp into epoch milliseconds, returning `fallback` when
/// the text is absent or unrecognizable.
pub fn parse_timestamp_millis(raw: Option<&str>, fallback: i64) -> i64 {
    raw.and_then(parse_timestamp).unwrap_or(fallback)
}

fn parse_timestamp(raw: &str) -> Option<i64> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc).timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    None
}

pub fn system_time_millis(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

pub fn now_millis() -> i64 {
    system_time_millis(SystemTime::now())
}

/// Modification time of `path` in epoch milliseconds, `None` if it cannot be stat'd.
pub fn file_mtime_millis(path: &Path) -> Option<i64> {
    let metadata = fs::metadata(path).ok()?;
    metadata.modified().ok().map(system_time_millis)
}

pub fn read_text(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

#[derive(Debug, Error)]
pub enum LineSkip {
    #[error("blank line")]
    Blank,
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("JSON value is not an object")]
    NotAnObject,
}

#[derive(Debug)]
pub enum LineOutcome {
    Parsed(Value),
    Skipped(LineSkip),
}

pub fn parse_json_line(line: &str) -> LineOutcome {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineOutcome::Skipped(LineSkip::Blank);
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) if value.is_object() => LineOutcome::Parsed(value),
        Ok(_) => LineOutcome::Skipped(LineSkip::NotAnObject),
        Err(err) => LineOutcome::Skipped(LineSkip::InvalidJson(err)),
    }
}

/// Parsed records of a newline-delimited JSON chunk. Blank lines are not
/// counted as skipped.
#[derive(Debug, Default)]
pub struct ReadReport {
    pub records: Vec<Value>,
    pub skipped: usize,
}

pub fn parse_jsonl_bytes(bytes: &[u8]) -> ReadReport {
    let mut report = ReadReport::default();
    for raw_line in bytes.split(|byte| *byte == b'\n') {
        let line = String::from_utf8_lossy(raw_line);
        match parse_json_line(&line) {
            LineOutcome::Parsed(value) => report.records.push(value),
            LineOutcome::Skipped(LineSkip::Blank) => {}
            LineOutcome::Skipped(_) => report.skipped += 1,
        }
    }
    report
}

/// Reads a whole JSONL file; `None` when the file cannot be read at all.
pub fn read_jsonl(path: &Path) -> Option<ReadReport> {
    let bytes = fs::read(path).ok()?;
    Some(parse_jsonl_bytes(&bytes))
}

pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

pub fn format_epoch_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "n/a".to_string())
}

pub fn truncate(input: &str, max_len: usize) -> String {
    if input.chars().count() <= max_len {
        return input.to_string();
    }
    if max_len <= 3 {
        return input.chars().take(max_len).collect();
    }
    let head: String = input.chars().take(max_len - 3).collect();
    format!("{head}...")
}
