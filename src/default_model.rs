use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

use crate::util::read_text;

pub const DEFAULT_MODEL_MARKER: &str = "Using default model: ";
pub const UNKNOWN_MODEL: &str = "unknown";
pub const DEFAULT_MODEL_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedModel {
    value: String,
    expires_at: Instant,
}

/// Reads the CLI's default model out of its newest `process-*.log`, caching
/// the answer for a short TTL.
#[derive(Debug)]
pub struct DefaultModelResolver {
    logs_dir: PathBuf,
    ttl: Duration,
    cached: Option<CachedModel>,
}

impl DefaultModelResolver {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self::with_ttl(logs_dir, DEFAULT_MODEL_TTL)
    }

    pub fn with_ttl(logs_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            ttl,
            cached: None,
        }
    }

    /// Never fails: a failed scan returns the previous answer or
    /// [`UNKNOWN_MODEL`].
    pub fn resolve(&mut self) -> String {
        if let Some(cached) = &self.cached
            && Instant::now() < cached.expires_at
        {
            return cached.value.clone();
        }

        let scanned = latest_process_log(&self.logs_dir)
            .and_then(|path| read_text(&path))
            .and_then(|text| extract_default_model(&text));

        let value = match (scanned, self.cached.take()) {
            (Some(model), _) => model,
            (None, Some(previous)) => {
                debug!(
                    logs_dir = %self.logs_dir.display(),
                    "default model scan failed; keeping previous value"
                );
                previous.value
            }
            (None, None) => {
                debug!(logs_dir = %self.logs_dir.display(), "default model not found");
                return UNKNOWN_MODEL.to_string();
            }
        };

        self.cached = Some(CachedModel {
            value: value.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        value
    }
}

fn latest_process_log(logs_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(logs_dir).ok()?;
    entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| is_process_log(&entry.file_name().to_string_lossy()))
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, entry.path()))
        })
        .max_by(|left, right| left.0.cmp(&right.0).then_with(|| left.1.cmp(&right.1)))
        .map(|(_, path)| path)
}

fn is_process_log(name: &str) -> bool {
    name.starts_with("process-") && name.ends_with(".log")
}

/// Model named by the last marker line in `text`.
pub fn extract_default_model(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|line| {
            let (_, rest) = line.split_once(DEFAULT_MODEL_MARKER)?;
            let model = rest.trim();
            (!model.is_empty()).then(|| model.to_string())
        })
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn write_log(dir: &Path, name: &str, content: &str, age: Duration) {
        let path = dir.join(name);
        fs::write(&path, content).expect("write log");
        let file = File::options().write(true).open(&path).expect("open log");
        file.set_modified(SystemTime::now() - age).expect("set mtime");
    }

    #[test]
    fn extracts_last_marker() {
        let text = "2026-02-09 [INFO] Using default model: gpt-4.1\nnoise\n2026-02-09 [INFO] Using default model: claude-sonnet-4.5  \n";
        assert_eq!(extract_default_model(text).as_deref(), Some("claude-sonnet-4.5"));
        assert_eq!(extract_default_model("nothing here"), None);
        assert_eq!(extract_default_model("Using default model:    \n"), None);
    }

    #[test]
    fn picks_most_recent_process_log() {
        let tmp = TempDir::new().expect("temp dir");
        write_log(
            tmp.path(),
            "process-old.log",
            "Using default model: old\n",
            Duration::from_secs(600),
        );
        write_log(
            tmp.path(),
            "process-new.log",
            "Using default model: new\n",
            Duration::from_secs(5),
        );
        write_log(tmp.path(), "other.log", "Using default model: other\n", Duration::ZERO);

        let mut resolver = DefaultModelResolver::new(tmp.path());
        assert_eq!(resolver.resolve(), "new");
    }

    #[test]
    fn caches_within_ttl() {
        let tmp = TempDir::new().expect("temp dir");
        write_log(
            tmp.path(),
            "process-1.log",
            "Using default model: first\n",
            Duration::from_secs(10),
        );
        let mut resolver = DefaultModelResolver::new(tmp.path());
        assert_eq!(resolver.resolve(), "first");

        write_log(tmp.path(), "process-2.log", "Using default model: second\n", Duration::ZERO);
        assert_eq!(resolver.resolve(), "first");
    }

    #[test]
    fn failed_scan_keeps_previous_value() {
        let tmp = TempDir::new().expect("temp dir");
        write_log(tmp.path(), "process-1.log", "Using default model: kept\n", Duration::ZERO);
        let mut resolver = DefaultModelResolver::with_ttl(tmp.path(), Duration::ZERO);
        assert_eq!(resolver.resolve(), "kept");

        fs::remove_file(tmp.path().join("process-1.log")).expect("remove log");
        assert_eq!(resolver.resolve(), "kept");
    }

    #[test]
    fn missing_directory_is_unknown() {
        let tmp = TempDir::new().expect("temp dir");
        let mut resolver = DefaultModelResolver::new(tmp.path().join("missing"));
        assert_eq!(resolver.resolve(), UNKNOWN_MODEL);
    }
}
