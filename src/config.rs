use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_RESULT_CACHE_TTL_MS: u64 = 5_000;
const DEFAULT_MAX_CACHED_SESSIONS: usize = 200;
const DEFAULT_FULL_RECONCILE_SECS: u64 = 600;
const CONFIG_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    pub schema_version: u32,
    pub result_cache_ttl_ms: u64,
    pub max_cached_sessions: usize,
    pub full_reconcile_interval_secs: u64,
    pub session_state_dir: Option<String>,
    pub logs_dir: Option<String>,
}

/// Resolved settings consumed by the tracker and watchers.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub session_state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub result_cache_ttl: Duration,
    pub max_cached_sessions: usize,
    pub full_reconcile_interval: Duration,
}

impl TrackerSettings {
    /// Defaults rooted under `home`, laid out like the CLI's own home.
    pub fn for_home(home: &Path) -> Self {
        Self {
            session_state_dir: home.join("session-state"),
            logs_dir: home.join("logs"),
            result_cache_ttl: Duration::from_millis(DEFAULT_RESULT_CACHE_TTL_MS),
            max_cached_sessions: DEFAULT_MAX_CACHED_SESSIONS,
            full_reconcile_interval: Duration::from_secs(DEFAULT_FULL_RECONCILE_SECS),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            result_cache_ttl_ms: DEFAULT_RESULT_CACHE_TTL_MS,
            max_cached_sessions: DEFAULT_MAX_CACHED_SESSIONS,
            full_reconcile_interval_secs: DEFAULT_FULL_RECONCILE_SECS,
            session_state_dir: None,
            logs_dir: None,
        }
    }
}

impl TrackerConfig {
    pub fn load_or_init() -> Result<Self> {
        let cfg_path = config_path();
        if let Some(parent) = cfg_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        if cfg_path.exists() {
            let raw = fs::read_to_string(&cfg_path)
                .with_context(|| format!("failed to read {}", cfg_path.display()))?;
            let mut parsed: TrackerConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", cfg_path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save()?;
            }
            Ok(parsed)
        } else {
            let cfg = TrackerConfig::default();
            cfg.save()?;
            Ok(cfg)
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Applies environment overrides and path defaults.
    pub fn settings(&self) -> TrackerSettings {
        let home = copilot_home();
        TrackerSettings {
            session_state_dir: self
                .session_state_dir
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join("session-state")),
            logs_dir: self
                .logs_dir
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join("logs")),
            result_cache_ttl: Duration::from_millis(env_u64(
                "COPILOT_USAGE_RESULT_TTL_MS",
                self.result_cache_ttl_ms,
            )),
            max_cached_sessions: env_u64(
                "COPILOT_USAGE_MAX_CACHED_SESSIONS",
                self.max_cached_sessions as u64,
            ) as usize,
            full_reconcile_interval: Duration::from_secs(env_u64(
                "COPILOT_USAGE_FULL_RECONCILE_SECS",
                self.full_reconcile_interval_secs,
            )),
        }
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }
        if self.max_cached_sessions == 0 {
            self.max_cached_sessions = DEFAULT_MAX_CACHED_SESSIONS;
            changed = true;
        }
        if self.full_reconcile_interval_secs == 0 {
            self.full_reconcile_interval_secs = DEFAULT_FULL_RECONCILE_SECS;
            changed = true;
        }
        for item in [&mut self.session_state_dir, &mut self.logs_dir] {
            if normalize_optional_string(item) {
                changed = true;
            }
        }

        changed
    }
}

pub fn copilot_home() -> PathBuf {
    if let Ok(custom) = env::var("COPILOT_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".copilot")
}

pub fn config_path() -> PathBuf {
    copilot_home().join("usage-tracker-config.json")
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn normalize_optional_string(value: &mut Option<String>) -> bool {
    if let Some(item) = value.as_mut() {
        let trimmed = item.trim().to_string();
        if trimmed.is_empty() {
            *value = None;
            return true;
        }
        if *item != trimmed {
            *item = trimmed;
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = TrackerConfig::default();
        assert_eq!(cfg.result_cache_ttl_ms, 5_000);
        assert_eq!(cfg.max_cached_sessions, 200);
        assert_eq!(cfg.full_reconcile_interval_secs, 600);
        assert_eq!(cfg.session_state_dir, None);
    }

    #[test]
    fn migration_repairs_zero_limits_and_blank_paths() {
        let mut cfg = TrackerConfig {
            schema_version: 1,
            result_cache_ttl_ms: 0,
            max_cached_sessions: 0,
            full_reconcile_interval_secs: 0,
            session_state_dir: Some("   ".to_string()),
            logs_dir: Some(" /var/log/copilot ".to_string()),
        };

        assert!(cfg.normalize_and_migrate());
        assert_eq!(cfg.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(cfg.max_cached_sessions, 200);
        assert_eq!(cfg.full_reconcile_interval_secs, 600);
        assert_eq!(cfg.session_state_dir, None);
        assert_eq!(cfg.logs_dir.as_deref(), Some("/var/log/copilot"));
        assert!(!cfg.normalize_and_migrate());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: TrackerConfig =
            serde_json::from_str(r#"{"max_cached_sessions": 12}"#).expect("parse config");
        assert_eq!(cfg.max_cached_sessions, 12);
        assert_eq!(cfg.result_cache_ttl_ms, 5_000);
    }

    #[test]
    fn explicit_directories_override_home_layout() {
        let cfg = TrackerConfig {
            session_state_dir: Some("/data/state".to_string()),
            logs_dir: Some("/data/logs".to_string()),
            ..TrackerConfig::default()
        };
        let settings = cfg.settings();
        assert_eq!(settings.session_state_dir, PathBuf::from("/data/state"));
        assert_eq!(settings.logs_dir, PathBuf::from("/data/logs"));
    }

    #[test]
    fn home_layout_uses_cli_directories() {
        let settings = TrackerSettings::for_home(Path::new("/home/dev/.copilot"));
        assert_eq!(
            settings.session_state_dir,
            PathBuf::from("/home/dev/.copilot/session-state")
        );
        assert_eq!(settings.logs_dir, PathBuf::from("/home/dev/.copilot/logs"));
        assert_eq!(settings.full_reconcile_interval, Duration::from_secs(600));
    }
}
