use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::{self, TrackerConfig, TrackerSettings};
use crate::default_model::{DefaultModelResolver, UNKNOWN_MODEL};
use crate::discovery::discover_sessions;
use crate::reconcile::{UsageQuery, UsageTracker};
use crate::summary::summarize_sessions;
use crate::tail::LiveTailWatcher;
use crate::util::{format_epoch_millis, format_tokens, truncate};
use crate::watcher::{DirtyState, DirtyTracker};

const STOP_POLL: Duration = Duration::from_millis(200);

pub fn run_query(config: &TrackerConfig, query: &UsageQuery, json: bool) -> Result<()> {
    let settings = config.settings();
    let mut tracker = UsageTracker::new(&settings);
    let rows = tracker.query(query);

    if json {
        let data = serde_json::to_string_pretty(&rows).context("failed to serialize usage rows")?;
        println!("{data}");
        return Ok(());
    }

    for row in &rows {
        println!(
            "{}  {:<24} {:<28} in {:>7}  out {:>7}{}",
            format_epoch_millis(row.timestamp),
            truncate(&row.session_id, 24),
            truncate(&row.model_id, 28),
            format_tokens(row.tokens.input),
            format_tokens(row.tokens.output),
            if row.metadata.is_estimated { "  (est)" } else { "" }
        );
    }
    println!("{} row(s)", rows.len());
    Ok(())
}

pub fn run_watch(config: &TrackerConfig, interval: Duration) -> Result<()> {
    let settings = config.settings();
    let stop = install_stop_signal()?;

    let dirty = Arc::new(DirtyState::default());
    let mut tracker = UsageTracker::with_dirty_state(&settings, Arc::clone(&dirty));
    let mut dirty_tracker = DirtyTracker::new(
        settings.session_state_dir.clone(),
        settings.full_reconcile_interval,
        dirty,
    );
    let mut live = LiveTailWatcher::new(settings.session_state_dir.clone());
    live.set_callback(|delta| match serde_json::to_string(delta) {
        Ok(line) => println!("{line}"),
        Err(err) => warn!(error = %err, "failed to serialize live delta"),
    });

    dirty_tracker.start()?;
    live.start()?;
    info!(
        root = %settings.session_state_dir.display(),
        "watching Copilot sessions; press Ctrl+C to stop"
    );

    let mut next_query = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        if Instant::now() >= next_query {
            let rows = tracker.query(&UsageQuery::default());
            let stats = tracker.last_pass();
            info!(
                rows = rows.len(),
                reparsed = stats.map_or(0, |s| s.reparsed),
                cache_hits = stats.map_or(0, |s| s.cache_hits),
                "usage reconciled"
            );
            next_query = Instant::now() + interval;
        }
        thread::sleep(STOP_POLL);
    }

    debug!("stop requested; shutting down watchers");
    live.stop();
    dirty_tracker.stop();
    Ok(())
}

pub fn print_status(config: &TrackerConfig) -> Result<()> {
    let settings = config.settings();
    let sessions = discover_sessions(&settings.session_state_dir);
    let mut tracker = UsageTracker::new(&settings);
    let rows = tracker.query(&UsageQuery::default());
    let summaries = summarize_sessions(&rows);
    let total: u64 = summaries.iter().map(|s| s.total_tokens()).sum();

    println!("copilot-usage status");
    println!("config: {}", config::config_path().display());
    print_settings(&settings);
    println!("sessions: {}", sessions.len());
    println!("default_model: {}", tracker.default_model());
    println!("usage_rows: {}", rows.len());
    println!("total_tokens: {}", format_tokens(total));
    for summary in summaries.iter().take(5) {
        println!("  - {}", summary.describe());
    }
    Ok(())
}

pub fn doctor(config: &TrackerConfig) -> Result<u8> {
    let settings = config.settings();
    let mut issues = 0u8;

    println!("copilot-usage doctor");
    println!("config_path: {}", config::config_path().display());
    print_settings(&settings);

    if dir_accessible(&settings.session_state_dir) {
        let count = discover_sessions(&settings.session_state_dir).len();
        println!("[OK] Session-state directory accessible ({count} session(s)).");
    } else {
        issues += 1;
        println!("[WARN] Session-state directory is not accessible.");
    }

    if dir_accessible(&settings.logs_dir) {
        println!("[OK] Process log directory accessible.");
    } else {
        issues += 1;
        println!("[WARN] Process log directory is not accessible.");
    }

    let model = DefaultModelResolver::new(settings.logs_dir.clone()).resolve();
    if model == UNKNOWN_MODEL {
        issues += 1;
        println!("[WARN] Default model could not be resolved from process logs.");
    } else {
        println!("[OK] Default model: {model}");
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn print_settings(settings: &TrackerSettings) {
    println!("session_state_dir: {}", settings.session_state_dir.display());
    println!("logs_dir: {}", settings.logs_dir.display());
    println!(
        "result_cache_ttl_ms: {}",
        settings.result_cache_ttl.as_millis()
    );
    println!("max_cached_sessions: {}", settings.max_cached_sessions);
    println!(
        "full_reconcile_interval_secs: {}",
        settings.full_reconcile_interval.as_secs()
    );
}

fn dir_accessible(path: &Path) -> bool {
    std::fs::read_dir(path).is_ok()
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}
