use std::cmp::Reverse;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::cache::{FileMeta, FileMetadataIndex, ResultCache, SessionAggregateCache};
use crate::config::TrackerSettings;
use crate::default_model::DefaultModelResolver;
use crate::discovery::{SessionDir, discover_sessions};
use crate::parser::{UsageRow, parse_session};
use crate::util::file_mtime_millis;
use crate::watcher::DirtyState;
use crate::workspace::{read_workspace, resolve_session_id};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageQuery {
    pub limit: Option<usize>,
    /// Epoch milliseconds; sessions last modified earlier are left out.
    pub since: Option<i64>,
    pub session_id: Option<String>,
}

/// Counters for one slow-path pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub discovered: usize,
    pub dirty: usize,
    pub forced: bool,
    pub index_hits: usize,
    pub stat_calls: usize,
    pub vanished: usize,
    pub included: usize,
    pub cache_hits: usize,
    pub reparsed: usize,
    pub evicted: usize,
    pub pruned: usize,
}

/// Incremental bulk query over every session under the session-state root.
pub struct UsageTracker {
    session_root: PathBuf,
    result_cache: ResultCache,
    metadata_index: FileMetadataIndex,
    aggregate_cache: SessionAggregateCache,
    default_model: DefaultModelResolver,
    dirty: Arc<DirtyState>,
    last_pass: Option<PassStats>,
}

impl UsageTracker {
    pub fn new(settings: &TrackerSettings) -> Self {
        Self::with_dirty_state(settings, Arc::new(DirtyState::default()))
    }

    /// Shares `dirty` with a [`crate::watcher::DirtyTracker`].
    pub fn with_dirty_state(settings: &TrackerSettings, dirty: Arc<DirtyState>) -> Self {
        Self {
            session_root: settings.session_state_dir.clone(),
            result_cache: ResultCache::new(settings.result_cache_ttl),
            metadata_index: FileMetadataIndex::default(),
            aggregate_cache: SessionAggregateCache::new(settings.max_cached_sessions),
            default_model: DefaultModelResolver::new(settings.logs_dir.clone()),
            dirty,
            last_pass: None,
        }
    }

    pub fn dirty_state(&self) -> Arc<DirtyState> {
        Arc::clone(&self.dirty)
    }

    pub fn last_pass(&self) -> Option<&PassStats> {
        self.last_pass.as_ref()
    }

    pub fn metadata_index(&self) -> &FileMetadataIndex {
        &self.metadata_index
    }

    pub fn aggregate_cache(&self) -> &SessionAggregateCache {
        &self.aggregate_cache
    }

    pub fn default_model(&mut self) -> String {
        self.default_model.resolve()
    }

    /// Drops every cached tier; the next query re-stats and re-parses.
    pub fn invalidate(&mut self) {
        self.result_cache.clear();
        self.metadata_index.clear();
        self.aggregate_cache.clear();
    }

    pub fn query(&mut self, query: &UsageQuery) -> Vec<UsageRow> {
        if query.session_id.is_none()
            && let Some(rows) = self.result_cache.lookup(query.limit, query.since)
        {
            debug!(rows = rows.len(), "serving usage from result cache");
            return rows.to_vec();
        }

        let dirty = self.dirty.take_dirty();
        let forced = self.dirty.take_full_reconcile();
        let sessions = discover_sessions(&self.session_root);
        let default_model = self.default_model.resolve();

        let mut stats = PassStats {
            discovered: sessions.len(),
            dirty: dirty.len(),
            forced,
            ..PassStats::default()
        };
        let filter = query.session_id.as_deref();
        let mut seen: HashSet<PathBuf> = HashSet::with_capacity(sessions.len());
        let mut included: Vec<(SessionDir, FileMeta)> = Vec::new();

        for session in sessions {
            seen.insert(session.events_path.clone());
            let indexed = self.metadata_index.get(&session.events_path).cloned();

            if let Some(wanted) = filter
                && let Some(entry) = &indexed
                && entry.session_id != wanted
            {
                continue;
            }

            let meta = if !forced
                && !dirty.contains(&session.events_path)
                && let Some(entry) = indexed.as_ref()
            {
                stats.index_hits += 1;
                entry.clone()
            } else {
                stats.stat_calls += 1;
                let Some(mtime_ms) = file_mtime_millis(&session.events_path) else {
                    debug!(
                        path = %session.events_path.display(),
                        "event log vanished during sweep"
                    );
                    self.metadata_index.remove(&session.events_path);
                    stats.vanished += 1;
                    continue;
                };
                match indexed {
                    Some(entry) if entry.mtime_ms == mtime_ms => entry,
                    _ => {
                        let entry = FileMeta {
                            mtime_ms,
                            session_id: resolve_session_id(
                                &session.dir,
                                read_workspace(&session.dir).as_ref(),
                            ),
                        };
                        self.metadata_index.insert(session.events_path.clone(), entry.clone());
                        entry
                    }
                }
            };

            if filter.is_some_and(|wanted| meta.session_id != wanted) {
                continue;
            }
            if query.since.is_some_and(|since| meta.mtime_ms < since) {
                continue;
            }
            included.push((session, meta));
        }

        stats.pruned = self.metadata_index.retain_paths(&seen);
        included.sort_by_key(|(_, meta)| Reverse(meta.mtime_ms));
        stats.included = included.len();

        let mut rows: Vec<UsageRow> = Vec::new();
        for (session, meta) in &included {
            if let Some(cached) = self.aggregate_cache.get_fresh(&meta.session_id, meta.mtime_ms) {
                stats.cache_hits += 1;
                rows.extend_from_slice(cached);
                continue;
            }
            let parsed = parse_session(&session.dir, meta.mtime_ms, &default_model);
            stats.reparsed += 1;
            rows.extend_from_slice(&parsed);
            stats.evicted += self
                .aggregate_cache
                .store(meta.session_id.clone(), meta.mtime_ms, parsed);
        }
        stats.evicted += self.aggregate_cache.evict_overflow();

        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        if query.session_id.is_none() {
            self.result_cache.store(query.limit, query.since, rows.clone());
        }

        debug!(
            discovered = stats.discovered,
            stat_calls = stats.stat_calls,
            index_hits = stats.index_hits,
            cache_hits = stats.cache_hits,
            reparsed = stats.reparsed,
            evicted = stats.evicted,
            forced = stats.forced,
            rows = rows.len(),
            "usage reconciliation pass finished"
        );
        self.last_pass = Some(stats);
        rows
    }
}
