//! The three cache tiers behind [`crate::reconcile::UsageTracker`].
//!
//! - [`ResultCache`] answers a repeated identical query without touching disk.
//! - [`FileMetadataIndex`] remembers each event log's mtime and session id so an
//!   unchanged session costs a map lookup instead of a stat.
//! - [`SessionAggregateCache`] memoizes parsed rows per session, valid only
//!   while the stored mtime equals the live one.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::parser::UsageRow;

#[derive(Debug)]
struct CachedResult {
    last_check: Instant,
    rows: Vec<UsageRow>,
    limit: Option<usize>,
    since: Option<i64>,
}

#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    slot: Option<CachedResult>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, slot: None }
    }

    /// Cached rows for an identical, non-empty, unexpired query.
    pub fn lookup(&self, limit: Option<usize>, since: Option<i64>) -> Option<&[UsageRow]> {
        let cached = self.slot.as_ref()?;
        if cached.limit != limit || cached.since != since || cached.rows.is_empty() {
            return None;
        }
        if cached.last_check.elapsed() >= self.ttl {
            return None;
        }
        Some(&cached.rows)
    }

    pub fn store(&mut self, limit: Option<usize>, since: Option<i64>, rows: Vec<UsageRow>) {
        self.slot = Some(CachedResult {
            last_check: Instant::now(),
            rows,
            limit,
            since,
        });
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub mtime_ms: i64,
    pub session_id: String,
}

/// Event-log path to last known mtime and session id. Entries are correct or
/// absent; absence forces a stat.
#[derive(Debug, Default)]
pub struct FileMetadataIndex {
    entries: HashMap<PathBuf, FileMeta>,
}

impl FileMetadataIndex {
    pub fn get(&self, path: &Path) -> Option<&FileMeta> {
        self.entries.get(path)
    }

    pub fn insert(&mut self, path: PathBuf, meta: FileMeta) {
        self.entries.insert(path, meta);
    }

    pub fn remove(&mut self, path: &Path) -> Option<FileMeta> {
        self.entries.remove(path)
    }

    /// Drops entries whose path is not in `live`; returns how many went.
    pub fn retain_paths(&mut self, live: &HashSet<PathBuf>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|path, _| live.contains(path));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone)]
struct CachedSession {
    updated_at: i64,
    rows: Vec<UsageRow>,
    last_accessed: u64,
}

/// Parsed rows per session id, bounded in size with least-recently-accessed
/// eviction. Recency is a logical tick, so ordering is total.
#[derive(Debug)]
pub struct SessionAggregateCache {
    max_entries: usize,
    entries: HashMap<String, CachedSession>,
    clock: u64,
}

impl SessionAggregateCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Rows cached for `session_id` if they were parsed at exactly `mtime_ms`.
    /// A hit refreshes the entry's recency.
    pub fn get_fresh(&mut self, session_id: &str, mtime_ms: i64) -> Option<&[UsageRow]> {
        let now = self.tick();
        let entry = self.entries.get_mut(session_id)?;
        if entry.updated_at != mtime_ms {
            return None;
        }
        entry.last_accessed = now;
        Some(&entry.rows)
    }

    /// Stores freshly parsed rows and evicts down to capacity; returns the
    /// number of evicted entries.
    pub fn store(&mut self, session_id: String, mtime_ms: i64, rows: Vec<UsageRow>) -> usize {
        let now = self.tick();
        self.entries.insert(
            session_id,
            CachedSession {
                updated_at: mtime_ms,
                rows,
                last_accessed: now,
            },
        );
        self.evict_overflow()
    }

    pub fn evict_overflow(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.max_entries {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(session_id, _)| session_id.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
            evicted += 1;
        }
        evicted
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn updated_at(&self, session_id: &str) -> Option<i64> {
        self.entries.get(session_id).map(|entry| entry.updated_at)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
