//! Push-style live usage: reads only the bytes appended to each event log and
//! reports one [`LiveDelta`] per assistant message. Independent of the
//! reconciliation caches.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::discovery::SessionDir;
use crate::events::{Tokens, as_assistant_message};
use crate::util::{now_millis, parse_jsonl_bytes, parse_timestamp_millis};
use crate::watcher::{WatchHandler, WatchWorker};
use crate::workspace::{read_workspace, resolve_session_id};

/// How often the tail rescans the root for sessions whose notifications were
/// lost.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveDelta {
    pub session_id: String,
    pub message_id: String,
    pub tokens: Tokens,
    pub timestamp: i64,
}

pub type LiveCallback = Arc<dyn Fn(&LiveDelta) + Send + Sync>;

/// Read offsets per event log.
#[derive(Debug, Default)]
pub struct TailState {
    offsets: HashMap<PathBuf, u64>,
}

impl TailState {
    /// Starts tracking at the log's current length so existing content is
    /// not reported.
    pub fn prime(&mut self, events_path: &Path) -> u64 {
        let len = fs::metadata(events_path).map(|meta| meta.len()).unwrap_or(0);
        self.offsets.insert(events_path.to_path_buf(), len);
        len
    }

    /// Tracks a log that appeared after start-up from its first byte. A log
    /// tracked before is restarted, since its directory was replaced.
    pub fn track_from_start(&mut self, events_path: &Path) {
        self.offsets.insert(events_path.to_path_buf(), 0);
    }

    pub fn offset(&self, events_path: &Path) -> Option<u64> {
        self.offsets.get(events_path).copied()
    }

    /// Deltas for everything appended since the last read. The offset moves
    /// to the end of what was read even when no assistant message was found;
    /// a log shorter than the offset is read again from byte 0.
    pub fn read_appended(&mut self, events_path: &Path) -> Vec<LiveDelta> {
        let Ok(metadata) = fs::metadata(events_path) else {
            self.offsets.remove(events_path);
            return Vec::new();
        };
        let len = metadata.len();
        let mut start = self.offset(events_path).unwrap_or(0);
        if len < start {
            debug!(
                path = %events_path.display(),
                offset = start,
                len,
                "event log shrank; rereading from start"
            );
            start = 0;
        }
        if len == start {
            self.offsets.insert(events_path.to_path_buf(), len);
            return Vec::new();
        }

        let chunk = match read_range(events_path, start, len) {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!(path = %events_path.display(), error = %err, "tail read failed");
                return Vec::new();
            }
        };
        self.offsets
            .insert(events_path.to_path_buf(), start + chunk.len() as u64);
        deltas_from_chunk(events_path, &chunk)
    }
}

fn read_range(path: &Path, start: u64, end: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut chunk = Vec::with_capacity((end - start) as usize);
    file.take(end - start).read_to_end(&mut chunk)?;
    Ok(chunk)
}

fn deltas_from_chunk(events_path: &Path, chunk: &[u8]) -> Vec<LiveDelta> {
    let report = parse_jsonl_bytes(chunk);
    let messages: Vec<_> = report
        .records
        .iter()
        .filter_map(as_assistant_message)
        .collect();
    if messages.is_empty() {
        return Vec::new();
    }

    let session_dir = events_path.parent().unwrap_or(Path::new(""));
    let session_id = resolve_session_id(session_dir, read_workspace(session_dir).as_ref());
    let received_at = now_millis();
    messages
        .into_iter()
        .map(|message| LiveDelta {
            session_id: session_id.clone(),
            tokens: message.token_figures().tokens,
            timestamp: parse_timestamp_millis(message.timestamp.as_deref(), received_at),
            message_id: message.message_id,
        })
        .collect()
}

#[derive(Default, Clone)]
struct CallbackSlot {
    inner: Arc<Mutex<Option<LiveCallback>>>,
}

impl CallbackSlot {
    fn lock(&self) -> MutexGuard<'_, Option<LiveCallback>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replace(&self, callback: Option<LiveCallback>) {
        *self.lock() = callback;
    }

    fn current(&self) -> Option<LiveCallback> {
        self.lock().clone()
    }
}

struct TailHandler {
    state: TailState,
    callback: CallbackSlot,
}

impl WatchHandler for TailHandler {
    fn sessions_added(&mut self, sessions: &[SessionDir], initial: bool) {
        for session in sessions {
            if initial {
                self.state.prime(&session.events_path);
            } else {
                self.state.track_from_start(&session.events_path);
            }
        }
    }

    fn log_changed(&mut self, events_path: &Path) {
        let deltas = self.state.read_appended(events_path);
        if deltas.is_empty() {
            return;
        }
        let Some(callback) = self.callback.current() else {
            return;
        };
        for delta in &deltas {
            callback(delta);
        }
    }
}

/// Watches the session-state root and pushes [`LiveDelta`]s to the registered
/// callback. Only one callback is held; registering another replaces it.
pub struct LiveTailWatcher {
    session_root: PathBuf,
    resync_interval: Duration,
    callback: CallbackSlot,
    worker: Option<WatchWorker>,
}

impl LiveTailWatcher {
    pub fn new(session_root: impl Into<PathBuf>) -> Self {
        Self::with_resync_interval(session_root, DEFAULT_RESYNC_INTERVAL)
    }

    pub fn with_resync_interval(
        session_root: impl Into<PathBuf>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            session_root: session_root.into(),
            resync_interval,
            callback: CallbackSlot::default(),
            worker: None,
        }
    }

    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&LiveDelta) + Send + Sync + 'static,
    {
        self.callback.replace(Some(Arc::new(callback)));
    }

    pub fn clear_callback(&self) {
        self.callback.replace(None);
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Idempotent. Existing logs are primed at their current length.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if !self.session_root.is_dir() {
            debug!(
                root = %self.session_root.display(),
                "session root missing; live tail not started"
            );
            return Ok(());
        }
        let handler = TailHandler {
            state: TailState::default(),
            callback: self.callback.clone(),
        };
        self.worker = Some(WatchWorker::spawn(
            &self.session_root,
            "copilot-usage-tail",
            handler,
            self.resync_interval,
        )?);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Drop for LiveTailWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
