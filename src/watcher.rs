//! Filesystem watches over the session-state root.
//!
//! [`DirtyTracker`] only records which event logs changed; the next
//! reconciliation pass decides what to re-parse. Both it and the live tail
//! watcher run on [`WatchWorker`], which owns the `notify` watcher on a single
//! thread and drains its notifications in order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::discovery::{EVENTS_FILE, SessionDir, has_event_log, session_candidates};

const MIN_RESYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Paths changed since the last reconciliation pass, plus the periodic
/// request for a full pass.
#[derive(Debug, Default)]
pub struct DirtyState {
    paths: Mutex<HashSet<PathBuf>>,
    full_reconcile: AtomicBool,
}

impl DirtyState {
    fn paths(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_dirty(&self, path: impl Into<PathBuf>) {
        self.paths().insert(path.into());
    }

    pub fn is_dirty(&self, path: &Path) -> bool {
        self.paths().contains(path)
    }

    /// Snapshot and clear.
    pub fn take_dirty(&self) -> HashSet<PathBuf> {
        std::mem::take(&mut *self.paths())
    }

    pub fn request_full_reconcile(&self) {
        self.full_reconcile.store(true, Ordering::SeqCst);
    }

    /// Consume the full-reconciliation flag.
    pub fn take_full_reconcile(&self) -> bool {
        self.full_reconcile.swap(false, Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.paths().clear();
        self.full_reconcile.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    LogChanged(PathBuf),
    SessionDirAppeared(PathBuf),
    SessionDirRemoved(PathBuf),
}

/// Narrows a raw notification to what the watchers act on: a session's event
/// log changed, or an entry directly under `root` appeared or went away.
pub fn classify_notification(root: &Path, event: &Event) -> Vec<Notification> {
    if matches!(event.kind, EventKind::Access(_) | EventKind::Other) {
        return Vec::new();
    }

    let mut notifications = Vec::new();
    for (position, path) in event.paths.iter().enumerate() {
        let Some(name) = path.file_name() else {
            continue;
        };
        let parent = path.parent();
        if name == EVENTS_FILE && parent.and_then(Path::parent) == Some(root) {
            notifications.push(Notification::LogChanged(path.clone()));
        } else if parent == Some(root)
            && let Some(notification) = root_child_notification(&event.kind, position, path)
        {
            notifications.push(notification);
        }
    }
    notifications
}

fn root_child_notification(
    kind: &EventKind,
    position: usize,
    path: &Path,
) -> Option<Notification> {
    let appeared = match kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => true,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => false,
        // Paired renames list the old path first.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => position > 0,
        EventKind::Modify(ModifyKind::Name(_)) => path.exists(),
        _ => return None,
    };
    let path = path.to_path_buf();
    Some(if appeared {
        Notification::SessionDirAppeared(path)
    } else {
        Notification::SessionDirRemoved(path)
    })
}

/// Where per-directory watches are registered.
pub(crate) trait WatchTarget {
    fn add(&mut self, dir: &Path) -> Result<()>;
    fn remove(&mut self, dir: &Path);
}

impl WatchTarget for RecommendedWatcher {
    fn add(&mut self, dir: &Path) -> Result<()> {
        self.watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))
    }

    fn remove(&mut self, dir: &Path) {
        if let Err(err) = self.unwatch(dir) {
            debug!(path = %dir.display(), error = %err, "unwatch failed");
        }
    }
}

/// Watches on every directory under the root. A directory is announced to the
/// handler once its event log exists; until then it is watched but silent.
pub(crate) struct SessionWatchSet<W> {
    root: PathBuf,
    target: W,
    watched: HashSet<PathBuf>,
    announced: HashSet<PathBuf>,
}

impl<W: WatchTarget> SessionWatchSet<W> {
    pub(crate) fn new(root: PathBuf, target: W) -> Self {
        Self {
            root,
            target,
            watched: HashSet::new(),
            announced: HashSet::new(),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    #[cfg(test)]
    pub(crate) fn is_watched(&self, dir: &Path) -> bool {
        self.watched.contains(dir)
    }

    #[cfg(test)]
    pub(crate) fn is_announced(&self, dir: &Path) -> bool {
        self.announced.contains(dir)
    }

    fn ensure_watched(&mut self, dir: &Path) -> bool {
        if self.watched.contains(dir) {
            return true;
        }
        match self.target.add(dir) {
            Ok(()) => {
                self.watched.insert(dir.to_path_buf());
                true
            }
            Err(err) => {
                warn!(error = %err, "session directory watch failed");
                false
            }
        }
    }

    fn announce_if_ready(&mut self, dir: &Path) -> Option<SessionDir> {
        if self.announced.contains(dir) || !has_event_log(dir) {
            return None;
        }
        self.announced.insert(dir.to_path_buf());
        Some(SessionDir::new(dir.to_path_buf()))
    }

    /// Watches every directory under the root, releases directories that
    /// disappeared, and returns sessions whose log is now present but which
    /// were not announced before.
    pub(crate) fn sync(&mut self) -> Vec<SessionDir> {
        let candidates = session_candidates(&self.root);
        let live: HashSet<&Path> = candidates.iter().map(PathBuf::as_path).collect();
        let vanished: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|dir| !live.contains(dir.as_path()))
            .cloned()
            .collect();
        for dir in &vanished {
            self.dir_removed(dir);
        }

        let mut added = Vec::new();
        for dir in &candidates {
            if self.ensure_watched(dir)
                && let Some(session) = self.announce_if_ready(dir)
            {
                added.push(session);
            }
        }
        added
    }

    /// A directory was created or renamed into the root. It is watched right
    /// away so the later creation of its log is seen. A directory already
    /// watched is registered again, since the name may now point at a new one.
    pub(crate) fn dir_appeared(&mut self, dir: &Path) -> Option<SessionDir> {
        if !dir.is_dir() {
            return None;
        }
        if self.watched.remove(dir) {
            self.target.remove(dir);
        }
        if !self.ensure_watched(dir) {
            self.announced.remove(dir);
            return None;
        }
        self.announce_if_ready(dir)
    }

    pub(crate) fn dir_removed(&mut self, dir: &Path) {
        if self.watched.remove(dir) {
            self.target.remove(dir);
        }
        self.announced.remove(dir);
    }

    /// The log under `dir` changed. Returns the session the first time its log
    /// is seen.
    pub(crate) fn log_seen(&mut self, dir: &Path) -> Option<SessionDir> {
        if dir.parent() != Some(self.root.as_path()) || !self.ensure_watched(dir) {
            return None;
        }
        self.announce_if_ready(dir)
    }
}

pub(crate) enum WatchMessage {
    Fs(notify::Result<Event>),
    Resync,
    Stop,
}

/// Callbacks run on the watch worker thread, one notification at a time.
pub(crate) trait WatchHandler: Send + 'static {
    /// `initial` is true for the sessions watched at start-up.
    fn sessions_added(&mut self, sessions: &[SessionDir], initial: bool);
    fn log_changed(&mut self, events_path: &Path);
    /// Runs on every periodic resync, before the root is rescanned.
    fn resync(&mut self) {}
}

struct ResyncTimer {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub(crate) struct WatchWorker {
    tx: Sender<WatchMessage>,
    worker: JoinHandle<()>,
    timer: ResyncTimer,
}

impl WatchWorker {
    /// Watches `root` and everything under it, then hands notifications to
    /// `handler` on a dedicated thread. The root is rescanned every
    /// `resync_interval` to catch notifications the platform dropped.
    pub(crate) fn spawn<H: WatchHandler>(
        root: &Path,
        name: &str,
        mut handler: H,
        resync_interval: Duration,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let fs_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = fs_tx.send(WatchMessage::Fs(res));
        })
        .context("failed to create filesystem watcher")?;
        watcher
            .watch(root, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;

        let mut set = SessionWatchSet::new(root.to_path_buf(), watcher);
        let initial = set.sync();
        debug!(
            root = %root.display(),
            sessions = initial.len(),
            watcher = name,
            "watching sessions"
        );
        handler.sessions_added(&initial, true);

        let timer = spawn_resync_timer(name, resync_interval, tx.clone())?;
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        WatchMessage::Fs(Ok(event)) => {
                            handle_event(&mut set, &mut handler, &event);
                        }
                        WatchMessage::Fs(Err(err)) => {
                            warn!(error = %err, "filesystem watch error");
                        }
                        WatchMessage::Resync => handle_resync(&mut set, &mut handler),
                        WatchMessage::Stop => break,
                    }
                }
            })
            .with_context(|| format!("failed to spawn {name} thread"))?;

        Ok(Self { tx, worker, timer })
    }

    pub(crate) fn stop(self) {
        let Self { tx, worker, timer } = self;
        drop(timer.stop_tx);
        if timer.handle.join().is_err() {
            warn!("resync timer panicked");
        }
        let _ = tx.send(WatchMessage::Stop);
        if worker.join().is_err() {
            warn!("watch worker panicked");
        }
    }
}

pub(crate) fn handle_event<W: WatchTarget, H: WatchHandler>(
    set: &mut SessionWatchSet<W>,
    handler: &mut H,
    event: &Event,
) {
    for notification in classify_notification(set.root(), event) {
        match notification {
            Notification::LogChanged(path) => {
                if let Some(dir) = path.parent()
                    && let Some(session) = set.log_seen(dir)
                {
                    handler.sessions_added(&[session], false);
                }
                handler.log_changed(&path);
            }
            Notification::SessionDirAppeared(dir) => {
                if let Some(session) = set.dir_appeared(&dir) {
                    report_new_sessions(handler, &[session]);
                }
            }
            Notification::SessionDirRemoved(dir) => set.dir_removed(&dir),
        }
    }
}

pub(crate) fn handle_resync<W: WatchTarget, H: WatchHandler>(
    set: &mut SessionWatchSet<W>,
    handler: &mut H,
) {
    handler.resync();
    let added = set.sync();
    report_new_sessions(handler, &added);
}

/// Sessions found after start-up are announced, then whatever their logs
/// already hold is handed over as a change.
fn report_new_sessions<H: WatchHandler>(handler: &mut H, sessions: &[SessionDir]) {
    if sessions.is_empty() {
        return;
    }
    handler.sessions_added(sessions, false);
    for session in sessions {
        handler.log_changed(&session.events_path);
    }
}

fn spawn_resync_timer(
    name: &str,
    interval: Duration,
    worker_tx: Sender<WatchMessage>,
) -> Result<ResyncTimer> {
    let interval = interval.max(MIN_RESYNC_INTERVAL);
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name(format!("{name}-resync"))
        .spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if worker_tx.send(WatchMessage::Resync).is_err() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .with_context(|| format!("failed to spawn {name} resync timer"))?;
    Ok(ResyncTimer { stop_tx, handle })
}

struct DirtyHandler {
    state: Arc<DirtyState>,
}

impl WatchHandler for DirtyHandler {
    fn sessions_added(&mut self, _sessions: &[SessionDir], _initial: bool) {}

    fn log_changed(&mut self, events_path: &Path) {
        self.state.mark_dirty(events_path);
    }

    fn resync(&mut self) {
        debug!("requesting full reconciliation");
        self.state.request_full_reconcile();
    }
}

/// Marks event logs dirty on change and periodically requests a full
/// reconciliation in case notifications were dropped.
pub struct DirtyTracker {
    session_root: PathBuf,
    interval: Duration,
    state: Arc<DirtyState>,
    worker: Option<WatchWorker>,
}

impl DirtyTracker {
    pub fn new(
        session_root: impl Into<PathBuf>,
        interval: Duration,
        state: Arc<DirtyState>,
    ) -> Self {
        Self {
            session_root: session_root.into(),
            interval,
            state,
            worker: None,
        }
    }

    pub fn state(&self) -> Arc<DirtyState> {
        Arc::clone(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Idempotent. A missing session root is not an error; nothing is watched.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if !self.session_root.is_dir() {
            debug!(
                root = %self.session_root.display(),
                "session root missing; dirty tracking not started"
            );
            return Ok(());
        }

        let handler = DirtyHandler {
            state: Arc::clone(&self.state),
        };
        self.worker = Some(WatchWorker::spawn(
            &self.session_root,
            "copilot-usage-dirty",
            handler,
            self.interval,
        )?);
        Ok(())
    }

    /// Releases every watch and the timer, and clears dirty state.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
        self.state.clear();
    }
}

impl Drop for DirtyTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
