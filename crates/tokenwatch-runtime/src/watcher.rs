//! Debounced filesystem watching for session files.
//!
//! Raw notify events are coalesced per path: a burst of N events on one
//! file within the debounce interval produces exactly one downstream
//! event carrying the last observed op. Only `.jsonl` paths are
//! forwarded; directory noise is consumed internally. Consecutive backend
//! failures open a circuit breaker that stops draining until the watcher
//! is closed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use notify::{RecursiveMode, Watcher as NotifyWatcher};
use tokenwatch_core::config::WatcherConfig;
use tokenwatch_core::{Result, WatchError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ── Event types ───────────────────────────────────────────────────────────────

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
}

/// One debounced change notification.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Absolute path of the changed file.
    pub path: PathBuf,
    /// The last raw op observed during the debounce window.
    pub op: Op,
    /// When the debounced event was emitted.
    pub timestamp: chrono::DateTime<Utc>,
}

/// Raw message from the notify backend thread into the debounce task.
enum RawMsg {
    Event(notify::Event),
    Error(notify::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Closed,
}

// ── FileWatcher ───────────────────────────────────────────────────────────────

/// Debounced recursive directory watcher.
///
/// `start` is not idempotent: starting a running watcher fails with
/// [`WatchError::AlreadyStarted`], stopping an idle one with
/// [`WatchError::NotStarted`]. `close` is terminal and idempotent.
pub struct FileWatcher {
    config: WatcherConfig,
    state: State,
    backend: Option<notify::RecommendedWatcher>,
    cancel: CancellationToken,
    events_rx: Option<mpsc::Receiver<WatchEvent>>,
    errors_rx: Option<mpsc::Receiver<WatchError>>,
}

impl FileWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            state: State::Idle,
            backend: None,
            cancel: CancellationToken::new(),
            events_rx: None,
            errors_rx: None,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Begin recursive monitoring of the directories containing `paths`.
    ///
    /// Each path may be a file (its parent directory is watched) or a
    /// directory (watched directly). Duplicate directories are watched
    /// once.
    pub fn start(&mut self, paths: &[PathBuf]) -> Result<()> {
        match self.state {
            State::Running => return Err(WatchError::AlreadyStarted),
            State::Closed => return Err(WatchError::NotStarted),
            State::Idle => {}
        }

        let (raw_tx, raw_rx) = mpsc::channel::<RawMsg>(1024);
        let (events_tx, events_rx) = mpsc::channel(self.config.event_channel_capacity);
        let (errors_tx, errors_rx) = mpsc::channel(16);

        // The notify callback runs on the backend's own thread; try_send
        // keeps it from ever blocking there.
        let mut backend = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let msg = match res {
                    Ok(event) => RawMsg::Event(event),
                    Err(e) => RawMsg::Error(e),
                };
                // Raw queue full means the message is lost; the monitor's
                // periodic sweep covers any gap.
                let _ = raw_tx.try_send(msg);
            },
        )
        .map_err(|e| WatchError::Other(anyhow::anyhow!("watch backend: {e}")))?;

        for dir in watch_roots(paths) {
            backend
                .watch(&dir, RecursiveMode::Recursive)
                .map_err(|e| {
                    WatchError::Other(anyhow::anyhow!("watch {}: {e}", dir.display()))
                })?;
            debug!("Watching {}", dir.display());
        }

        self.cancel = CancellationToken::new();
        tokio::spawn(debounce_loop(
            raw_rx,
            events_tx,
            errors_tx,
            self.config.clone(),
            self.cancel.clone(),
        ));

        self.backend = Some(backend);
        self.events_rx = Some(events_rx);
        self.errors_rx = Some(errors_rx);
        self.state = State::Running;
        Ok(())
    }

    /// Take the debounced event receiver. Yields `None` after the first
    /// call or before `start`.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<WatchEvent>> {
        self.events_rx.take()
    }

    /// Take the backend error receiver.
    pub fn take_errors(&mut self) -> Option<mpsc::Receiver<WatchError>> {
        self.errors_rx.take()
    }

    /// Halt event production. The watcher may be started again.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != State::Running {
            return Err(WatchError::NotStarted);
        }
        self.cancel.cancel();
        self.backend = None;
        self.state = State::Idle;
        Ok(())
    }

    /// Release every resource. Terminal and idempotent.
    pub fn close(&mut self) {
        if self.state == State::Running {
            self.cancel.cancel();
            self.backend = None;
        }
        self.events_rx = None;
        self.errors_rx = None;
        self.state = State::Closed;
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Debounce task ─────────────────────────────────────────────────────────────

struct Pending {
    op: Op,
    deadline: Instant,
}

/// Coalesce raw events per path and emit them once the path has been
/// quiet for the debounce interval.
async fn debounce_loop(
    mut raw_rx: mpsc::Receiver<RawMsg>,
    events_tx: mpsc::Sender<WatchEvent>,
    errors_tx: mpsc::Sender<WatchError>,
    config: WatcherConfig,
    cancel: CancellationToken,
) {
    let mut pending: HashMap<PathBuf, Pending> = HashMap::new();
    let mut failures: u32 = 0;
    let mut breaker_open = false;

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();
        let far_future = Instant::now() + std::time::Duration::from_secs(3_600);

        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = raw_rx.recv(), if !breaker_open => {
                match msg {
                    None => break,
                    Some(RawMsg::Event(event)) => {
                        if let Some(op) = map_op(&event.kind) {
                            let deadline = Instant::now() + config.debounce_interval;
                            for path in event.paths {
                                if !is_session_path(&path) {
                                    continue;
                                }
                                // Re-arming the timer drops any earlier op
                                // for the path; the last raw op wins.
                                pending.insert(path, Pending { op, deadline });
                            }
                        }
                    }
                    Some(RawMsg::Error(e)) => {
                        failures += 1;
                        warn!("Watch backend error ({failures} consecutive): {e}");
                        if failures >= config.circuit_breaker_threshold {
                            breaker_open = true;
                            let _ = errors_tx.try_send(WatchError::CircuitBreakerOpen {
                                failures,
                            });
                        } else {
                            let _ = errors_tx.try_send(WatchError::Other(anyhow::anyhow!(
                                "watch backend: {e}"
                            )));
                        }
                    }
                }
            }

            _ = tokio::time::sleep_until(next_deadline.unwrap_or(far_future)),
                if next_deadline.is_some() =>
            {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    let Some(entry) = pending.remove(&path) else { continue };
                    let event = WatchEvent {
                        path,
                        op: entry.op,
                        timestamp: Utc::now(),
                    };
                    match events_tx.try_send(event) {
                        Ok(()) => failures = 0,
                        Err(mpsc::error::TrySendError::Full(ev)) => {
                            warn!("Event channel full; dropping event for {}", ev.path.display());
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
            }
        }
    }
}

/// Map a raw notify kind onto the watcher's op set.
///
/// Access events and unclassified noise carry no file change and are
/// dropped.
fn map_op(kind: &notify::EventKind) -> Option<Op> {
    use notify::event::{EventKind, ModifyKind};
    match kind {
        EventKind::Create(_) => Some(Op::Create),
        EventKind::Remove(_) => Some(Op::Remove),
        EventKind::Modify(ModifyKind::Name(_)) => Some(Op::Rename),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(Op::Chmod),
        EventKind::Modify(_) => Some(Op::Write),
        _ => None,
    }
}

/// Only session logs pass the filter; directory events are internal.
fn is_session_path(path: &Path) -> bool {
    path.extension().map(|ext| ext == "jsonl").unwrap_or(false)
}

/// Unique set of directories to hand to the backend.
fn watch_roots(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut roots: HashSet<PathBuf> = HashSet::new();
    for path in paths {
        if path.is_dir() {
            roots.insert(path.clone());
        } else if let Some(parent) = path.parent() {
            roots.insert(parent.to_path_buf());
        }
    }
    roots.into_iter().collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
