//! Live coordination of discovery, reading, watching and aggregation.
//!
//! The monitor backfills every discovered session file, then keeps the
//! aggregator current from two directions: watcher events trigger a read
//! of the changed file, and a periodic tick sweeps every monitored file
//! so missed notifications can never stall the stream. Updates flow to a
//! bounded channel that drops (never blocks) when full.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokenwatch_core::config::MonitorConfig;
use tokenwatch_core::models::{Statistics, Update};
use tokenwatch_core::{Result, WatchError};
use tokenwatch_data::discovery;
use tokenwatch_data::reader::UsageReader;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::UsageAggregator;
use crate::watcher::FileWatcher;

/// Burn-rate window reported in every update.
const BURN_RATE_WINDOW: Duration = Duration::from_secs(5 * 60);

// ── State machine ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    Created,
    Running,
    Stopped,
    Closed,
}

// ── Shared task context ───────────────────────────────────────────────────────

/// State shared by the event task, the tick task and the monitor facade.
struct Shared {
    reader: Arc<UsageReader>,
    aggregator: Arc<UsageAggregator>,
    /// session_id -> monitored file path.
    session_paths: HashMap<String, PathBuf>,
    /// filename -> monitored file path, for matching watcher events whose
    /// paths differ from ours in symlink resolution.
    by_file_name: HashMap<OsString, PathBuf>,
    session_filter: String,
    clear_screen: bool,
    update_tx: mpsc::Sender<Update>,
    /// Serializes update computation so `last_stats` and the remembered
    /// non-zero delta change atomically.
    send_state: Mutex<SendState>,
    cancel: CancellationToken,
}

struct SendState {
    initial_stats: Statistics,
    last_stats: Statistics,
    last_nonzero_delta: Statistics,
}

impl Shared {
    /// Resolve a watcher event path to a monitored file, if any.
    fn resolve(&self, path: &std::path::Path) -> Option<PathBuf> {
        if self.session_paths.values().any(|p| p == path) {
            return Some(path.to_path_buf());
        }
        path.file_name()
            .and_then(|name| self.by_file_name.get(name))
            .cloned()
    }

    /// Read new bytes of one file into the aggregator. Per-file errors
    /// are logged and swallowed so one broken file cannot stop the
    /// stream.
    async fn ingest(&self, path: &std::path::Path) {
        match self.reader.read(&self.cancel, path).await {
            Ok(records) => {
                for record in &records {
                    self.aggregator.add(record);
                }
                if !records.is_empty() {
                    debug!("Ingested {} records from {}", records.len(), path.display());
                }
            }
            Err(WatchError::Cancelled) => {}
            Err(e) => warn!("Read of {} failed: {}", path.display(), e),
        }
    }

    /// Compute and push one update.
    ///
    /// The whole computation holds the send lock, so concurrent callers
    /// (event task and tick task) serialize here.
    async fn send_update(&self) {
        let mut state = self.send_state.lock().await;

        let current = self.aggregator.stats();
        let delta = current.delta_since(&state.last_stats);
        let cumulative = current.delta_since(&state.initial_stats);
        if delta.count > 0 || delta.total_tokens > 0 {
            state.last_nonzero_delta = delta;
        }

        let update = Update {
            timestamp: Utc::now(),
            delta: state.last_nonzero_delta.clone(),
            cumulative,
            burn_rate: self
                .aggregator
                .burn_rate(&self.session_filter, BURN_RATE_WINDOW),
            current_block: self.aggregator.current_billing_block(&self.session_filter),
            session_filter: (!self.session_filter.is_empty())
                .then(|| self.session_filter.clone()),
            clear_screen: self.clear_screen,
            stats: current.clone(),
        };
        state.last_stats = current;
        drop(state);

        match self.update_tx.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Update channel full; dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Update channel closed");
            }
        }
    }
}

// ── LiveMonitor ───────────────────────────────────────────────────────────────

/// Coordinates the ingestion pipeline and produces the update stream.
pub struct LiveMonitor {
    config: MonitorConfig,
    bases: Vec<PathBuf>,
    reader: Arc<UsageReader>,
    aggregator: Arc<UsageAggregator>,
    watcher: FileWatcher,
    state: MonitorState,
    shared: Option<Arc<Shared>>,
    update_rx: Option<mpsc::Receiver<Update>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LiveMonitor {
    /// Build a monitor over the given discovery bases.
    ///
    /// The reader, aggregator and watcher are injected so tests can swap
    /// stores and tune debounce behaviour.
    pub fn new(
        config: MonitorConfig,
        bases: Vec<PathBuf>,
        reader: Arc<UsageReader>,
        aggregator: Arc<UsageAggregator>,
        watcher: FileWatcher,
    ) -> Self {
        Self {
            config,
            bases,
            reader,
            aggregator,
            watcher,
            state: MonitorState::Created,
            shared: None,
            update_rx: None,
            tasks: Vec::new(),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Discover sessions, backfill them, start the watcher and launch the
    /// event and tick tasks. Emits an initial update before returning.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            MonitorState::Closed => return Err(WatchError::MonitorClosed),
            MonitorState::Running => return Err(WatchError::MonitorRunning),
            MonitorState::Created | MonitorState::Stopped => {}
        }

        // ── Discovery ─────────────────────────────────────────────────────
        let discovered = discovery::discover(&self.bases);
        let session_paths: HashMap<String, PathBuf> = discovered
            .into_iter()
            .filter(|s| {
                self.config.session_ids.is_empty()
                    || self.config.session_ids.contains(&s.session_id)
            })
            .map(|s| (s.session_id, s.file_path))
            .collect();
        if session_paths.is_empty() {
            return Err(WatchError::NoSessions);
        }
        info!("Monitoring {} session file(s)", session_paths.len());

        let cancel = CancellationToken::new();

        // ── Backfill ──────────────────────────────────────────────────────
        // Aggregator state belongs to one monitoring session; a restart
        // begins from a clean slate and re-reads complete history.
        self.aggregator.reset();
        for path in session_paths.values() {
            if let Err(e) = self.reader.reset(path) {
                warn!("Offset reset failed for {}: {}", path.display(), e);
            }
        }
        for path in session_paths.values() {
            match self.reader.read(&cancel, path).await {
                Ok(records) => {
                    for record in &records {
                        self.aggregator.add(record);
                    }
                }
                Err(e) => warn!("Initial read of {} failed: {}", path.display(), e),
            }
        }

        let initial_stats = self.aggregator.stats();

        // ── Watcher ───────────────────────────────────────────────────────
        let paths: Vec<PathBuf> = session_paths.values().cloned().collect();
        self.watcher.start(&paths)?;
        let mut events_rx = self
            .watcher
            .take_events()
            .ok_or_else(|| WatchError::Store("watcher events already taken".to_string()))?;

        if let Some(mut errors_rx) = self.watcher.take_errors() {
            let err_cancel = cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = err_cancel.cancelled() => break,
                        err = errors_rx.recv() => match err {
                            Some(e) => warn!("Watcher error: {}", e),
                            None => break,
                        }
                    }
                }
            }));
        }

        // ── Shared context ────────────────────────────────────────────────
        let (update_tx, update_rx) = mpsc::channel(self.config.update_channel_capacity);
        let session_filter = if self.config.session_ids.len() == 1 {
            self.config.session_ids[0].clone()
        } else {
            String::new()
        };
        let by_file_name = session_paths
            .values()
            .filter_map(|p| p.file_name().map(|n| (n.to_os_string(), p.clone())))
            .collect();

        let shared = Arc::new(Shared {
            reader: Arc::clone(&self.reader),
            aggregator: Arc::clone(&self.aggregator),
            session_paths,
            by_file_name,
            session_filter,
            clear_screen: self.config.clear_screen,
            update_tx,
            send_state: Mutex::new(SendState {
                last_stats: initial_stats.clone(),
                initial_stats,
                last_nonzero_delta: Statistics::default(),
            }),
            cancel: cancel.clone(),
        });

        // ── Event task ────────────────────────────────────────────────────
        let event_shared = Arc::clone(&shared);
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = event_shared.cancel.cancelled() => break,
                    event = events_rx.recv() => {
                        let Some(event) = event else { break };
                        let Some(path) = event_shared.resolve(&event.path) else {
                            continue;
                        };
                        debug!("Change event {:?} for {}", event.op, path.display());
                        event_shared.ingest(&path).await;
                        event_shared.send_update().await;
                    }
                }
            }
        }));

        // ── Tick task ─────────────────────────────────────────────────────
        let tick_shared = Arc::clone(&shared);
        let refresh = self.config.refresh_interval;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh);
            // The first tick fires immediately; the initial update already
            // covered it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tick_shared.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let paths: Vec<PathBuf> =
                            tick_shared.session_paths.values().cloned().collect();
                        for path in paths {
                            tick_shared.ingest(&path).await;
                        }
                        tick_shared.send_update().await;
                    }
                }
            }
        }));

        // ── Initial update ────────────────────────────────────────────────
        shared.send_update().await;

        self.shared = Some(shared);
        self.update_rx = Some(update_rx);
        self.state = MonitorState::Running;
        Ok(())
    }

    /// Take the update stream receiver. Available once after `start`.
    pub fn updates(&mut self) -> Option<mpsc::Receiver<Update>> {
        self.update_rx.take()
    }

    /// Stop the pipeline. The monitor may be started again.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != MonitorState::Running {
            return Err(WatchError::MonitorNotRunning);
        }
        if let Some(shared) = &self.shared {
            shared.cancel.cancel();
        }
        if let Err(e) = self.watcher.stop() {
            debug!("Watcher stop: {}", e);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared = None;
        self.state = MonitorState::Stopped;
        Ok(())
    }

    /// Release everything. Terminal and idempotent; also closes the
    /// update channel.
    pub fn close(&mut self) {
        if self.state == MonitorState::Running {
            let _ = self.stop();
        }
        self.watcher.close();
        self.reader.close();
        self.update_rx = None;
        self.shared = None;
        self.state = MonitorState::Closed;
    }

    /// Clear the aggregator without stopping the pipeline.
    ///
    /// The next update reports a fresh baseline: zero stats, zero delta,
    /// zero cumulative.
    pub async fn reset_stats(&self) {
        self.aggregator.reset();
        if let Some(shared) = &self.shared {
            let mut state = shared.send_state.lock().await;
            let fresh = shared.aggregator.stats();
            state.initial_stats = fresh.clone();
            state.last_stats = fresh;
            state.last_nonzero_delta = Statistics::default();
        }
    }
}

impl Drop for LiveMonitor {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
