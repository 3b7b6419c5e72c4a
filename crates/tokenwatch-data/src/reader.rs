//! Position-tracked incremental reading of session files.
//!
//! Each `read` picks up at the offset persisted by the previous one and
//! commits the new offset exactly once, after a successful parse. A file
//! that shrank below the stored offset was truncated or rotated; the read
//! restarts from zero. Transient I/O errors are retried with exponential
//! backoff; cancellation breaks the backoff sleep immediately.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokenwatch_core::config::ReaderConfig;
use tokenwatch_core::models::UsageRecord;
use tokenwatch_core::{Result, WatchError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::parser::LineParser;
use crate::position::PositionStore;

/// Incremental, retrying reader over session files.
///
/// The reader itself is stateless apart from a handle to the position
/// store; concurrent reads of distinct paths are safe, and reads of the
/// same path are serialized by the store's locking.
pub struct UsageReader {
    store: Arc<dyn PositionStore>,
    parser: LineParser,
    config: ReaderConfig,
    closed: AtomicBool,
}

impl UsageReader {
    /// Build a reader over the given position store.
    pub fn new(store: Arc<dyn PositionStore>, config: ReaderConfig) -> Self {
        Self {
            parser: LineParser::new(&config),
            store,
            config,
            closed: AtomicBool::new(false),
        }
    }

    // ── Public API ────────────────────────────────────────────────────────

    /// Read every new record in `path` since the persisted offset.
    ///
    /// On success the store holds the new offset; the bytes between the
    /// old and new offsets will not be returned by a later read unless
    /// the offset is reset or the file is truncated.
    pub async fn read(
        &self,
        cancel: &CancellationToken,
        path: &Path,
    ) -> Result<Vec<UsageRecord>> {
        self.ensure_open()?;
        let offset = self.store.get(path)?;

        let (records, new_offset) = self.with_retries(cancel, path, offset).await?;

        if new_offset != offset {
            self.store.set(path, new_offset)?;
        }
        Ok(records)
    }

    /// One-shot read from an explicit offset, without touching the store.
    pub async fn read_from(
        &self,
        cancel: &CancellationToken,
        path: &Path,
        offset: u64,
    ) -> Result<(Vec<UsageRecord>, u64)> {
        self.ensure_open()?;
        self.with_retries(cancel, path, offset).await
    }

    /// Persist offset 0 for `path`, forcing the next read to start over.
    pub fn reset(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        self.store.set(path, 0)
    }

    /// Mark the reader inactive. Subsequent calls fail with
    /// [`WatchError::ReaderClosed`]. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WatchError::ReaderClosed);
        }
        Ok(())
    }

    /// Stat the file, apply the truncation rule and parse from the
    /// effective offset.
    fn read_once(&self, path: &Path, offset: u64) -> Result<(Vec<UsageRecord>, u64)> {
        let size = std::fs::metadata(path)
            .map_err(|source| WatchError::FileRead {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        let effective_offset = if size < offset {
            warn!(
                "File {} shrank below stored offset ({} < {}); restarting from 0",
                path.display(),
                size,
                offset
            );
            0
        } else {
            offset
        };

        if size == effective_offset {
            return Ok((Vec::new(), effective_offset));
        }

        self.parser.parse_file(path, effective_offset)
    }

    /// Attempt [`read_once`] with the reader's retry policy.
    ///
    /// Transient errors back off `retry_delay * 2^(n-1)` between attempts;
    /// permanent errors and retry exhaustion return immediately.
    /// Cancellation interrupts the backoff sleep.
    ///
    /// [`read_once`]: UsageReader::read_once
    async fn with_retries(
        &self,
        cancel: &CancellationToken,
        path: &Path,
        offset: u64,
    ) -> Result<(Vec<UsageRecord>, u64)> {
        let mut last_err: Option<WatchError> = None;

        for attempt_no in 1..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(WatchError::Cancelled);
            }

            match self.read_once(path, offset) {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() => {
                    debug!(
                        "Transient error reading {} (attempt {}/{}): {}",
                        path.display(),
                        attempt_no,
                        self.config.max_retries,
                        e
                    );
                    last_err = Some(e);
                    if attempt_no < self.config.max_retries {
                        let delay = self.config.retry_delay * 2u32.pow(attempt_no - 1);
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(WatchError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or(WatchError::Cancelled))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
