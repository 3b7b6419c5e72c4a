use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the tokenwatch pipeline.
#[derive(Error, Debug)]
pub enum WatchError {
    /// A file could not be opened or read from disk.
    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A session file exceeds the configured size cap.
    #[error("File too large: {path} is {size} bytes (limit {limit})")]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    /// A single JSONL line is not valid JSON.
    #[error("Malformed line {line_no}: {snippet}")]
    Malformed { line_no: u64, snippet: String },

    /// A decoded record violates an invariant.
    #[error("Invalid record at line {line_no}: {reason}")]
    Validation { line_no: u64, reason: String },

    /// The persisted offset is beyond anything usable for the file.
    #[error("Invalid offset {offset} for {path}")]
    InvalidOffset { path: PathBuf, offset: u64 },

    /// The reader was closed; no further reads are possible.
    #[error("Reader is closed")]
    ReaderClosed,

    /// The watcher is already running.
    #[error("Watcher already started")]
    AlreadyStarted,

    /// The watcher is not running.
    #[error("Watcher not started")]
    NotStarted,

    /// Too many consecutive watcher backend failures.
    #[error("Watcher circuit breaker open after {failures} consecutive failures")]
    CircuitBreakerOpen { failures: u32 },

    /// The monitor has been closed and cannot be restarted.
    #[error("Monitor is closed")]
    MonitorClosed,

    /// The monitor is already running.
    #[error("Monitor is already running")]
    MonitorRunning,

    /// The monitor is not running.
    #[error("Monitor is not running")]
    MonitorNotRunning,

    /// Discovery found no session files matching the filter.
    #[error("No sessions found to monitor")]
    NoSessions,

    /// The operation was cancelled via its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// A position or session store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// A session name is already bound to a different session.
    #[error("Session name {name:?} is already in use")]
    NameTaken { name: String },

    /// No session is known under the given id.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// A JSON document could not be parsed.
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Pass-through for any raw I/O error that does not carry a path.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catch-all for errors from third-party crates via `anyhow`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WatchError {
    /// `true` when a read attempt hitting this error may be retried.
    ///
    /// Transient conditions: file not found (the file may reappear right
    /// after a rotate) and locked / busy files. Permission, size-cap,
    /// offset and state errors are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            WatchError::FileRead { source, .. } => is_transient_io(source),
            WatchError::Io(source) => is_transient_io(source),
            _ => false,
        }
    }
}

fn is_transient_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
    )
}

/// Convenience alias used throughout the tokenwatch crates.
pub type Result<T> = std::result::Result<T, WatchError>;
