//! JSONL line and file parsing for session usage logs.
//!
//! The parser decodes one usage record per line and tracks byte offsets so
//! the reader can resume a file exactly where the previous pass stopped.
//! Offsets are only committed for fully newline-terminated lines: a
//! trailing partial line is left for the next pass.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokenwatch_core::config::ReaderConfig;
use tokenwatch_core::models::{TokenUsage, UsageRecord};
use tokenwatch_core::{Result, WatchError};
use tracing::warn;

// ── Wire format ───────────────────────────────────────────────────────────────

/// One raw JSONL line as the assistant writes it. Unknown fields are
/// ignored.
#[derive(Debug, Deserialize)]
struct RawLine {
    timestamp: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    message: Option<RawMessage>,
    #[serde(rename = "costUSD")]
    cost_usd: Option<f64>,
    #[serde(rename = "requestId")]
    request_id: Option<String>,
    version: Option<String>,
    cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: Option<String>,
    model: Option<String>,
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}

// ── LineParser ────────────────────────────────────────────────────────────────

/// Decodes JSONL usage lines and scans files from a byte offset.
#[derive(Debug, Clone)]
pub struct LineParser {
    max_file_size: u64,
    max_line_bytes: u64,
}

impl LineParser {
    /// Build a parser from reader configuration.
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            max_line_bytes: config.max_line_bytes,
        }
    }

    /// Decode a single line into a [`UsageRecord`].
    ///
    /// Returns [`WatchError::Malformed`] for invalid JSON and
    /// [`WatchError::Validation`] for structurally valid lines that
    /// violate a record invariant (missing timestamp, bad session id,
    /// empty model, absent usage counters).
    pub fn parse_line(&self, line: &str, line_no: u64) -> Result<UsageRecord> {
        let raw: RawLine =
            serde_json::from_str(line).map_err(|_| WatchError::Malformed {
                line_no,
                snippet: snippet(line),
            })?;

        let validation = |reason: String| WatchError::Validation { line_no, reason };

        let ts_str = raw
            .timestamp
            .ok_or_else(|| validation("missing timestamp".to_string()))?;
        let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| validation(format!("bad timestamp {:?}: {}", ts_str, e)))?;

        let session_id = raw
            .session_id
            .ok_or_else(|| validation("missing sessionId".to_string()))?;

        let message = raw
            .message
            .ok_or_else(|| validation("no message payload".to_string()))?;
        let model = message
            .model
            .filter(|m| !m.is_empty())
            .ok_or_else(|| validation("missing model".to_string()))?;
        let usage = message
            .usage
            .ok_or_else(|| validation("no usage counters".to_string()))?;

        let record = UsageRecord {
            timestamp,
            session_id,
            model,
            usage: TokenUsage {
                input_tokens: usage.input_tokens.unwrap_or(0),
                output_tokens: usage.output_tokens.unwrap_or(0),
                cache_creation_input_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
                cache_read_input_tokens: usage.cache_read_input_tokens.unwrap_or(0),
            },
            cost_usd: raw.cost_usd,
            message_id: message.id,
            request_id: raw.request_id,
            version: raw.version,
            cwd: raw.cwd,
        };

        record.validate().map_err(validation)?;
        Ok(record)
    }

    /// Scan `path` from `offset` and return every decodable record plus
    /// the new offset.
    ///
    /// * Files larger than the configured cap are rejected.
    /// * Malformed and invariant-violating lines are skipped with a
    ///   logged warning; the offset still advances past them.
    /// * An unterminated final line is not consumed: its bytes are not
    ///   counted into the returned offset, so the next pass picks it up
    ///   once a newline arrives.
    pub fn parse_file(&self, path: &Path, offset: u64) -> Result<(Vec<UsageRecord>, u64)> {
        let file = File::open(path).map_err(|source| WatchError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let size = file
            .metadata()
            .map_err(|source| WatchError::FileRead {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        if size > self.max_file_size {
            return Err(WatchError::FileTooLarge {
                path: path.to_path_buf(),
                size,
                limit: self.max_file_size,
            });
        }
        if offset > size {
            return Err(WatchError::InvalidOffset {
                path: path.to_path_buf(),
                offset,
            });
        }

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|source| WatchError::FileRead {
                path: path.to_path_buf(),
                source,
            })?;

        let mut records = Vec::new();
        let mut position = offset;
        let mut line_no = 0u64;
        let mut buf: Vec<u8> = Vec::new();

        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .map_err(|source| WatchError::FileRead {
                    path: path.to_path_buf(),
                    source,
                })?;
            if n == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                // Partial trailing line: leave it for the next pass.
                break;
            }

            position += n as u64;
            line_no += 1;

            if n as u64 > self.max_line_bytes {
                warn!(
                    "Skipping oversized line {} in {} ({} bytes, cap {})",
                    line_no,
                    path.display(),
                    n,
                    self.max_line_bytes
                );
                continue;
            }

            let line = String::from_utf8_lossy(&buf);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match self.parse_line(trimmed, line_no) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Skipping line {} in {}: {}", line_no, path.display(), e);
                }
            }
        }

        Ok((records, position))
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new(&ReaderConfig::default())
    }
}

/// Shorten a line for inclusion in an error message.
fn snippet(line: &str) -> String {
    const MAX: usize = 80;
    if line.len() <= MAX {
        line.to_string()
    } else {
        let mut end = MAX;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &line[..end])
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
