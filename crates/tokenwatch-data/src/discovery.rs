//! Session-file discovery.
//!
//! Session logs live two levels below a configured base directory:
//! `<base>/<project-dir>/<uuid>.jsonl`. Only files whose stem is a
//! canonical UUID are considered session files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokenwatch_core::models::SessionFile;
use tokenwatch_core::session_id::session_id_from_file_name;
use tracing::warn;

/// Find every session file under the given base directories.
///
/// Unreadable or missing bases are skipped with a warning; entries that
/// are not `project/uuid.jsonl` shaped are ignored. Results are sorted by
/// path so repeated runs are deterministic.
pub fn discover(bases: &[PathBuf]) -> Vec<SessionFile> {
    let mut files: Vec<SessionFile> = Vec::new();

    for base in bases {
        if !base.is_dir() {
            warn!("Session base does not exist: {}", base.display());
            continue;
        }

        for entry in walkdir::WalkDir::new(base)
            .min_depth(2)
            .max_depth(2)
            .follow_links(true)
            .into_iter()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", base.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(session) = session_file_from_path(entry.path()) {
                files.push(session);
            }
        }
    }

    files.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    files
}

/// Enumerate the session files of a single project directory.
pub fn discover_project(dir: &Path) -> Vec<SessionFile> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read project directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut files: Vec<SessionFile> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| session_file_from_path(&entry.path()))
        .collect();

    files.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    files
}

/// Build a [`SessionFile`] from a path whose filename is `uuid.jsonl`.
///
/// Returns `None` when the name does not match or the file cannot be
/// stat'ed (it may have vanished between listing and stat).
fn session_file_from_path(path: &Path) -> Option<SessionFile> {
    let name = path.file_name()?.to_str()?;
    let session_id = session_id_from_file_name(name)?;

    let metadata = match path.metadata() {
        Ok(m) => m,
        Err(e) => {
            warn!("Cannot stat session file {}: {}", path.display(), e);
            return None;
        }
    };

    let mod_time: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Some(SessionFile {
        session_id: session_id.to_string(),
        file_path: path.to_path_buf(),
        project_path: path.parent().unwrap_or(Path::new("")).to_path_buf(),
        size: metadata.len(),
        mod_time,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
