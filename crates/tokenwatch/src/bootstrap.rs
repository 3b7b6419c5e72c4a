use std::collections::HashSet;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable listing extra session roots (colon or comma
/// separated).
pub const ENV_DATA_DIRS: &str = "TOKENWATCH_DATA_DIRS";

/// Environment variable overriding the durable state directory.
pub const ENV_STATE_PATH: &str = "TOKENWATCH_STATE_PATH";

/// Environment variable overriding the log filter.
pub const ENV_LOG: &str = "TOKENWATCH_LOG";

// ── Directory bootstrap ───────────────────────────────────────────────────────

/// Ensure the durable state directory exists and return it.
///
/// `TOKENWATCH_STATE_PATH` overrides the default `~/.tokenwatch/`.
pub fn ensure_state_dir() -> anyhow::Result<PathBuf> {
    let state_dir = match std::env::var(ENV_STATE_PATH) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            home.join(".tokenwatch")
        }
    };
    std::fs::create_dir_all(&state_dir)?;
    Ok(state_dir)
}

/// Location of the durable read-offset file.
pub fn positions_path() -> anyhow::Result<PathBuf> {
    Ok(ensure_state_dir()?.join("positions.json"))
}

/// Location of the session-alias file.
pub fn sessions_path() -> anyhow::Result<PathBuf> {
    Ok(ensure_state_dir()?.join("sessions.json"))
}

// ── Logging bootstrap ─────────────────────────────────────────────────────────

/// Initialise the global `tracing` subscriber.
///
/// Precedence: `TOKENWATCH_LOG` when set, otherwise `log_level`. An
/// unrecognised directive falls back to `"warn"`.
pub fn setup_logging(log_level: &str) -> anyhow::Result<()> {
    let directive = std::env::var(ENV_LOG).unwrap_or_else(|_| log_level.to_string());
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("warn"));

    let subscriber = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(subscriber)
        .init();

    Ok(())
}

// ── Data-path discovery ───────────────────────────────────────────────────────

/// Resolve the session roots to monitor.
///
/// `TOKENWATCH_DATA_DIRS` entries (colon or comma separated) come first,
/// followed by the well-known assistant locations that exist:
/// 1. `~/.claude/projects/`
/// 2. `~/.config/claude/projects/`
///
/// Each root appears at most once, so discovery never walks the same
/// base twice.
pub fn discover_data_paths() -> Vec<PathBuf> {
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut paths: Vec<PathBuf> = Vec::new();

    if let Ok(env_paths) = std::env::var(ENV_DATA_DIRS) {
        for part in env_paths.split([':', ',']) {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            let path = PathBuf::from(trimmed);
            if seen.insert(path.clone()) {
                paths.push(path);
            }
        }
    }

    if let Some(home) = dirs::home_dir() {
        for candidate in [
            home.join(".claude").join("projects"),
            home.join(".config").join("claude").join("projects"),
        ] {
            if candidate.is_dir() && seen.insert(candidate.clone()) {
                paths.push(candidate);
            }
        }
    }

    paths
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serializes tests that mutate process-global environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_home<T>(home: &std::path::Path, f: impl FnOnce() -> T) -> T {
        let original = std::env::var_os("HOME");
        std::env::set_var("HOME", home);
        let result = f();
        match original {
            Some(v) => std::env::set_var("HOME", v),
            None => std::env::remove_var("HOME"),
        }
        result
    }

    #[test]
    fn test_ensure_state_dir() {
        let _guard = ENV_LOCK.lock().unwrap();
        let tmp = TempDir::new().unwrap();
        let dir = with_home(tmp.path(), ensure_state_dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir, tmp.path().join(".tokenwatch"));
    }

    #[test]
    fn test_positions_path_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        let tmp = TempDir::new().unwrap();
        std::env::remove_var(ENV_STATE_PATH);
        let path = with_home(tmp.path(), positions_path).unwrap();
        assert_eq!(path, tmp.path().join(".tokenwatch").join("positions.json"));
    }

    #[test]
    fn test_state_dir_env_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        let tmp = TempDir::new().unwrap();
        let custom = tmp.path().join("custom-state");
        std::env::set_var(ENV_STATE_PATH, &custom);
        let positions = positions_path().unwrap();
        let sessions = sessions_path().unwrap();
        std::env::remove_var(ENV_STATE_PATH);

        assert_eq!(positions, custom.join("positions.json"));
        assert_eq!(sessions, custom.join("sessions.json"));
        assert!(custom.is_dir());
    }

    #[test]
    fn test_discover_data_paths_env_list() {
        let _guard = ENV_LOCK.lock().unwrap();
        let tmp = TempDir::new().unwrap();
        std::env::set_var(ENV_DATA_DIRS, "/one:/two,/three");
        let paths = with_home(tmp.path(), discover_data_paths);
        std::env::remove_var(ENV_DATA_DIRS);

        assert!(paths.contains(&PathBuf::from("/one")));
        assert!(paths.contains(&PathBuf::from("/two")));
        assert!(paths.contains(&PathBuf::from("/three")));
    }

    #[test]
    fn test_discover_data_paths_dedups_non_adjacent_roots() {
        let _guard = ENV_LOCK.lock().unwrap();
        let tmp = TempDir::new().unwrap();
        let projects = tmp.path().join(".claude").join("projects");
        std::fs::create_dir_all(&projects).unwrap();

        // /a repeats non-adjacently, and the env list also names the
        // well-known default that exists under this home.
        let env_value = format!("/a:/b,/a,{}", projects.display());
        std::env::set_var(ENV_DATA_DIRS, &env_value);
        let paths = with_home(tmp.path(), discover_data_paths);
        std::env::remove_var(ENV_DATA_DIRS);

        assert_eq!(
            paths,
            vec![PathBuf::from("/a"), PathBuf::from("/b"), projects]
        );
    }

    #[test]
    fn test_discover_data_paths_finds_claude_projects() {
        let _guard = ENV_LOCK.lock().unwrap();
        let tmp = TempDir::new().unwrap();
        let projects = tmp.path().join(".claude").join("projects");
        std::fs::create_dir_all(&projects).unwrap();

        std::env::remove_var(ENV_DATA_DIRS);
        let paths = with_home(tmp.path(), discover_data_paths);
        assert!(paths.contains(&projects));
    }

    #[test]
    fn test_discover_data_paths_empty_when_nothing_exists() {
        let _guard = ENV_LOCK.lock().unwrap();
        let tmp = TempDir::new().unwrap();
        std::env::remove_var(ENV_DATA_DIRS);
        let paths = with_home(tmp.path(), discover_data_paths);
        assert!(paths.is_empty());
    }
}
