mod bootstrap;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokenwatch_core::config::{AggregatorConfig, Dimension, MonitorConfig, ReaderConfig, WatcherConfig};
use tokenwatch_core::models::Update;
use tokenwatch_core::session_id::is_valid_session_id;
use tokenwatch_data::discovery;
use tokenwatch_data::position::{JsonPositionStore, MemoryPositionStore, PositionStore};
use tokenwatch_data::reader::UsageReader;
use tokenwatch_data::session_store::{JsonSessionStore, SessionMeta, SessionStore};
use tokenwatch_runtime::aggregator::UsageAggregator;
use tokenwatch_runtime::live_monitor::LiveMonitor;
use tokenwatch_runtime::watcher::FileWatcher;
use tokio_util::sync::CancellationToken;

/// Live token-usage monitor over assistant session logs.
#[derive(Debug, Parser)]
#[command(name = "tokenwatch", version, about)]
struct Cli {
    /// Session root directory (repeatable); defaults to the well-known
    /// assistant locations.
    #[arg(long = "path", value_name = "DIR")]
    paths: Vec<PathBuf>,

    /// Monitor only this session, by UUID or saved name (repeatable).
    #[arg(long = "session", value_name = "UUID|NAME")]
    sessions: Vec<String>,

    /// Bind a name to a session (`UUID=NAME`) and exit.
    #[arg(long, value_name = "UUID=NAME")]
    rename: Option<String>,

    /// Seconds between periodic sweeps.
    #[arg(long, default_value_t = 1)]
    refresh: u64,

    /// Group statistics by these dimensions (comma separated:
    /// model,session,date,hour).
    #[arg(long, value_name = "DIMS")]
    group_by: Option<String>,

    /// Emit updates as JSON lines instead of text.
    #[arg(long)]
    json: bool,

    /// Read everything once, print totals and exit.
    #[arg(long)]
    once: bool,

    /// Clear the terminal before each update (forwarded to renderers).
    #[arg(long)]
    clear: bool,

    /// Log filter when TOKENWATCH_LOG is unset.
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    bootstrap::setup_logging(&cli.log_level)?;

    if let Some(spec) = &cli.rename {
        return run_rename(spec);
    }

    let bases = if cli.paths.is_empty() {
        bootstrap::discover_data_paths()
    } else {
        cli.paths.clone()
    };
    if bases.is_empty() {
        anyhow::bail!(
            "no session roots found; pass --path or set {}",
            bootstrap::ENV_DATA_DIRS
        );
    }

    let aggregator = Arc::new(UsageAggregator::new(AggregatorConfig {
        group_by: parse_group_by(cli.group_by.as_deref())?,
        percentiles: true,
    }));

    if cli.once {
        run_once(&cli, bases, aggregator).await
    } else {
        run_live(&cli, bases, aggregator).await
    }
}

/// `--rename UUID=NAME`: bind a session alias and exit.
fn run_rename(spec: &str) -> anyhow::Result<()> {
    let (session_id, name) = spec
        .split_once('=')
        .context("expected --rename UUID=NAME")?;
    if !is_valid_session_id(session_id) {
        anyhow::bail!("{session_id} is not a session UUID");
    }
    if name.is_empty() {
        anyhow::bail!("session name must not be empty");
    }

    let store = JsonSessionStore::open(bootstrap::sessions_path()?)?;
    if store.get(session_id)?.is_none() {
        store.put(SessionMeta {
            session_id: session_id.to_string(),
            name: None,
            created_at: Utc::now(),
            last_seen: None,
        })?;
    }
    store.rename(session_id, name)?;
    println!("{session_id} -> {name}");
    Ok(())
}

/// Expand `--session` arguments: UUIDs pass through, anything else is
/// resolved through the session-name index.
fn resolve_sessions(
    requested: &[String],
    store: &dyn SessionStore,
) -> anyhow::Result<Vec<String>> {
    let mut resolved = Vec::with_capacity(requested.len());
    for entry in requested {
        if is_valid_session_id(entry) {
            resolved.push(entry.clone());
        } else if let Some(session_id) = store.lookup_name(entry)? {
            resolved.push(session_id);
        } else {
            anyhow::bail!("unknown session name: {entry}");
        }
    }
    Ok(resolved)
}

/// Record every discovered session in the alias store so names can be
/// bound to it later.
fn register_sessions(
    store: &dyn SessionStore,
    files: &[tokenwatch_core::models::SessionFile],
) -> anyhow::Result<()> {
    for file in files {
        let mut meta = match store.get(&file.session_id)? {
            Some(existing) => existing,
            None => SessionMeta {
                session_id: file.session_id.clone(),
                name: None,
                created_at: Utc::now(),
                last_seen: None,
            },
        };
        meta.last_seen = Some(file.mod_time);
        store.put(meta)?;
    }
    Ok(())
}

/// One-shot mode: full read of every discovered file, print, exit.
async fn run_once(
    cli: &Cli,
    bases: Vec<PathBuf>,
    aggregator: Arc<UsageAggregator>,
) -> anyhow::Result<()> {
    let reader = UsageReader::new(
        Arc::new(MemoryPositionStore::new()),
        ReaderConfig::default(),
    );
    let cancel = CancellationToken::new();

    let session_store = JsonSessionStore::open(bootstrap::sessions_path()?)?;
    let session_ids = resolve_sessions(&cli.sessions, &session_store)?;

    let files = discovery::discover(&bases);
    if files.is_empty() {
        anyhow::bail!("no session files found under the configured roots");
    }

    for file in &files {
        if !session_ids.is_empty() && !session_ids.contains(&file.session_id) {
            continue;
        }
        match reader.read(&cancel, &file.file_path).await {
            Ok(records) => {
                for record in &records {
                    aggregator.add(record);
                }
            }
            Err(e) => tracing::warn!("Skipping {}: {}", file.file_path.display(), e),
        }
    }

    let stats = aggregator.stats();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "records {}  total {}  input {}  output {}  min {}  max {}  avg {:.1}",
            stats.count,
            stats.total_tokens,
            stats.input_tokens,
            stats.output_tokens,
            stats.min_tokens,
            stats.max_tokens,
            stats.avg_tokens,
        );
        if let (Some(p50), Some(p95), Some(p99)) = (stats.p50, stats.p95, stats.p99) {
            println!("p50 {p50:.0}  p95 {p95:.0}  p99 {p99:.0}");
        }
        for (key, group) in &stats.groups {
            println!(
                "  {key}: records {} total {} avg {:.1}",
                group.count, group.total_tokens, group.avg_tokens
            );
        }
    }
    Ok(())
}

/// Live mode: run the monitor until Ctrl+C, printing each update.
async fn run_live(
    cli: &Cli,
    bases: Vec<PathBuf>,
    aggregator: Arc<UsageAggregator>,
) -> anyhow::Result<()> {
    let positions_path = bootstrap::positions_path()?;
    let store: Arc<dyn PositionStore> = Arc::new(
        JsonPositionStore::open(&positions_path)
            .with_context(|| format!("opening {}", positions_path.display()))?,
    );
    let reader = Arc::new(UsageReader::new(store, ReaderConfig::default()));

    let session_store = JsonSessionStore::open(bootstrap::sessions_path()?)?;
    register_sessions(&session_store, &discovery::discover(&bases))?;
    let session_ids = resolve_sessions(&cli.sessions, &session_store)?;

    let mut monitor = LiveMonitor::new(
        MonitorConfig {
            session_ids,
            refresh_interval: Duration::from_secs(cli.refresh.max(1)),
            clear_screen: cli.clear,
            ..MonitorConfig::default()
        },
        bases,
        reader,
        aggregator,
        FileWatcher::new(WatcherConfig::default()),
    );

    monitor.start().await.context("starting live monitor")?;
    let mut updates = monitor
        .updates()
        .context("update stream unavailable")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received; shutting down");
                break;
            }
            update = updates.recv() => {
                let Some(update) = update else { break };
                print_update(&update, cli.json)?;
            }
        }
    }

    let _ = monitor.stop();
    monitor.close();
    Ok(())
}

fn print_update(update: &Update, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(update)?);
        return Ok(());
    }

    if update.clear_screen {
        print!("\x1b[2J\x1b[H");
    }
    println!(
        "{}  records {}  total {}  now +{}  {:.0} tok/min  block {} ({} tokens)",
        update.timestamp.format("%H:%M:%S"),
        update.stats.count,
        update.stats.total_tokens,
        update.delta.total_tokens,
        update.burn_rate.tokens_per_minute,
        update.current_block.start_time.format("%H:%M"),
        update.current_block.total_tokens,
    );
    Ok(())
}

fn parse_group_by(spec: Option<&str>) -> anyhow::Result<Vec<Dimension>> {
    let Some(spec) = spec else {
        return Ok(Vec::new());
    };
    spec.split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| {
            Dimension::parse(part)
                .ok_or_else(|| anyhow::anyhow!("unknown group-by dimension: {part}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_group_by_none() {
        assert!(parse_group_by(None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_group_by_list() {
        let dims = parse_group_by(Some("model, session")).unwrap();
        assert_eq!(dims, vec![Dimension::Model, Dimension::Session]);
    }

    #[test]
    fn test_parse_group_by_unknown() {
        assert!(parse_group_by(Some("model,project")).is_err());
    }

    #[test]
    fn test_resolve_sessions_uuid_passthrough() {
        use tokenwatch_data::session_store::MemorySessionStore;
        let store = MemorySessionStore::new();
        let uuid = "2c84a9ff-12de-4f08-9be1-30c6f3f19a8a".to_string();
        let resolved = resolve_sessions(std::slice::from_ref(&uuid), &store).unwrap();
        assert_eq!(resolved, vec![uuid]);
    }

    #[test]
    fn test_resolve_sessions_by_name() {
        use tokenwatch_data::session_store::MemorySessionStore;
        let uuid = "2c84a9ff-12de-4f08-9be1-30c6f3f19a8a";
        let store = MemorySessionStore::new();
        store
            .put(SessionMeta {
                session_id: uuid.to_string(),
                name: Some("refactor".to_string()),
                created_at: Utc::now(),
                last_seen: None,
            })
            .unwrap();

        let resolved = resolve_sessions(&["refactor".to_string()], &store).unwrap();
        assert_eq!(resolved, vec![uuid.to_string()]);
    }

    #[test]
    fn test_resolve_sessions_unknown_name() {
        use tokenwatch_data::session_store::MemorySessionStore;
        let store = MemorySessionStore::new();
        assert!(resolve_sessions(&["nope".to_string()], &store).is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["tokenwatch"]);
        assert!(cli.paths.is_empty());
        assert!(cli.sessions.is_empty());
        assert_eq!(cli.refresh, 1);
        assert!(!cli.json);
        assert!(!cli.once);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from([
            "tokenwatch",
            "--path",
            "/data",
            "--session",
            "2c84a9ff-12de-4f08-9be1-30c6f3f19a8a",
            "--refresh",
            "5",
            "--group-by",
            "session,model",
            "--json",
        ]);
        assert_eq!(cli.paths, vec![PathBuf::from("/data")]);
        assert_eq!(cli.sessions.len(), 1);
        assert_eq!(cli.refresh, 5);
        assert!(cli.json);
    }
}
