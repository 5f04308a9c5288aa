use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use pasteflow::{
    CaptureMonitor, ClipItem, ClipKind, Config, EngineEvent, HistoryFilter, HistoryStore,
    HistoryView, MonitorSettings, SystemClipboard, clear_expired, now_epoch,
};

const MIGRATION_BATCH: usize = 256;
const DISPLAY_WIDTH: usize = 80;

#[derive(Parser)]
#[command(name = "pasteflow")]
#[command(version = "0.1.0")]
#[command(about = "clipboard capture & history engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture daemon
    Daemon,
    /// Print recent history
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Search history by text
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Export a history snapshot
    Export { path: PathBuf },
    /// Import a history snapshot (additive, dedups on content identity)
    Import { path: PathBuf },
    /// Evict expired uncategorized items
    Sweep,
    /// Drop all history
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = Config::load().context("Failed to load configuration")?;
    let store = Arc::new(HistoryStore::open(
        &config.db_path(),
        config.compress_threshold,
    )?);

    match cli.command {
        Commands::Daemon => run_daemon(config, store).await?,
        Commands::History { limit } => {
            let items = store.search(&HistoryFilter::default(), limit, 0)?;
            print_items(&items);
        }
        Commands::Search { query, limit } => {
            let filter = HistoryFilter {
                query: Some(query),
                ..Default::default()
            };
            let items = store.search(&filter, limit, 0)?;
            print_items(&items);
        }
        Commands::Export { path } => {
            let report = store.export_to(&path)?;
            println!(
                "Exported {} items to {}",
                report.exported,
                report.path.display()
            );
        }
        Commands::Import { path } => {
            let report = store.import_from(&path)?;
            println!(
                "Imported {} items, skipped {} duplicates",
                report.imported, report.skipped
            );
        }
        Commands::Sweep => {
            let removed = clear_expired(&store, config.retention, now_epoch())?;
            println!("Evicted {removed} expired items");
        }
        Commands::Clear => {
            store.drop_all()?;
            println!("Clipboard history cleared");
        }
    }

    Ok(())
}

async fn run_daemon(config: Config, store: Arc<HistoryStore>) -> Result<()> {
    let cancel = CancellationToken::new();

    // resumable tag backfill runs as a tracked background job
    let migration = if store.tag_backfill_done()? {
        None
    } else {
        let store = store.clone();
        let token = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = store.backfill_tags(MIGRATION_BATCH, &token).await {
                error!("tag backfill failed: {e}");
            }
        }))
    };

    let clipboard = SystemClipboard::new()?;
    let settings = MonitorSettings::from_config(&config);
    let (mut monitor, _handle) = CaptureMonitor::new(store.clone(), clipboard, settings);
    let view = HistoryView::new(store.clone(), config.page_size, config.preview_length);

    let mut events = monitor.subscribe();
    let forward_view = view.clone();
    let forward = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Captured { item, replaced }) => {
                    forward_view.apply_captured(item, replaced);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    view.reset().await?;

    tokio::select! {
        result = monitor.run(cancel.clone()) => {
            if let Err(e) = result {
                error!("daemon error: {e:#}");
                std::process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    cancel.cancel();
    if let Some(job) = migration {
        let _ = job.await;
    }
    forward.abort();

    // opportunistic retention sweep on the way out
    let removed = clear_expired(&store, config.retention, now_epoch())?;
    if removed > 0 {
        info!("retention sweep evicted {removed} items");
    }

    Ok(())
}

fn print_items(items: &[ClipItem]) {
    for item in items {
        let time_str = format_time_ago(item.timestamp);
        match item.kind {
            ClipKind::Image => {
                println!(
                    "{} [IMG {}] {}",
                    time_str,
                    format_size(item.data.len() as i64),
                    item.app_name
                );
            }
            _ => {
                let text = String::from_utf8_lossy(&item.data);
                let available = DISPLAY_WIDTH.saturating_sub(time_str.len() + 1);
                println!("{} {}", time_str, truncate_to_fit(&text, available));
            }
        }
    }
}

fn format_time_ago(timestamp: i64) -> String {
    let now = now_epoch();
    let ago_secs = now.saturating_sub(timestamp).max(0) as u64;

    if ago_secs < 60 {
        format!("{}s", ago_secs)
    } else if ago_secs < 3600 {
        format!("{}m", ago_secs / 60)
    } else if ago_secs < 86400 {
        format!("{}h", ago_secs / 3600)
    } else {
        format!("{}d", ago_secs / 86400)
    }
}

fn format_size(bytes: i64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{}K", bytes / 1024)
    } else {
        format!("{}M", bytes / (1024 * 1024))
    }
}

fn truncate_to_fit(text: &str, max_chars: usize) -> String {
    let text = text.replace('\n', " ").replace('\t', " ");

    if text.len() <= max_chars {
        text
    } else {
        let mut end = max_chars.saturating_sub(1);
        while !text.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}
