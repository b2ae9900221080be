//! weft-sync: mirror one or more jams into the local warehouse
//!
//! Minimal CLI driver around the warehouse service: load config, request a
//! snapshot for each jam id given on the command line, then let the worker
//! scrape until no skeleton rows remain.
//!
//! Usage: weft-sync [--config <path>] <jam-id> [<jam-id> ...]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use weft_core::model::JamId;
use weft_warehouse::{ApiConfig, Auth, StoragePaths, Warehouse, WarehouseEvent};

#[derive(Debug, Default, Deserialize)]
struct SyncConfig {
    /// Override the storage base; platform default otherwise
    #[serde(default)]
    base_dir: Option<PathBuf>,
    #[serde(default)]
    api: ApiConfig,
    #[serde(default)]
    auth: Auth,
}

fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<SyncConfig> {
    let path = explicit.or_else(|| {
        dirs::config_dir().map(|dir| dir.join("weft").join("sync.yaml"))
    });

    match path {
        Some(path) if path.exists() => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config [{}]", path.display()))?;
            serde_yaml::from_str(&text)
                .with_context(|| format!("parsing config [{}]", path.display()))
        }
        Some(path) => {
            log::warn!("no config at [{}], using defaults (no credentials)", path.display());
            Ok(SyncConfig::default())
        }
        None => Ok(SyncConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1).peekable();
    let mut config_path = None;
    let mut jam_ids = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(PathBuf::from(
                    args.next().context("--config needs a path argument")?,
                ));
            }
            "--help" | "-h" => {
                eprintln!("usage: weft-sync [--config <path>] <jam-id> [<jam-id> ...]");
                return Ok(());
            }
            other => jam_ids.push(JamId::from(other)),
        }
    }

    if jam_ids.is_empty() {
        eprintln!("usage: weft-sync [--config <path>] <jam-id> [<jam-id> ...]");
        anyhow::bail!("no jam ids given");
    }

    let config = load_config(config_path)?;
    let storage = match &config.base_dir {
        Some(base) => StoragePaths::beneath(base),
        None => StoragePaths::platform_default(),
    };
    storage.ensure_exists()?;

    let events: weft_warehouse::warehouse::EventCallback = Arc::new(|event| match event {
        WarehouseEvent::Info { title, message } => log::info!("{title}: {message}"),
        WarehouseEvent::Error { title, message } => log::error!("{title}: {message}"),
    });

    let warehouse = Warehouse::new(&storage, config.api, config.auth, events)?;

    warehouse.set_callback_work_report(Arc::new(|busy, message| {
        if busy {
            log::info!("{message}");
        }
    }));
    warehouse.set_callback_contents_report(Arc::new(|report| {
        for (index, jam) in report.jam_ids.iter().enumerate() {
            log::info!(
                "  [{jam}] riffs {}/{} stems {}/{}{}",
                report.populated_riffs[index],
                report.populated_riffs[index] + report.unpopulated_riffs[index],
                report.populated_stems[index],
                report.populated_stems[index] + report.unpopulated_stems[index],
                if report.awaiting_initial_sync[index] { " (awaiting initial sync)" } else { "" },
            );
        }
    }));

    if !warehouse.has_full_network_access() {
        anyhow::bail!("no upstream credentials configured; nothing to sync");
    }

    for jam in &jam_ids {
        log::info!("requesting snapshot of [{jam}]");
        warehouse.add_or_update_jam_snapshot(jam);
    }

    // give the snapshots a moment to land, then wait out the scrape
    std::thread::sleep(Duration::from_secs(3));
    loop {
        if warehouse.is_paused() {
            anyhow::bail!("sync halted by a task failure; see log");
        }
        if !warehouse.has_unpopulated_rows()? {
            break;
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    log::info!("sync complete");
    Ok(())
}
