//! video_analyticsd - video analytics HTTP service
//!
//! This daemon:
//! 1. Loads configuration (file + environment)
//! 2. Opens the SQLite store for uploads and stats
//! 3. Loads the detector (fails fast when model weights are missing)
//! 4. Serves upload, playback, stats and report endpoints until Ctrl-C

use anyhow::Result;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use video_analytics::{
    api::{ApiConfig, ApiServer, SharedStore},
    config::AppConfig,
    BackendRegistry, SqliteVideoStore,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = AppConfig::load()?;

    let labels = cfg.model.labels()?;
    log::info!("{} class labels loaded", labels.len());
    let registry = BackendRegistry::from_model_settings(&cfg.model, &labels)?;
    registry.warm_up_all()?;
    let detector = registry.require_default()?;
    log::info!(
        "detector backend '{}' ready ({})",
        cfg.model.backend,
        cfg.model.path.display()
    );

    let annotator = Arc::new(cfg.analysis.annotator()?);
    let store: SharedStore = Arc::new(Mutex::new(SqliteVideoStore::open(&cfg.storage.db_path)?));

    let api_handle = ApiServer::new(
        ApiConfig::from_app_config(&cfg),
        store,
        detector,
        annotator,
    )
    .spawn()?;
    log::info!(
        "video_analyticsd running on http://{} (db {}, uploads {})",
        api_handle.addr,
        cfg.storage.db_path,
        cfg.storage.upload_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
