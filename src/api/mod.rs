//! HTTP surface.
//!
//! A non-blocking accept loop polled against a shutdown flag, with one thread
//! per connection. Every response is `Connection: close`.

use anyhow::{anyhow, Result};
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::annotate::Annotator;
use crate::config::AppConfig;
use crate::detect::SharedBackend;
use crate::report::ReportOptions;
use crate::session::LoopSettings;
use crate::storage::VideoStore;

mod broadcast;
mod http;
mod multipart;
mod routes;

pub use broadcast::{StatsBroadcaster, StatsUpdate, Subscription};
pub use multipart::secure_filename;

pub type SharedStore = Arc<Mutex<dyn VideoStore>>;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Where uploaded blobs are written before decoding.
    pub upload_dir: PathBuf,
    pub max_upload_bytes: u64,
    /// Pause between frames of `/video_feed`.
    pub frame_delay: Duration,
    pub loop_settings: LoopSettings,
    pub report: ReportOptions,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            upload_dir: PathBuf::from("uploads"),
            max_upload_bytes: 512 * 1024 * 1024,
            frame_delay: Duration::from_millis(100),
            loop_settings: LoopSettings::default(),
            report: ReportOptions::default(),
        }
    }
}

impl ApiConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            addr: cfg.server.addr.clone(),
            upload_dir: cfg.storage.upload_dir.clone(),
            max_upload_bytes: cfg.server.max_upload_bytes,
            frame_delay: cfg.server.frame_delay,
            loop_settings: cfg.analysis.loop_settings(),
            report: cfg.report.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Everything a connection thread needs.
#[derive(Clone)]
pub(crate) struct AppState {
    pub cfg: Arc<ApiConfig>,
    pub store: SharedStore,
    pub detector: SharedBackend,
    pub annotator: Arc<Annotator>,
    pub broadcaster: StatsBroadcaster,
    pub shutdown: Arc<AtomicBool>,
}

pub struct ApiServer {
    cfg: ApiConfig,
    store: SharedStore,
    detector: SharedBackend,
    annotator: Arc<Annotator>,
    broadcaster: StatsBroadcaster,
}

impl ApiServer {
    pub fn new(
        cfg: ApiConfig,
        store: SharedStore,
        detector: SharedBackend,
        annotator: Arc<Annotator>,
    ) -> Self {
        Self {
            cfg,
            store,
            detector,
            annotator,
            broadcaster: StatsBroadcaster::new(),
        }
    }

    /// Stats flushes are published here as well as persisted.
    pub fn broadcaster(&self) -> StatsBroadcaster {
        self.broadcaster.clone()
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        std::fs::create_dir_all(&self.cfg.upload_dir)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let state = AppState {
            cfg: Arc::new(self.cfg),
            store: self.store,
            detector: self.detector,
            annotator: self.annotator,
            broadcaster: self.broadcaster,
            shutdown: shutdown.clone(),
        };
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, state) {
                log::error!("http api stopped: {}", err);
            }
        });
        log::info!("http api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, state: AppState) -> Result<()> {
    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                let conn_state = state.clone();
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = routes::handle_connection(stream, &conn_state) {
                            log::warn!("request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("failed to spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
