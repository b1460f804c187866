//! analyze_video - headless analysis of a local video file.
//!
//! Runs the same loop as the service's playback endpoint without pacing,
//! then writes the final stats document as JSON and the PDF report.
//! Optionally writes the annotated frames as an MJPEG file and upserts the
//! stats into the service database.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use video_analytics::{
    config::AppConfig,
    frame::DEFAULT_JPEG_QUALITY,
    is_valid_file_id, new_file_id, open_video,
    report::{render_report, report_filename},
    ui, BackendRegistry, LoopSettings, SqliteVideoStore, StatsDocument, StatsStore, VideoLoop,
};

#[derive(Parser, Debug)]
#[command(
    name = "analyze_video",
    about = "Detect, annotate and report on a local video file"
)]
struct Args {
    /// Video file (MJPEG always; other containers with the ffmpeg feature)
    #[arg(value_name = "VIDEO")]
    video: PathBuf,

    /// Identifier recorded in the stats and report (24 hex chars)
    #[arg(long, value_name = "ID")]
    file_id: Option<String>,

    /// Stats JSON output [default: <id>_stats.json]
    #[arg(long, value_name = "PATH")]
    stats: Option<PathBuf>,

    /// PDF report output [default: report_<id>.pdf]
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Also write annotated frames as MJPEG
    #[arg(long, value_name = "PATH")]
    annotated: Option<PathBuf>,

    /// Upsert the stats into this SQLite database
    #[arg(long, value_name = "PATH")]
    db: Option<String>,

    /// Detector backend, overriding configuration
    #[arg(long, value_parser = ["tract", "scripted"])]
    backend: Option<String>,

    /// ONNX model path, overriding configuration
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,

    /// Alert confidence threshold, overriding configuration
    #[arg(long, value_name = "0..1")]
    threshold: Option<f32>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut cfg = AppConfig::load()?;
    if let Some(backend) = &args.backend {
        cfg.model.backend = backend.clone();
    }
    if let Some(model) = &args.model {
        cfg.model.path = model.clone();
    }
    if let Some(threshold) = args.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!("--threshold must be between 0 and 1"));
        }
        cfg.analysis.policy.confidence_threshold = threshold;
    }

    let file_id = args.file_id.clone().unwrap_or_else(new_file_id);
    if !is_valid_file_id(&file_id) {
        return Err(anyhow!("--file-id must be 24 lowercase hex characters"));
    }

    let detector = {
        let _stage = ui.stage("Load detector");
        let labels = cfg.model.labels()?;
        let registry = BackendRegistry::from_model_settings(&cfg.model, &labels)?;
        registry.warm_up_all()?;
        registry.require_default()?
    };
    let annotator = Arc::new(cfg.analysis.annotator()?);
    let source = {
        let _stage = ui.stage("Open video");
        open_video(&args.video)?
    };
    log::info!("decoding {} with {}", args.video.display(), source.decoder_name());

    let mut store = match &args.db {
        Some(path) => Some(SqliteVideoStore::open(path)?),
        None => None,
    };
    let mut annotated = match &args.annotated {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => None,
    };

    let settings = LoopSettings {
        jpeg_quality: annotated.as_ref().map(|_| DEFAULT_JPEG_QUALITY),
        ..cfg.analysis.loop_settings()
    };

    let doc = {
        let sink = |doc: &StatsDocument| -> Result<()> {
            if let Some(store) = store.as_mut() {
                store.upsert_stats(doc)?;
            }
            Ok(())
        };
        let mut progress = ui.frames("Analyze video", 100);
        let mut video = VideoLoop::open(
            file_id.as_str(),
            source,
            detector,
            annotator,
            settings,
            sink,
        );
        for frame in video.by_ref() {
            let frame = frame?;
            progress.tick(frame.annotations.alerts.len());
            for message in &frame.annotations.messages {
                log::warn!("{} (second {:.2})", message, frame.timestamp_s);
            }
            if let (Some(out), Some(jpeg)) = (annotated.as_mut(), frame.jpeg.as_ref()) {
                out.write_all(jpeg)?;
            }
        }
        let (_, failed) = video.flush_counts();
        if failed > 0 {
            log::warn!("{} stats flushes failed", failed);
        }
        video.snapshot()
    };
    if let Some(mut out) = annotated {
        out.flush()?;
    }

    let stats_path = args
        .stats
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{file_id}_stats.json")));
    let report_path = args
        .report
        .clone()
        .unwrap_or_else(|| PathBuf::from(report_filename(&file_id)));
    {
        let _stage = ui.stage("Write stats and report");
        std::fs::write(&stats_path, serde_json::to_string_pretty(&doc)?)
            .with_context(|| format!("failed to write {}", stats_path.display()))?;
        std::fs::write(&report_path, render_report(&doc, &cfg.report))
            .with_context(|| format!("failed to write {}", report_path.display()))?;
    }

    println!("analyze_video: {}", args.video.display());
    println!("  file id:    {}", file_id);
    println!("  frames:     {}", doc.frames_processed);
    println!("  detections: {}", doc.stats.total_detections());
    println!("  alerts:     {}", doc.error_times.len());
    for (label, count) in &doc.stats.errors {
        println!("    {label}: {count}");
    }
    println!("  stats:      {}", stats_path.display());
    println!("  report:     {}", report_path.display());
    Ok(())
}
