use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::MutexGuard;
use std::time::Duration;

use super::broadcast::StatsUpdate;
use super::http::{
    read_request, write_error, write_json_response, write_response, write_response_with_headers,
    write_stream_head, HttpRequest, READ_TIMEOUT,
};
use super::multipart::{boundary, parse_form, secure_filename};
use super::AppState;
use crate::ingest::open_video;
use crate::is_valid_file_id;
use crate::report::{render_report, report_filename};
use crate::session::{LoopSettings, VideoLoop};
use crate::stats::StatsDocument;
use crate::storage::{StoredVideo, VideoStore};

const INDEX_HTML: &str = include_str!("../../assets/index.html");
const ANALYZE_HTML: &str = include_str!("../../assets/analyze.html");
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Index,
    Health,
    Upload,
    Analyze(String),
    VideoFeed(String),
    Stats(String),
    StatsFeed(String),
    Results(String),
    Report(String),
    MethodNotAllowed,
    NotFound,
}

fn route(method: &str, segments: &[&str]) -> Route {
    let route = match segments {
        [] => Route::Index,
        ["health"] => Route::Health,
        ["upload"] => Route::Upload,
        ["analyze", id] => Route::Analyze(id.to_string()),
        ["video_feed", id] => Route::VideoFeed(id.to_string()),
        ["stats", id] => Route::Stats(id.to_string()),
        ["stats_feed", id] => Route::StatsFeed(id.to_string()),
        ["results", id] => Route::Results(id.to_string()),
        ["download_report", id] => Route::Report(id.to_string()),
        _ => return Route::NotFound,
    };
    let expected = if route == Route::Upload { "POST" } else { "GET" };
    if method == expected {
        route
    } else {
        Route::MethodNotAllowed
    }
}

pub(crate) fn handle_connection(mut stream: TcpStream, state: &AppState) -> Result<()> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut request = read_request(&mut stream)?;
    let route = route(&request.method, &request.segments());
    log::debug!("{} {} -> {:?}", request.method, request.path, route);

    match route {
        Route::Index => write_response(&mut stream, 200, "text/html; charset=utf-8", INDEX_HTML.as_bytes()),
        Route::Health => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        Route::Upload => upload(&mut stream, &mut request, state),
        Route::Analyze(id) => analyze_page(&mut stream, state, &id),
        Route::VideoFeed(id) => video_feed(&mut stream, state, &id),
        Route::Stats(id) => stats(&mut stream, state, &id),
        Route::StatsFeed(id) => stats_feed(&mut stream, state, &id),
        Route::Results(id) => results(&mut stream, state, &id),
        Route::Report(id) => download_report(&mut stream, state, &id),
        Route::MethodNotAllowed => write_error(&mut stream, 405, "method_not_allowed"),
        Route::NotFound => write_error(&mut stream, 404, "not_found"),
    }
}

fn lock_store(state: &AppState) -> Result<MutexGuard<'_, dyn VideoStore + 'static>> {
    state
        .store
        .lock()
        .map_err(|_| anyhow!("store lock poisoned"))
}

fn find_video(state: &AppState, file_id: &str) -> Result<Option<StoredVideo>> {
    if !is_valid_file_id(file_id) {
        return Ok(None);
    }
    lock_store(state)?.video_meta(file_id)
}

fn find_stats(state: &AppState, file_id: &str) -> Result<Option<StatsDocument>> {
    if !is_valid_file_id(file_id) {
        return Ok(None);
    }
    lock_store(state)?.get_stats(file_id)
}

// -------------------- Upload --------------------

fn upload(stream: &mut TcpStream, request: &mut HttpRequest, state: &AppState) -> Result<()> {
    let Some(len) = request.content_length() else {
        return write_error(stream, 411, "length_required");
    };
    if len > state.cfg.max_upload_bytes {
        log::warn!(
            "upload of {} bytes rejected (limit {})",
            len,
            state.cfg.max_upload_bytes
        );
        return write_error(stream, 413, "payload_too_large");
    }
    let body = request.read_body(stream, len as usize)?;

    let Some(boundary) = request.header("content-type").and_then(boundary) else {
        return write_error(stream, 400, "no_file_part");
    };
    let parts = match parse_form(&body, &boundary) {
        Ok(parts) => parts,
        Err(err) => {
            log::warn!("malformed upload form: {:#}", err);
            return write_error(stream, 400, "malformed_form");
        }
    };
    let Some(file) = parts
        .into_iter()
        .find(|part| part.name == "file" && part.filename.is_some())
    else {
        return write_error(stream, 400, "no_file_part");
    };
    let original = file.filename.unwrap_or_default();
    if original.is_empty() {
        return write_error(stream, 400, "no_selected_file");
    }

    let filename = secure_filename(&original);
    let meta = lock_store(state)?.put_video(&filename, &file.data)?;
    log::info!(
        "stored upload {} as {} ({} bytes)",
        meta.filename,
        meta.file_id,
        meta.bytes
    );
    let payload = serde_json::to_vec(&meta)?;
    write_response(stream, 201, "application/json", &payload)
}

// -------------------- Pages --------------------

fn analyze_page(stream: &mut TcpStream, state: &AppState, file_id: &str) -> Result<()> {
    let Some(meta) = find_video(state, file_id)? else {
        return write_error(stream, 404, "video_not_found");
    };
    // Both values are restricted to [A-Za-z0-9_.-].
    let page = ANALYZE_HTML
        .replace("{{file_id}}", &meta.file_id)
        .replace("{{filename}}", &meta.filename);
    write_response(stream, 200, "text/html; charset=utf-8", page.as_bytes())
}

// -------------------- Playback --------------------

/// Writes the stored blob to the upload directory under a per-session name.
fn materialize(state: &AppState, file_id: &str) -> Result<Option<PathBuf>> {
    if !is_valid_file_id(file_id) {
        return Ok(None);
    }
    let Some((meta, data)) = lock_store(state)?.get_video(file_id)? else {
        return Ok(None);
    };
    let nonce: [u8; 4] = rand::random();
    let path = state.cfg.upload_dir.join(format!(
        "{}-{}-{}",
        meta.file_id,
        hex::encode(nonce),
        meta.filename
    ));
    std::fs::write(&path, &data)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(Some(path))
}

fn discard(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        log::debug!("failed to remove {}: {}", path.display(), err);
    }
}

/// Flush target shared by every playback session: persist, then notify feeds.
fn stats_sink(state: &AppState) -> impl FnMut(&StatsDocument) -> Result<()> {
    let store = state.store.clone();
    let broadcaster = state.broadcaster.clone();
    move |doc: &StatsDocument| -> Result<()> {
        store
            .lock()
            .map_err(|_| anyhow!("store lock poisoned"))?
            .upsert_stats(doc)?;
        broadcaster.publish(doc);
        Ok(())
    }
}

fn video_feed(stream: &mut TcpStream, state: &AppState, file_id: &str) -> Result<()> {
    let Some(path) = materialize(state, file_id)? else {
        return write_error(stream, 404, "video_not_found");
    };
    let result = stream_annotated(stream, state, file_id, &path);
    discard(&path);
    result
}

fn stream_annotated(
    stream: &mut TcpStream,
    state: &AppState,
    file_id: &str,
    path: &Path,
) -> Result<()> {
    let source = match open_video(path) {
        Ok(source) => source,
        Err(err) => {
            log::warn!("video {}: cannot open: {:#}", file_id, err);
            return write_error(stream, 415, "unsupported_video");
        }
    };
    state.broadcaster.begin(file_id);
    let mut video = VideoLoop::open(
        file_id,
        source,
        state.detector.clone(),
        state.annotator.clone(),
        state.cfg.loop_settings.clone(),
        stats_sink(state),
    );
    write_stream_head(stream, "multipart/x-mixed-replace; boundary=frame")?;

    let mut sent = 0u64;
    while !state.shutdown.load(Ordering::SeqCst) {
        let frame = match video.step() {
            Ok(Some(frame)) => frame,
            // errors are logged by the loop, which is now closed
            Ok(None) | Err(_) => break,
        };
        let Some(jpeg) = frame.jpeg else {
            continue;
        };
        if let Err(err) = write_frame_part(stream, &jpeg) {
            log::info!(
                "video {}: client went away after {} frames ({})",
                file_id,
                sent,
                err
            );
            break;
        }
        sent += 1;
        std::thread::sleep(state.cfg.frame_delay);
    }

    video.close();
    drop(video);
    state.broadcaster.finish(file_id);
    Ok(())
}

fn write_frame_part(stream: &mut TcpStream, jpeg: &[u8]) -> std::io::Result<()> {
    stream.write_all(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n")?;
    stream.write_all(jpeg)?;
    stream.write_all(b"\r\n")?;
    stream.flush()
}

/// Whole-video pass without pacing or encoding.
fn results(stream: &mut TcpStream, state: &AppState, file_id: &str) -> Result<()> {
    let Some(path) = materialize(state, file_id)? else {
        return write_error(stream, 404, "video_not_found");
    };
    let outcome = collect_results(state, file_id, &path);
    discard(&path);
    match outcome? {
        Some(payload) => write_response(stream, 200, "application/json", &payload),
        None => write_error(stream, 415, "unsupported_video"),
    }
}

fn collect_results(state: &AppState, file_id: &str, path: &Path) -> Result<Option<Vec<u8>>> {
    let source = match open_video(path) {
        Ok(source) => source,
        Err(err) => {
            log::warn!("video {}: cannot open: {:#}", file_id, err);
            return Ok(None);
        }
    };
    let settings = LoopSettings {
        jpeg_quality: None,
        ..state.cfg.loop_settings.clone()
    };
    state.broadcaster.begin(file_id);
    let mut video = VideoLoop::open(
        file_id,
        source,
        state.detector.clone(),
        state.annotator.clone(),
        settings,
        stats_sink(state),
    );

    let mut detections = Vec::new();
    let mut alerts = Vec::new();
    while let Ok(Some(frame)) = video.step() {
        detections.extend(
            frame
                .detections
                .iter()
                .map(|d| format!("{}: {:.2}", d.label, d.confidence)),
        );
        alerts.extend(frame.annotations.messages);
    }
    let doc = video.snapshot();
    drop(video);
    state.broadcaster.finish(file_id);

    let payload = serde_json::json!({
        "file_id": file_id,
        "frames_processed": doc.frames_processed,
        "detections": detections,
        "alerts": alerts,
    });
    Ok(Some(serde_json::to_vec(&payload)?))
}

// -------------------- Stats --------------------

fn stats(stream: &mut TcpStream, state: &AppState, file_id: &str) -> Result<()> {
    match find_stats(state, file_id)? {
        Some(doc) => {
            let payload = serde_json::to_vec(&doc.stats)?;
            write_response(stream, 200, "application/json", &payload)
        }
        None => write_error(stream, 404, "stats_not_found"),
    }
}

fn stats_feed(stream: &mut TcpStream, state: &AppState, file_id: &str) -> Result<()> {
    if find_video(state, file_id)?.is_none() {
        return write_error(stream, 404, "video_not_found");
    }
    let updates = state.broadcaster.subscribe(file_id);
    write_stream_head(stream, "text/event-stream")?;
    let stored = find_stats(state, file_id)?;
    let replay = stored.is_some() && !updates.session_live();
    if let Some(doc) = stored {
        stream.write_all(StatsUpdate::Stats(doc).to_sse().as_bytes())?;
        stream.flush()?;
    }

    while !state.shutdown.load(Ordering::SeqCst) {
        let chunk = match updates.recv_timeout(KEEPALIVE_INTERVAL) {
            Ok(update) => {
                let finished = update == StatsUpdate::Finished;
                stream.write_all(update.to_sse().as_bytes())?;
                stream.flush()?;
                if finished {
                    break;
                }
                continue;
            }
            // the stored snapshot is final unless a new session has started
            Err(RecvTimeoutError::Timeout) if replay && !state.broadcaster.is_live(file_id) => {
                stream.write_all(StatsUpdate::Finished.to_sse().as_bytes())?;
                stream.flush()?;
                break;
            }
            Err(RecvTimeoutError::Timeout) => ": keep-alive\n\n",
            Err(RecvTimeoutError::Disconnected) => break,
        };
        // a failed keep-alive means the client is gone
        if stream.write_all(chunk.as_bytes()).is_err() {
            break;
        }
    }
    Ok(())
}

fn download_report(stream: &mut TcpStream, state: &AppState, file_id: &str) -> Result<()> {
    let Some(doc) = find_stats(state, file_id)? else {
        return write_error(stream, 404, "stats_not_found");
    };
    let pdf = render_report(&doc, &state.cfg.report);
    let disposition = format!("attachment; filename=\"{}\"", report_filename(file_id));
    write_response_with_headers(
        stream,
        200,
        "application/pdf",
        &[("Content-Disposition", disposition)],
        &pdf,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0123456789abcdef01234567";

    #[test]
    fn routes_by_method_and_path() {
        assert_eq!(route("GET", &[]), Route::Index);
        assert_eq!(route("GET", &["health"]), Route::Health);
        assert_eq!(route("POST", &["upload"]), Route::Upload);
        assert_eq!(route("GET", &["upload"]), Route::MethodNotAllowed);
        assert_eq!(route("POST", &["stats", ID]), Route::MethodNotAllowed);
        assert_eq!(route("GET", &["stats", ID]), Route::Stats(ID.to_string()));
        assert_eq!(route("GET", &["video_feed", ID]), Route::VideoFeed(ID.to_string()));
        assert_eq!(
            route("GET", &["download_report", ID]),
            Route::Report(ID.to_string())
        );
        assert_eq!(route("GET", &["stats"]), Route::NotFound);
        assert_eq!(route("GET", &["stats", ID, "extra"]), Route::NotFound);
        assert_eq!(route("DELETE", &["nowhere"]), Route::NotFound);
    }
}
