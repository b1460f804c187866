use anyhow::Result;
use image::RgbImage;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use video_analytics::api::{ApiConfig, ApiHandle, ApiServer, SharedStore};
use video_analytics::detect::SharedBackend;
use video_analytics::{
    AlertPolicy, Annotator, BoundingBox, Detection, Frame, InMemoryVideoStore, LoopSettings,
    ScriptedBackend,
};

const FRAMES: usize = 5;
const PART_HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

struct Server {
    handle: ApiHandle,
    _uploads: TempDir,
}

fn spawn_server(max_upload_bytes: u64) -> Result<Server> {
    let uploads = tempdir()?;
    let bbox = BoundingBox::new(2.0, 2.0, 20.0, 16.0);
    let backend = ScriptedBackend::new(vec![vec![
        Detection::new(7, "conector suelto", 0.91, bbox),
        Detection::new(6, "conector", 0.30, bbox),
    ]]);
    let detector: SharedBackend = Arc::new(Mutex::new(backend));
    let store: SharedStore = Arc::new(Mutex::new(InMemoryVideoStore::new()));
    let cfg = ApiConfig {
        addr: "127.0.0.1:0".to_string(),
        upload_dir: uploads.path().to_path_buf(),
        max_upload_bytes,
        frame_delay: Duration::from_millis(0),
        loop_settings: LoopSettings {
            flush_interval_frames: 2,
            ..LoopSettings::default()
        },
        ..ApiConfig::default()
    };
    let annotator = Arc::new(Annotator::new(AlertPolicy::default()));
    let handle = ApiServer::new(cfg, store, detector, annotator).spawn()?;
    Ok(Server {
        handle,
        _uploads: uploads,
    })
}

fn mjpeg_clip(frames: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for i in 0..frames {
        let image = RgbImage::from_pixel(32, 24, image::Rgb([40 * i as u8, 90, 160]));
        out.extend(Frame::new(image, i as u64).encode_jpeg(90)?);
    }
    Ok(out)
}

fn connect(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    Ok(stream)
}

struct Response {
    status: u16,
    head: String,
    body: Vec<u8>,
}

impl Response {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

fn send(addr: SocketAddr, raw: &[u8]) -> Result<Response> {
    let mut stream = connect(addr)?;
    stream.write_all(raw)?;
    let mut data = Vec::new();
    stream.read_to_end(&mut data)?;
    let split = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head");
    let head = String::from_utf8_lossy(&data[..split]).into_owned();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    Ok(Response {
        status,
        head,
        body: data[split + 4..].to_vec(),
    })
}

fn get(addr: SocketAddr, path: &str) -> Result<Response> {
    send(
        addr,
        format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n").as_bytes(),
    )
}

fn upload_request(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let boundary = "----video-analytics-test";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: video/x-motion-jpeg\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let mut raw = format!(
        "POST /upload HTTP/1.1\r\nHost: test\r\nContent-Type: multipart/form-data; boundary={boundary}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    raw.extend_from_slice(&body);
    raw
}

fn upload(addr: SocketAddr) -> Result<String> {
    let response = send(addr, &upload_request("file", "line 3 clip.mjpeg", &mjpeg_clip(FRAMES)?))?;
    assert_eq!(response.status, 201);
    let json = response.json();
    assert_eq!(json["filename"], "line_3_clip.mjpeg");
    assert_eq!(json["sha256"].as_str().map(str::len), Some(64));
    Ok(json["file_id"].as_str().expect("file_id").to_string())
}

#[test]
fn upload_stream_stats_and_report() -> Result<()> {
    let server = spawn_server(16 * 1024 * 1024)?;
    let addr = server.handle.addr;

    assert_eq!(get(addr, "/health")?.json()["status"], "ok");
    let index = get(addr, "/")?;
    assert_eq!(index.status, 200);
    assert!(index.head.contains("text/html"));

    let file_id = upload(addr)?;
    let page = get(addr, &format!("/analyze/{file_id}"))?;
    assert_eq!(page.status, 200);
    assert!(String::from_utf8_lossy(&page.body).contains(&format!("/video_feed/{file_id}")));

    let missing = get(addr, &format!("/stats/{file_id}"))?;
    assert_eq!(missing.status, 404);
    assert_eq!(missing.json()["error"], "stats_not_found");
    assert_eq!(get(addr, &format!("/download_report/{file_id}"))?.status, 404);

    // Subscribe to the stats feed before playback starts.
    let mut feed = connect(addr)?;
    feed.write_all(format!("GET /stats_feed/{file_id} HTTP/1.1\r\nHost: test\r\n\r\n").as_bytes())?;
    let mut feed_head = Vec::new();
    let mut byte = [0u8; 1];
    while !feed_head.ends_with(b"\r\n\r\n") {
        feed.read_exact(&mut byte)?;
        feed_head.push(byte[0]);
    }
    assert!(String::from_utf8_lossy(&feed_head).contains("text/event-stream"));
    let feed_reader = std::thread::spawn(move || {
        let mut events = String::new();
        feed.read_to_string(&mut events).map(|_| events)
    });

    let playback = get(addr, &format!("/video_feed/{file_id}"))?;
    assert_eq!(playback.status, 200);
    assert!(playback
        .head
        .contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));
    let parts = playback
        .body
        .windows(PART_HEAD.len())
        .filter(|w| *w == PART_HEAD)
        .count();
    assert_eq!(parts, FRAMES);

    let events = feed_reader.join().expect("feed thread")?;
    assert!(events.contains("event: update_stats"));
    assert!(events.contains("\"frames_processed\":5"));
    assert!(events.trim_end().ends_with("event: finished\ndata: {}"));

    // A feed opened after playback replays the stored stats, then closes.
    let late = get(addr, &format!("/stats_feed/{file_id}"))?;
    let late = String::from_utf8_lossy(&late.body).into_owned();
    assert!(late.starts_with("event: update_stats\n"));
    assert!(late.contains("\"frames_processed\":5"));
    assert!(late.trim_end().ends_with("event: finished\ndata: {}"));

    let stats = get(addr, &format!("/stats/{file_id}"))?;
    assert_eq!(stats.status, 200);
    let stats = stats.json();
    assert_eq!(stats["detections_by_class"]["conector suelto"], 1);
    assert!(stats["detections_by_class"].get("conector").is_none());
    assert_eq!(stats["errors"]["conector suelto"], 5);

    let report = get(addr, &format!("/download_report/{file_id}"))?;
    assert_eq!(report.status, 200);
    assert!(report.head.contains("Content-Type: application/pdf"));
    assert!(report
        .head
        .contains(&format!("filename=\"report_{file_id}.pdf\"")));
    assert!(report.body.starts_with(b"%PDF-1.4"));
    let again = get(addr, &format!("/download_report/{file_id}"))?;
    assert_eq!(again.body, report.body);

    let results = get(addr, &format!("/results/{file_id}"))?;
    assert_eq!(results.status, 200);
    let results = results.json();
    assert_eq!(results["frames_processed"], 5);
    assert_eq!(results["detections"].as_array().map(Vec::len), Some(10));
    assert_eq!(results["detections"][0], "conector suelto: 0.91");
    assert_eq!(results["alerts"].as_array().map(Vec::len), Some(5));
    assert_eq!(
        results["alerts"][0],
        "ALERT: conector suelto detected with 0.91 confidence"
    );

    server.handle.stop()?;
    Ok(())
}

#[test]
fn rejects_bad_uploads() -> Result<()> {
    let server = spawn_server(1024 * 1024)?;
    let addr = server.handle.addr;

    let wrong_field = send(addr, &upload_request("video", "clip.mjpeg", b"data"))?;
    assert_eq!(wrong_field.status, 400);
    assert_eq!(wrong_field.json()["error"], "no_file_part");

    let no_name = send(addr, &upload_request("file", "", b""))?;
    assert_eq!(no_name.status, 400);
    assert_eq!(no_name.json()["error"], "no_selected_file");

    let not_multipart = send(
        addr,
        b"POST /upload HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}",
    )?;
    assert_eq!(not_multipart.status, 400);
    assert_eq!(not_multipart.json()["error"], "no_file_part");

    let too_large = send(
        addr,
        b"POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=x\r\nContent-Length: 10000000\r\n\r\n",
    )?;
    assert_eq!(too_large.status, 413);

    server.handle.stop()?;
    Ok(())
}

#[test]
fn unknown_ids_paths_and_methods() -> Result<()> {
    let server = spawn_server(1024 * 1024)?;
    let addr = server.handle.addr;
    let unknown = "ffffffffffffffffffffffff";

    for path in [
        format!("/stats/{unknown}"),
        "/stats/not-an-id".to_string(),
        format!("/download_report/{unknown}"),
    ] {
        let response = get(addr, &path)?;
        assert_eq!(response.status, 404, "{path}");
        assert_eq!(response.json()["error"], "stats_not_found");
    }
    for path in [
        format!("/video_feed/{unknown}"),
        format!("/results/{unknown}"),
        format!("/analyze/{unknown}"),
        format!("/stats_feed/{unknown}"),
    ] {
        let response = get(addr, &path)?;
        assert_eq!(response.status, 404, "{path}");
        assert_eq!(response.json()["error"], "video_not_found");
    }

    assert_eq!(get(addr, "/nowhere")?.status, 404);
    let wrong_method = send(addr, b"POST /health HTTP/1.1\r\nContent-Length: 0\r\n\r\n")?;
    assert_eq!(wrong_method.status, 405);

    server.handle.stop()?;
    Ok(())
}

#[test]
fn undecodable_upload_is_rejected_at_playback() -> Result<()> {
    let server = spawn_server(1024 * 1024)?;
    let addr = server.handle.addr;

    let response = send(addr, &upload_request("file", "notes.txt", b"plain text, not video"))?;
    assert_eq!(response.status, 201);
    let file_id = response.json()["file_id"].as_str().unwrap().to_string();

    let playback = get(addr, &format!("/video_feed/{file_id}"))?;
    assert_eq!(playback.status, 415);
    assert_eq!(get(addr, &format!("/stats/{file_id}"))?.status, 404);

    server.handle.stop()?;
    Ok(())
}
