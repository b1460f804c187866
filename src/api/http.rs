use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

const MAX_HEAD_BYTES: usize = 16 * 1024;
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    /// Bytes received past the end of the head; the start of the body.
    pub leftover: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// Path segments with empty ones removed: `/stats/abc` -> `["stats", "abc"]`.
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Reads the rest of a body of exactly `len` bytes.
    pub fn read_body<S: Read>(&mut self, stream: &mut S, len: usize) -> Result<Vec<u8>> {
        let mut body = std::mem::take(&mut self.leftover);
        body.truncate(len);
        body.reserve(len - body.len());
        let mut buf = [0u8; 16 * 1024];
        while body.len() < len {
            let want = (len - body.len()).min(buf.len());
            let n = stream.read(&mut buf[..want]).context("failed to read request body")?;
            if n == 0 {
                return Err(anyhow!(
                    "request body truncated ({} of {} bytes)",
                    body.len(),
                    len
                ));
            }
            body.extend_from_slice(&buf[..n]);
        }
        Ok(body)
    }
}

pub(crate) fn read_request<S: Read>(stream: &mut S) -> Result<HttpRequest> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let head_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request head"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEAD_BYTES {
            return Err(anyhow!("request head too large"));
        }
    };

    let leftover = data[head_end + 4..].to_vec();
    let text = String::from_utf8_lossy(&data[..head_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        leftover,
    })
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        201 => "HTTP/1.1 201 Created",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        411 => "HTTP/1.1 411 Length Required",
        413 => "HTTP/1.1 413 Payload Too Large",
        415 => "HTTP/1.1 415 Unsupported Media Type",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

pub(crate) fn write_json_response<W: Write>(stream: &mut W, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

/// `{"error":"<slug>"}`
pub(crate) fn write_error<W: Write>(stream: &mut W, status: u16, slug: &str) -> Result<()> {
    let body = serde_json::json!({ "error": slug }).to_string();
    write_json_response(stream, status, &body)
}

pub(crate) fn write_response<W: Write>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    write_response_with_headers(stream, status, content_type, &[], body)
}

pub(crate) fn write_response_with_headers<W: Write>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    extra_headers: &[(&str, String)],
    body: &[u8],
) -> Result<()> {
    let mut header = format!(
        "{}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line(status),
        content_type,
        body.len()
    );
    for (name, value) in extra_headers {
        header.push_str(&format!("{name}: {value}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

/// Head of an open-ended response; the body runs until the connection closes.
pub(crate) fn write_stream_head<W: Write>(stream: &mut W, content_type: &str) -> Result<()> {
    let header = format!(
        "{}\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line(200),
        content_type
    );
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    Ok(())
}
