//! Preview server.
//!
//! Loopback HTTP endpoint on its own thread. It only ever holds a
//! `PreviewHandle`, so it can show the last frame and outcome but cannot
//! trigger or alter anything.
//!
//! Routes (GET only):
//! - `/health`
//! - `/status`      JSON `PreviewSnapshot`
//! - `/latest.jpg`  retained frame bytes, `ETag` = frame fingerprint;
//!   `If-None-Match` with the current tag answers 304.
//!   `?ack=1` clears the "new image" flag after serving.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::preview::PreviewHandle;

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct PreviewServerConfig {
    pub addr: String,
}

impl Default for PreviewServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8780".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct PreviewServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PreviewServerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("preview server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct PreviewServer {
    cfg: PreviewServerConfig,
    preview: PreviewHandle,
}

impl PreviewServer {
    pub fn new(cfg: PreviewServerConfig, preview: PreviewHandle) -> Self {
        Self { cfg, preview }
    }

    pub fn spawn(self) -> Result<PreviewServerHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "preview configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        if !addr.ip().is_loopback() {
            log::warn!("preview server reachable beyond loopback on {}", addr);
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let preview = self.preview;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_server(listener, preview, shutdown_thread) {
                log::error!("preview server stopped: {}", err);
            }
        });

        Ok(PreviewServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(
    listener: TcpListener,
    preview: PreviewHandle,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &preview) {
                    log::warn!("preview request rejected: {}", err);
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

fn handle_connection(mut stream: TcpStream, preview: &PreviewHandle) -> Result<()> {
    // The listener is non-blocking; accepted sockets must not be.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    match request.path.as_str() {
        "/health" => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        "/status" => {
            let payload = serde_json::to_vec(&preview.snapshot())?;
            write_response(&mut stream, 200, "application/json", &[], &payload)
        }
        "/latest.jpg" => serve_latest(&mut stream, &request, preview),
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn serve_latest(
    stream: &mut TcpStream,
    request: &HttpRequest,
    preview: &PreviewHandle,
) -> Result<()> {
    let Some(frame) = preview.latest_frame() else {
        return write_json_response(stream, 404, r#"{"error":"no_image"}"#);
    };
    let etag = format!("\"{}\"", frame.fingerprint());
    let headers = [("ETag", etag.as_str())];
    if request.headers.get("if-none-match") == Some(&etag) {
        return write_response(stream, 304, frame.format().mime_type(), &headers, &[]);
    }
    write_response(stream, 200, frame.format().mime_type(), &headers, frame.bytes())?;
    if request.query_flag("ack") {
        preview.clear_new_image();
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query: query.to_string(),
        headers,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", &[], body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        304 => "HTTP/1.1 304 Not Modified",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    for (name, value) in extra_headers {
        header.push_str(&format!("{}: {}\r\n", name, value));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: String,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    fn query_flag(&self, name: &str) -> bool {
        self.query.split('&').any(|pair| match pair.split_once('=') {
            Some((k, v)) => k == name && matches!(v, "1" | "true" | "yes"),
            None => pair == name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw_path: &str) -> HttpRequest {
        let (path, query) = raw_path.split_once('?').unwrap_or((raw_path, ""));
        HttpRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            query: query.to_string(),
            headers: HashMap::new(),
        }
    }

    #[test]
    fn query_flag_forms() {
        assert!(request("/latest.jpg?ack=1").query_flag("ack"));
        assert!(request("/latest.jpg?x=2&ack").query_flag("ack"));
        assert!(!request("/latest.jpg?ack=0").query_flag("ack"));
        assert!(!request("/latest.jpg").query_flag("ack"));
    }

    #[test]
    fn invalid_address_fails_to_spawn() {
        let server = PreviewServer::new(
            PreviewServerConfig {
                addr: "not-an-address".to_string(),
            },
            crate::preview::PreviewState::new(Default::default()).handle(),
        );
        assert!(server.spawn().is_err());
    }
}
