//! Loopback control surface: manual trigger and camera status.

use crate::cache::{self, CacheField, VolatileCache};
use crate::clock::{Clock, SystemClock};
use crate::storage::CameraStore;
use crate::{CameraId, EpochMillis, EventId};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_cameras: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8798".to_string(),
            max_cameras: crate::watchdog::DEFAULT_MAX_CAMERAS,
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

/// One row of `GET /cameras`.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CameraStatus {
    pub id: CameraId,
    pub name: String,
    pub enabled: bool,
    pub last_capture: Option<EpochMillis>,
    pub last_poll: Option<EpochMillis>,
    pub open_event: Option<EventId>,
    pub trigger_pending: bool,
}

#[derive(Serialize)]
struct TriggerResponse {
    camera: CameraId,
    triggered: bool,
}

pub struct ApiServer {
    cfg: ApiConfig,
    store: Arc<dyn CameraStore>,
    cache: Arc<dyn VolatileCache>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, store: Arc<dyn CameraStore>, cache: Arc<dyn VolatileCache>) -> Self {
        Self { cfg, store, cache }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        if !configured_addr.ip().is_loopback() {
            return Err(anyhow!(
                "api must bind a loopback address, got '{}'",
                configured_addr
            ));
        }
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("control-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &self, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;

        log::info!("control api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }

    fn camera_statuses(&self) -> Result<Vec<CameraStatus>> {
        let cache = self.cache.as_ref();
        let mut statuses = Vec::new();
        for source in self.store.list_sources(true, self.cfg.max_cameras)? {
            statuses.push(CameraStatus {
                id: source.id,
                name: source.name,
                enabled: source.enabled,
                last_capture: cache::load_time(cache, source.id, CacheField::LastCapture)?,
                last_poll: cache::load_time(cache, source.id, CacheField::LastPoll)?,
                open_event: cache::load_open_event(cache, source.id)?,
                trigger_pending: cache::pending_trigger(cache, source.id)?.is_some(),
            });
        }
        Ok(statuses)
    }
}

fn run_api(listener: TcpListener, server: &ApiServer, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, server) {
                    log::warn!("control api request rejected: {}", err);
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

fn handle_connection(mut stream: TcpStream, server: &ApiServer) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    if !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    match (request.path.as_str(), request.method.as_str()) {
        ("/health", "GET") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("/cameras", "GET") => match server.camera_statuses() {
            Ok(statuses) => {
                let payload = serde_json::to_vec(&statuses)?;
                write_response(&mut stream, 200, "application/json", &payload)
            }
            Err(err) => {
                write_json_response(&mut stream, 500, r#"{"error":"store_unavailable"}"#)?;
                Err(err)
            }
        },
        ("/camera/trigger", "POST") => handle_trigger(&mut stream, server, &request),
        ("/health", _) | ("/cameras", _) | ("/camera/trigger", _) => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn handle_trigger(stream: &mut TcpStream, server: &ApiServer, request: &HttpRequest) -> Result<()> {
    let camera_id = match request.query.get("camera").map(|v| v.parse::<CameraId>()) {
        Some(Ok(id)) => id,
        _ => return write_json_response(stream, 400, r#"{"error":"camera_param_required"}"#),
    };
    match server.store.get_source(camera_id)? {
        Some(source) if !source.deleted => {}
        _ => return write_json_response(stream, 404, r#"{"error":"unknown_camera"}"#),
    }

    cache::request_trigger(server.cache.as_ref(), camera_id, SystemClock.now_ms())?;
    log::info!("camera {} manual trigger requested", camera_id);
    let payload = serde_json::to_vec(&TriggerResponse {
        camera: camera_id,
        triggered: true,
    })?;
    write_response(stream, 200, "application/json", &payload)
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
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        query,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
}
