//! Read-only HTTP query surface over the detection store.
//!
//! A small HTTP/1.1 server: one listener thread, one request per
//! connection, GET only, JSON responses. It never writes to the store.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::storage::{DetectionStore, StoreError};

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_LATEST_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;
const DEFAULT_TIMELINE_LIMIT: usize = 1000;

#[derive(Clone, Debug)]
pub struct ApiServerConfig {
    pub addr: String,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
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

pub struct ApiServer {
    cfg: ApiServerConfig,
    store: Arc<DetectionStore>,
}

impl ApiServer {
    pub fn new(cfg: ApiServerConfig, store: Arc<DetectionStore>) -> Self {
        Self { cfg, store }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid api address {:?}: {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let store = self.store;
        let join = std::thread::Builder::new()
            .name("query-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &store, shutdown_thread) {
                    log::error!("query api stopped: {}", err);
                }
            })?;
        log::info!("query api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, store: &DetectionStore, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, store) {
                    log::warn!("query api request failed: {}", err);
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

fn handle_connection(mut stream: TcpStream, store: &DetectionStore) -> Result<()> {
    // accepted sockets can inherit the listener's non-blocking mode
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        return write_response(&mut stream, &Response::error(403, "forbidden", None));
    }

    let response = match read_request(&mut stream) {
        Ok(request) => {
            log::debug!("query api: {} {}", request.method, request.path);
            route(store, &request)
        }
        Err(err) => Response::error(400, "bad_request", Some(err.to_string())),
    };
    write_response(&mut stream, &response)
}

fn route(store: &DetectionStore, request: &HttpRequest) -> Response {
    if request.method != "GET" {
        return Response::error(405, "method_not_allowed", None);
    }
    let result = match request.path.as_str() {
        "/health" => Ok(Response::json(
            200,
            &serde_json::json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
            }),
        )),
        "/api/stats" => stats(store),
        "/api/cameras" => cameras(store),
        "/api/timeline" => timeline(store, request),
        "/api/detections/latest" => latest(store, request),
        "/api/detections/timerange" => timerange(store, request),
        "/api/detections/nearest" => nearest(store, request),
        path => match path.strip_prefix("/api/detections/") {
            Some(id) => by_id(store, id),
            None => Ok(Response::error(404, "not_found", None)),
        },
    };
    match result {
        Ok(response) => response,
        Err(Rejection::Request(response)) => response,
        Err(Rejection::Store(err)) => store_error_response(err),
    }
}

/// Why a handler did not produce its normal response.
enum Rejection {
    Request(Response),
    Store(StoreError),
}

impl From<Response> for Rejection {
    fn from(response: Response) -> Self {
        Rejection::Request(response)
    }
}

impl From<StoreError> for Rejection {
    fn from(err: StoreError) -> Self {
        Rejection::Store(err)
    }
}

type Handled = std::result::Result<Response, Rejection>;

fn stats(store: &DetectionStore) -> Handled {
    Ok(Response::json(200, &store.get_detection_stats()?))
}

fn cameras(store: &DetectionStore) -> Handled {
    Ok(Response::json(200, &store.get_cameras()?))
}

fn timeline(store: &DetectionStore, request: &HttpRequest) -> Handled {
    let limit = request.limit(DEFAULT_TIMELINE_LIMIT)?;
    let rows = match request.param("camera_name") {
        Some(camera) => store.get_timeline_data_for_camera(camera, limit)?,
        None => store.get_timeline_data(limit)?,
    };
    Ok(Response::json(200, &rows))
}

fn latest(store: &DetectionStore, request: &HttpRequest) -> Handled {
    let camera = request.required("camera_name")?;
    let limit = request.limit(DEFAULT_LATEST_LIMIT)?;
    let rows = store.get_latest_detections(camera, limit)?;
    Ok(Response::json(200, &rows))
}

fn timerange(store: &DetectionStore, request: &HttpRequest) -> Handled {
    let camera = request.required("camera_name")?;
    let start = request.required("start_time")?;
    let end = request.required("end_time")?;
    let limit = request.limit(DEFAULT_LATEST_LIMIT)?;
    let rows = store.get_detections_by_timerange(camera, start, end, Some(limit))?;
    Ok(Response::json(200, &rows))
}

fn nearest(store: &DetectionStore, request: &HttpRequest) -> Handled {
    let camera = request.required("camera_name")?;
    let timestamp = request.required("timestamp")?;
    let found = match request.param("tolerance") {
        Some(raw) => {
            let tolerance = raw
                .parse::<f64>()
                .ok()
                .filter(|t| t.is_finite() && *t >= 0.0)
                .ok_or_else(|| {
                    Response::error(
                        400,
                        "invalid_parameter",
                        Some("tolerance must be a non-negative number of seconds".to_string()),
                    )
                })?;
            store.get_nearest_detection_with_tolerance(camera, timestamp, tolerance)?
        }
        None => store.get_nearest_detection(camera, timestamp)?,
    };
    Ok(match found {
        Some(detection) => Response::json(200, &detection),
        None => Response::error(404, "no_detection", None),
    })
}

fn by_id(store: &DetectionStore, raw: &str) -> Handled {
    let id = raw.parse::<i64>().map_err(|_| {
        Response::error(
            400,
            "invalid_parameter",
            Some("detection id must be an integer".to_string()),
        )
    })?;
    Ok(match store.get_detection_by_id(id)? {
        Some(detection) => Response::json(200, &detection),
        None => Response::error(404, "detection_not_found", None),
    })
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::InvalidTimestamp(raw) => Response::error(
            400,
            "invalid_timestamp",
            Some(format!(
                "invalid datetime {:?}, use ISO format (YYYY-MM-DDTHH:MM:SS)",
                raw
            )),
        ),
        other => {
            log::error!("query api: store error: {}", other);
            Response::error(500, "internal_error", None)
        }
    }
}

#[derive(Debug)]
struct Response {
    status: u16,
    body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self { status, body },
            Err(err) => {
                log::error!("query api: failed to encode response: {}", err);
                Self::error(500, "internal_error", None)
            }
        }
    }

    fn error(status: u16, code: &str, detail: Option<String>) -> Self {
        let body = match detail {
            Some(detail) => serde_json::json!({ "error": code, "detail": detail }),
            None => serde_json::json!({ "error": code }),
        };
        Self {
            status,
            body: body.to_string().into_bytes(),
        }
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
}

impl HttpRequest {
    fn param(&self, key: &str) -> Option<&str> {
        self.query
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &str) -> std::result::Result<&str, Response> {
        self.param(key).ok_or_else(|| {
            Response::error(
                400,
                "missing_parameter",
                Some(format!("query parameter {} is required", key)),
            )
        })
    }

    /// `limit` query parameter, 1..=1000.
    fn limit(&self, default: usize) -> std::result::Result<usize, Response> {
        match self.param("limit") {
            None => Ok(default),
            Some(raw) => match raw.parse::<usize>() {
                Ok(limit) if (1..=MAX_LIMIT).contains(&limit) => Ok(limit),
                _ => Err(Response::error(
                    400,
                    "invalid_parameter",
                    Some(format!("limit must be between 1 and {}", MAX_LIMIT)),
                )),
            },
        }
    }
}

/// Parse the request line and drain the headers. Bodies are never read.
fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut reader = BufReader::new((&*stream).take(MAX_REQUEST_BYTES as u64));

    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Err(anyhow!("connection closed before request line"));
    }
    loop {
        let mut header = String::new();
        let read = reader.read_line(&mut header)?;
        if read == 0 {
            return Err(anyhow!("request headers truncated or over {} bytes", MAX_REQUEST_BYTES));
        }
        if header.trim_end().is_empty() {
            break;
        }
    }

    let mut fields = request_line.split_ascii_whitespace();
    let (Some(method), Some(target)) = (fields.next(), fields.next()) else {
        return Err(anyhow!("malformed request line {:?}", request_line.trim_end()));
    };
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    Ok(HttpRequest {
        method: method.to_owned(),
        path: path.to_owned(),
        query: url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect(),
    })
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    }
}

fn write_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\r\n",
        response.status,
        reason_phrase(response.status),
        response.body.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}
