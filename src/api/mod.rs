//! Local control API.
//!
//! Plain HTTP/1.1 over `TcpListener`, one request per connection, served on a
//! background thread. Routes read and replace shared state; none of them block
//! on the detection loop or on an actuation sequence.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::parse_line_value;
use crate::pipeline::DetectionLoop;

const MAX_REQUEST_BYTES: usize = 16 * 1024;
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Cause recorded for triggers requested through `/spray_test`.
pub const MANUAL_TRIGGER_CAUSE: &str = "manual test";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
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
    cfg: ApiConfig,
    detection: Arc<DetectionLoop>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, detection: Arc<DetectionLoop>) -> Self {
        Self { cfg, detection }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("parse api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind control api on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let detection = self.detection;
        let join = std::thread::Builder::new()
            .name("control-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &detection, shutdown_thread) {
                    log::error!("control api stopped: {:#}", err);
                }
            })
            .context("spawn control api thread")?;

        log::info!("control api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, detection: &DetectionLoop, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, detection) {
                    log::warn!("control api request failed: {:#}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, detection: &DetectionLoop) -> Result<()> {
    // accepted sockets inherit non-blocking mode on some platforms
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let response = match read_request(&mut stream) {
        Ok(request) => {
            let response = route(detection, &request);
            log::debug!("{} {} -> {}", request.method, request.path, response.status);
            response
        }
        Err(err) => {
            log::debug!("malformed request: {:#}", err);
            Response::error(400, "bad_request")
        }
    };
    let body = serde_json::to_vec(&response.body)?;
    write_response(&mut stream, response.status, "application/json", &body)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, error: &str) -> Self {
        Self {
            status,
            body: json!({ "error": error }),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        log::warn!("control api internal error: {:#}", err);
        Self::error(500, "internal_error")
    }
}

/// Dispatch one request against the running system.
pub fn route(detection: &DetectionLoop, request: &HttpRequest) -> Response {
    let known = matches!(
        request.path.as_str(),
        "/health"
            | "/yolo_data"
            | "/status"
            | "/get_config"
            | "/start_detection"
            | "/stop_detection"
            | "/spray_test"
            | "/save_line"
            | "/set_esp_ip"
            | "/set_objects"
    );
    if !known {
        return Response::error(404, "not_found");
    }

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => Response::ok(json!({ "status": "ok" })),
        ("GET", "/yolo_data") => Response::ok(json!(detection.snapshot().detections)),
        ("GET", "/status") => status(detection),
        ("GET", "/get_config") => Response::ok(json!(*detection.config().snapshot())),
        ("GET", "/start_detection") => match detection.start() {
            Ok(true) => Response::ok(json!({ "status": "started" })),
            Ok(false) => Response::ok(json!({ "status": "already_running" })),
            Err(err) => Response::internal(err),
        },
        ("GET", "/stop_detection") => {
            let status = if detection.stop() {
                "stopped"
            } else {
                "not_running"
            };
            Response::ok(json!({ "status": status }))
        }
        ("GET", "/spray_test") => {
            let config = detection.config().snapshot();
            match detection
                .actuator()
                .trigger(MANUAL_TRIGGER_CAUSE, config.endpoint())
            {
                Ok(outcome) => Response::ok(json!({ "status": outcome })),
                Err(err) => Response::internal(err),
            }
        }
        ("POST", "/save_line") => with_json_body(request, |body| {
            let line = body.get("line").and_then(parse_line_value);
            let saved = detection.config().set_line(line)?;
            Ok(Response::ok(json!({ "status": "saved", "config": *saved })))
        }),
        ("POST", "/set_esp_ip") => with_json_body(request, |body| {
            let Some(ip) = body.get("ip") else {
                return Ok(Response::error(400, "missing_ip"));
            };
            let ip = match ip {
                Value::Null => None,
                Value::String(ip) => Some(ip.clone()),
                _ => return Ok(Response::error(400, "invalid_ip")),
            };
            let saved = detection.config().set_esp32_ip(ip)?;
            Ok(Response::ok(json!({
                "status": "saved",
                "esp32_ip": saved.esp32_ip(),
                "endpoint_valid": saved.endpoint().is_some(),
            })))
        }),
        ("POST", "/set_objects") => with_json_body(request, |body| {
            let Some(objects) = body.get("detect_objects").and_then(Value::as_array) else {
                return Ok(Response::error(400, "missing_detect_objects"));
            };
            let labels: Option<Vec<String>> = objects
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect();
            let Some(labels) = labels else {
                return Ok(Response::error(400, "invalid_detect_objects"));
            };
            let saved = detection.config().set_detect_objects(labels)?;
            Ok(Response::ok(json!({
                "status": "saved",
                "detect_objects": saved.detect_objects(),
            })))
        }),
        _ => Response::error(405, "method_not_allowed"),
    }
}

fn status(detection: &DetectionLoop) -> Response {
    let snapshot = detection.snapshot();
    let actuator = detection.actuator();
    Response::ok(json!({
        "running": detection.is_running(),
        "phase": actuator.phase(),
        "sequences_started": actuator.sequences_started(),
        "frame_seq": snapshot.frame_seq,
        "frame_width": snapshot.frame_width,
        "frame_height": snapshot.frame_height,
        "detections": snapshot.detections,
    }))
}

fn with_json_body<F>(request: &HttpRequest, handler: F) -> Response
where
    F: FnOnce(&Value) -> Result<Response>,
{
    let body: Value = match serde_json::from_slice(&request.body) {
        Ok(body @ Value::Object(_)) => body,
        _ => return Response::error(400, "invalid_json"),
    };
    handler(&body).unwrap_or_else(Response::internal)
}

fn read_request<R: Read>(stream: &mut R) -> Result<HttpRequest> {
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break None;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break Some(pos + 4);
        }
    };
    let header_end = header_end.ok_or_else(|| anyhow!("connection closed before headers ended"))?;

    let mut request = parse_head(&data[..header_end])?;
    let content_length = request
        .headers
        .get("content-length")
        .map(|v| v.parse::<usize>())
        .transpose()
        .context("invalid content-length")?
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES.saturating_sub(header_end) {
        return Err(anyhow!("request too large ({} byte body)", content_length));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);
    request.body = body;
    Ok(request)
}

fn parse_head(head: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(head);
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
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_uppercase(),
        path,
        headers,
        body: Vec::new(),
    })
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

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.to_string(),
            ..Self::default()
        }
    }

    pub fn post_json(path: &str, body: &Value) -> Self {
        Self {
            method: "POST".to_string(),
            path: path.to_string(),
            body: body.to_string().into_bytes(),
            ..Self::default()
        }
    }
}
