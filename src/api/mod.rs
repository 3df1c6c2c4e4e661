//! HTTP boundary.
//!
//! A small HTTP/1.1 server on `std::net::TcpListener`, one worker thread per
//! connection. Public surface: the endpoint index and the published
//! coordinate. Admin surface (HTTP Basic auth): the MJPEG stream and servo
//! control. Missing or wrong credentials always get a 401 challenge, never
//! the protected content.

use anyhow::{anyhow, Result};
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::capture::CameraSource;
use crate::frame::FrameCache;
use crate::servo::{ServoController, ServoId, MAX_PULSE_US, MIN_PULSE_US};
use crate::stream::{encode_jpeg, mjpeg_part, DEFAULT_JPEG_QUALITY, MJPEG_BOUNDARY};
use crate::tracker::SharedCoordinate;

const MAX_REQUEST_BYTES: usize = 8192;

/// Streaming cadence. ~30 fps; policy constant.
pub const DEFAULT_STREAM_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Admin credentials, compared byte-for-byte against the Basic auth
    /// header. Empty credentials never authenticate.
    pub username: String,
    pub password: String,
    pub stream_interval: Duration,
    pub jpeg_quality: u8,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
            username: String::new(),
            password: String::new(),
            stream_interval: DEFAULT_STREAM_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Everything a request handler can touch. All members are shared handles;
/// cloning the state clones the handles, not the data.
#[derive(Clone)]
pub struct AppState {
    pub camera: Arc<CameraSource>,
    pub cache: Arc<FrameCache>,
    pub coordinate: Arc<SharedCoordinate>,
    pub servo: Arc<ServoController>,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections and join the accept loop. Streaming
    /// threads already serving clients run until their connection closes.
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
    state: AppState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: AppState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let listener = TcpListener::bind(&self.cfg.addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let state = self.state;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, state, shutdown_thread) {
                log::error!("http server stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    state: AppState,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let cfg = cfg.clone();
                let state = state.clone();
                let shutdown = shutdown.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &cfg, &state, &shutdown) {
                        log::warn!("http request failed: {}", err);
                    }
                });
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

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    state: &AppState,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;

    match request.path.as_str() {
        "/" => {
            if request.method != "GET" {
                return write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#);
            }
            let index = serde_json::json!({
                "message": "skytrack API",
                "endpoints": {
                    "public": {
                        "/api/coordinate": "GET - brightest pixel coordinate"
                    },
                    "admin": {
                        "/admin/stream": "GET - MJPEG video stream (requires auth)",
                        "/admin/stream.mjpeg": "GET - MJPEG video stream (requires auth)",
                        "/admin/servo/control": "POST - set servo pulse width (requires auth)",
                        "/admin/servo/stop": "POST - park servo at rest (requires auth)"
                    }
                }
            });
            write_response(&mut stream, 200, "application/json", &serde_json::to_vec(&index)?)
        }
        "/api/coordinate" => {
            if request.method != "GET" {
                return write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#);
            }
            let coordinate = state.coordinate.current();
            write_response(
                &mut stream,
                200,
                "application/json",
                &serde_json::to_vec(&coordinate)?,
            )
        }
        "/admin/stream" | "/admin/stream.mjpeg" => {
            if !authorized(cfg, &request) {
                return write_auth_challenge(&mut stream);
            }
            if request.method != "GET" {
                return write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#);
            }
            stream_video(&mut stream, cfg, state, shutdown)
        }
        "/admin/servo/control" => {
            if !authorized(cfg, &request) {
                return write_auth_challenge(&mut stream);
            }
            if request.method != "POST" {
                return write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#);
            }
            servo_control(&mut stream, state, &request)
        }
        "/admin/servo/stop" => {
            if !authorized(cfg, &request) {
                return write_auth_challenge(&mut stream);
            }
            if request.method != "POST" {
                return write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#);
            }
            servo_stop(&mut stream, state, &request)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

// -------------------- Admin handlers --------------------

#[derive(Debug, Default, Deserialize)]
struct ServoRequestBody {
    servo: Option<String>,
    pulse_width: Option<i64>,
}

fn parse_servo_body(request: &HttpRequest) -> std::result::Result<ServoRequestBody, String> {
    serde_json::from_slice(&request.body).map_err(|_| "invalid request body".to_string())
}

fn parse_servo_id(body: &ServoRequestBody) -> std::result::Result<ServoId, String> {
    body.servo
        .as_deref()
        .and_then(ServoId::parse)
        .ok_or_else(|| "invalid servo id".to_string())
}

fn servo_control(stream: &mut TcpStream, state: &AppState, request: &HttpRequest) -> Result<()> {
    let (id, pulse_us) = match parse_servo_body(request).and_then(|body| {
        let id = parse_servo_id(&body)?;
        let pulse = match body.pulse_width {
            Some(pulse) if (MIN_PULSE_US as i64..=MAX_PULSE_US as i64).contains(&pulse) => {
                pulse as u32
            }
            _ => {
                return Err(format!(
                    "invalid pulse width ({}-{} us)",
                    MIN_PULSE_US, MAX_PULSE_US
                ))
            }
        };
        Ok((id, pulse))
    }) {
        Ok(parsed) => parsed,
        Err(message) => return write_client_error(stream, &message),
    };

    if let Err(err) = state.servo.set_servo(id, pulse_us) {
        log::error!("servo command failed: {}", err);
        return write_json_response(stream, 500, r#"{"error":"servo command failed"}"#);
    }

    let reply = serde_json::json!({
        "success": true,
        "servo": id.as_str(),
        "gpio": id.gpio(),
        "pulse_width": pulse_us,
    });
    write_response(stream, 200, "application/json", &serde_json::to_vec(&reply)?)
}

fn servo_stop(stream: &mut TcpStream, state: &AppState, request: &HttpRequest) -> Result<()> {
    let id = match parse_servo_body(request).and_then(|body| parse_servo_id(&body)) {
        Ok(id) => id,
        Err(message) => return write_client_error(stream, &message),
    };

    if let Err(err) = state.servo.stop_servo(id) {
        log::error!("servo stop failed: {}", err);
        return write_json_response(stream, 500, r#"{"error":"servo command failed"}"#);
    }

    let reply = serde_json::json!({
        "success": true,
        "servo": id.as_str(),
        "gpio": id.gpio(),
        "stopped": true,
    });
    write_response(stream, 200, "application/json", &serde_json::to_vec(&reply)?)
}

// -------------------- MJPEG streaming --------------------

/// Per-client streaming loop: capture, publish to the cache, encode, emit one
/// multipart chunk. Transient capture/encode failures skip the cycle; a write
/// failure means the client disconnected and ends the loop.
fn stream_video(
    stream: &mut TcpStream,
    cfg: &ApiConfig,
    state: &AppState,
    shutdown: &AtomicBool,
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        MJPEG_BOUNDARY
    );
    stream.write_all(header.as_bytes())?;
    log::info!("stream client connected: {}", stream.peer_addr()?);

    while !shutdown.load(Ordering::SeqCst) {
        match state.camera.capture() {
            Ok(frame) => {
                state.cache.publish(frame.clone());
                if let Some(jpeg) = encode_jpeg(&frame, cfg.jpeg_quality) {
                    if stream.write_all(&mjpeg_part(&jpeg)).is_err() {
                        break;
                    }
                } else {
                    log::debug!("stream: encode produced no frame this cycle");
                }
            }
            Err(err) => {
                log::debug!("stream: {}", err);
            }
        }
        std::thread::sleep(cfg.stream_interval);
    }
    log::info!("stream client disconnected");
    Ok(())
}

// -------------------- Auth --------------------

fn authorized(cfg: &ApiConfig, request: &HttpRequest) -> bool {
    if cfg.username.is_empty() || cfg.password.is_empty() {
        return false;
    }
    match request.basic_credentials() {
        Some((username, password)) => {
            username.as_bytes() == cfg.username.as_bytes()
                && password.as_bytes() == cfg.password.as_bytes()
        }
        None => false,
    }
}

// -------------------- Request / response plumbing --------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    /// Credentials from an `Authorization: Basic <base64>` header, if the
    /// header is present and well-formed.
    fn basic_credentials(&self) -> Option<(String, String)> {
        let value = self.headers.get("authorization")?;
        let mut parts = value.split_whitespace();
        if !parts.next()?.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(parts.next()?)
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some((username.to_string(), password.to_string()))
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();

    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-request"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
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

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        body,
    })
}

fn write_client_error(stream: &mut TcpStream, message: &str) -> Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({ "error": message }))?;
    write_response(stream, 400, "application/json", &body)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_auth_challenge(stream: &mut TcpStream) -> Result<()> {
    let body = b"Authentication required";
    let header = format!(
        "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"Admin Area\"\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
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
        401 => "HTTP/1.1 401 Unauthorized",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}
