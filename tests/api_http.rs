use anyhow::Result;
use base64::Engine;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use skytrack::api::{ApiConfig, ApiHandle, ApiServer, AppState};
use skytrack::{
    CameraConfig, CameraSource, Coordinate, Frame, FrameCache, ServoConfig, ServoController,
    SharedCoordinate, Tracker,
};

const USERNAME: &str = "admin";
const PASSWORD: &str = "hunter2";

struct TestApi {
    state: AppState,
    handle: Option<ApiHandle>,
}

impl TestApi {
    fn spawn() -> Result<Self> {
        let camera = Arc::new(CameraSource::new(CameraConfig {
            device: "stub://test".to_string(),
            width: 64,
            height: 48,
            target_fps: 30,
            warmup_ms: 0,
        })?);
        camera.start()?;
        let servo = Arc::new(ServoController::connect(&ServoConfig {
            daemon_addr: "stub://".to_string(),
        })?);
        let state = AppState {
            camera,
            cache: Arc::new(FrameCache::new()),
            coordinate: Arc::new(SharedCoordinate::new()),
            servo,
        };

        let handle = ApiServer::new(
            ApiConfig {
                addr: "127.0.0.1:0".to_string(),
                username: USERNAME.to_string(),
                password: PASSWORD.to_string(),
                ..ApiConfig::default()
            },
            state.clone(),
        )
        .spawn()?;

        Ok(Self {
            state,
            handle: Some(handle),
        })
    }

    fn addr(&self) -> SocketAddr {
        self.handle.as_ref().expect("api handle").addr
    }

    /// Send one raw request and collect the full response (the server closes
    /// the connection after non-streaming responses).
    fn request(&self, raw: &str) -> Result<(String, String)> {
        let mut stream = TcpStream::connect(self.addr())?;
        stream.write_all(raw.as_bytes())?;
        let mut response = String::new();
        stream.read_to_string(&mut response)?;
        let mut parts = response.splitn(2, "\r\n\r\n");
        let headers = parts.next().unwrap_or("").to_string();
        let body = parts.next().unwrap_or("").to_string();
        Ok((headers, body))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn auth_header() -> String {
    let encoded = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", USERNAME, PASSWORD));
    format!("Authorization: Basic {}", encoded)
}

fn post_servo(api: &TestApi, path: &str, body: &str, auth: bool) -> Result<(String, String)> {
    let auth_line = if auth {
        format!("{}\r\n", auth_header())
    } else {
        String::new()
    };
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\n{auth_line}Content-Type: application/json\r\nContent-Length: {len}\r\n\r\n{body}",
        path = path,
        auth_line = auth_line,
        len = body.len(),
        body = body
    );
    api.request(&request)
}

#[test]
fn coordinate_endpoint_is_public_and_defaults_to_origin() -> Result<()> {
    let api = TestApi::spawn()?;

    let (headers, body) =
        api.request("GET /api/coordinate HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("200 OK"));

    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["x"], 0);
    assert_eq!(value["y"], 0);
    Ok(())
}

#[test]
fn coordinate_reflects_published_frame_after_one_tracker_cycle() -> Result<()> {
    let api = TestApi::spawn()?;

    // 4x4 single-channel frame: 255 at (2,1), 0 elsewhere.
    let mut data = vec![0u8; 16];
    data[4 + 2] = 255;
    api.state.cache.publish(Frame::new(data, 4, 4, 1));
    assert!(Tracker::tick(&api.state.cache, &api.state.coordinate));
    assert_eq!(api.state.coordinate.current(), Coordinate { x: 2, y: 1 });

    let (headers, body) =
        api.request("GET /api/coordinate HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["x"], 2);
    assert_eq!(value["y"], 1);
    Ok(())
}

#[test]
fn admin_endpoints_challenge_unauthenticated_requests() -> Result<()> {
    let api = TestApi::spawn()?;

    for request in [
        "GET /admin/stream HTTP/1.1\r\nHost: localhost\r\n\r\n".to_string(),
        "GET /admin/stream.mjpeg HTTP/1.1\r\nHost: localhost\r\n\r\n".to_string(),
    ] {
        let (headers, body) = api.request(&request)?;
        assert!(headers.contains("401 Unauthorized"));
        assert!(headers.contains("WWW-Authenticate: Basic realm=\"Admin Area\""));
        assert!(!body.contains("multipart"));
    }

    let (headers, _body) = post_servo(
        &api,
        "/admin/servo/control",
        r#"{"servo":"servo1","pulse_width":1500}"#,
        false,
    )?;
    assert!(headers.contains("401 Unauthorized"));

    // The rejected command never reached the servo backend.
    let commands = api.state.servo.commands_for_test_only();
    assert_eq!(commands, vec![(17, 0), (27, 0)]);
    Ok(())
}

#[test]
fn wrong_credentials_are_challenged() -> Result<()> {
    let api = TestApi::spawn()?;

    let encoded = base64::engine::general_purpose::STANDARD.encode("admin:wrong");
    let request = format!(
        "GET /admin/stream HTTP/1.1\r\nHost: localhost\r\nAuthorization: Basic {}\r\n\r\n",
        encoded
    );
    let (headers, _body) = api.request(&request)?;
    assert!(headers.contains("401 Unauthorized"));
    assert!(headers.contains("WWW-Authenticate"));
    Ok(())
}

#[test]
fn servo_control_round_trips_identifier_and_pulse() -> Result<()> {
    let api = TestApi::spawn()?;

    let (headers, body) = post_servo(
        &api,
        "/admin/servo/control",
        r#"{"servo":"servo1","pulse_width":1500}"#,
        true,
    )?;
    assert!(headers.contains("200 OK"));

    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["success"], true);
    assert_eq!(value["servo"], "servo1");
    assert_eq!(value["gpio"], 17);
    assert_eq!(value["pulse_width"], 1500);

    assert_eq!(
        api.state.servo.commands_for_test_only().last(),
        Some(&(17, 1500))
    );
    Ok(())
}

#[test]
fn servo_control_rejects_bad_input() -> Result<()> {
    let api = TestApi::spawn()?;

    let cases = [
        r#"{"servo":"servo3","pulse_width":1500}"#,
        r#"{"servo":"servo1","pulse_width":499}"#,
        r#"{"servo":"servo1","pulse_width":2501}"#,
        r#"{"servo":"servo1"}"#,
        r#"not json"#,
    ];
    for body in cases {
        let (headers, reply) = post_servo(&api, "/admin/servo/control", body, true)?;
        assert!(headers.contains("400 Bad Request"), "body: {}", body);
        let value: Value = serde_json::from_str(&reply)?;
        assert!(value["error"].is_string());
    }

    // Boundary values are accepted.
    for pulse in [500, 2500] {
        let body = format!(r#"{{"servo":"servo2","pulse_width":{}}}"#, pulse);
        let (headers, _reply) = post_servo(&api, "/admin/servo/control", &body, true)?;
        assert!(headers.contains("200 OK"));
    }
    Ok(())
}

#[test]
fn servo_stop_parks_at_rest_pulse() -> Result<()> {
    let api = TestApi::spawn()?;

    let (headers, body) = post_servo(&api, "/admin/servo/stop", r#"{"servo":"servo2"}"#, true)?;
    assert!(headers.contains("200 OK"));

    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["success"], true);
    assert_eq!(value["servo"], "servo2");
    assert_eq!(value["gpio"], 27);
    assert_eq!(value["stopped"], true);

    assert_eq!(
        api.state.servo.commands_for_test_only().last(),
        Some(&(27, 1500))
    );
    Ok(())
}

#[test]
fn unknown_paths_are_not_found() -> Result<()> {
    let api = TestApi::spawn()?;
    let (headers, _body) = api.request("GET /nope HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}

#[test]
fn authenticated_stream_delivers_mjpeg_parts() -> Result<()> {
    let api = TestApi::spawn()?;

    let mut stream = TcpStream::connect(api.addr())?;
    let request = format!(
        "GET /admin/stream HTTP/1.1\r\nHost: localhost\r\n{}\r\n\r\n",
        auth_header()
    );
    stream.write_all(request.as_bytes())?;
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;

    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(_) => continue,
        }
        let text = String::from_utf8_lossy(&collected);
        if text.contains("--frame\r\n") && collected.windows(2).any(|w| w == [0xFF, 0xD8]) {
            break;
        }
    }

    let text = String::from_utf8_lossy(&collected);
    assert!(text.contains("200 OK"));
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(text.contains("Content-Type: image/jpeg"));
    assert!(
        collected.windows(2).any(|w| w == [0xFF, 0xD8]),
        "no JPEG SOI marker in stream"
    );

    // Streaming also feeds the frame cache for the tracker.
    assert!(api.state.cache.snapshot().is_some());
    Ok(())
}
