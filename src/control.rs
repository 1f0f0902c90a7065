//! HTTP control surface
//!
//! سطح کنترل HTTP برای اپراتورها — پروفایل‌ها، متریک‌ها و سلامت سرویس.
//! One request per connection, minimal HTTP/1.1, always `Connection: close`.
//! Runs beside the data plane and never touches per-session state directly.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::ConfigManager;
use crate::manager::SessionManager;
use crate::metrics::global_metrics;
use crate::types::{AnomalyProfile, DirectionalProfile};

/// Request size ceiling (headers + body)
const MAX_REQUEST_BYTES: usize = 16 * 1024;

/// Control API server
pub struct ControlServer {
    /// مخزن پیکربندی
    config: Arc<ConfigManager>,
    /// مدیر سشن‌ها
    manager: Arc<SessionManager>,
    stop: watch::Sender<bool>,
}

impl ControlServer {
    pub fn new(config: Arc<ConfigManager>, manager: Arc<SessionManager>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            manager,
            stop,
        }
    }

    /// Bind the control port and serve until stopped
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding control port {port}"))?;
        let local = listener.local_addr().context("reading control address")?;
        info!(control = %local, "control_started");

        let config = Arc::clone(&self.config);
        let manager = Arc::clone(&self.manager);
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.wait_for(|s| *s) => {
                        info!("control_stopped");
                        return;
                    }
                    res = listener.accept() => {
                        if let Ok((stream, _)) = res {
                            let config = Arc::clone(&config);
                            let manager = Arc::clone(&manager);
                            tokio::spawn(async move {
                                handle_connection(stream, config, manager).await;
                            });
                        }
                    }
                }
            }
        });

        Ok(local)
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

async fn handle_connection(mut stream: TcpStream, config: Arc<ConfigManager>, manager: Arc<SessionManager>) {
    match read_request(&mut stream).await {
        Ok((method, path, body)) => {
            let response = route(&method, &path, &body, &config, &manager);
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
        Err(e) => {
            debug!(error = %e, "control_request_error");
        }
    }
}

/// Parse one HTTP/1.1 request: method, path, body
async fn read_request(stream: &mut TcpStream) -> Result<(String, String, String)> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 2048];

    let header_end = loop {
        let n = stream.read(&mut chunk).await.context("reading request")?;
        if n == 0 {
            bail!("connection closed mid-request");
        }
        raw.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&raw) {
            break pos;
        }
        if raw.len() > MAX_REQUEST_BYTES {
            bail!("request headers too large");
        }
    };

    let head = std::str::from_utf8(&raw[..header_end]).context("non-utf8 request head")?;
    let mut lines = head.lines();
    let request_line = lines.next().context("empty request")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().context("missing method")?.to_string();
    let path = parts.next().context("missing path")?.to_string();

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().context("bad content-length")?;
            }
        }
    }
    if content_length > MAX_REQUEST_BYTES {
        bail!("request body too large");
    }

    let body_start = header_end + 4;
    while raw.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await.context("reading body")?;
        if n == 0 {
            bail!("connection closed mid-body");
        }
        raw.extend_from_slice(&chunk[..n]);
    }

    let body = String::from_utf8_lossy(&raw[body_start..body_start + content_length]).into_owned();
    Ok((method, path, body))
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Dispatch a parsed request to a handler
pub fn route(
    method: &str,
    path: &str,
    body: &str,
    config: &ConfigManager,
    manager: &SessionManager,
) -> String {
    if (method == "POST" || method == "DELETE") && !config.check_rate_limit() {
        return make_response(429, "text/plain", "Rate limit exceeded");
    }

    match (method, path) {
        ("GET", "/health") => make_response(200, "application/json", r#"{"status":"ok"}"#),
        ("GET", "/metrics") => make_response(
            200,
            "text/plain; version=0.0.4",
            &global_metrics().render_prometheus(),
        ),
        ("GET", "/sessions") => {
            let ids = manager.session_ids();
            let body = json!({ "sessions": ids, "count": ids.len() });
            make_response(200, "application/json", &body.to_string())
        }
        _ => {
            if let Some(name) = path.strip_prefix("/profiles/") {
                if !name.is_empty() && !name.contains('/') {
                    return match method {
                        "POST" => post_profile(name, body, config),
                        "DELETE" => delete_profile(name, config),
                        _ => make_response(404, "text/plain", "Not Found"),
                    };
                }
            }
            make_response(404, "text/plain", "Not Found")
        }
    }
}

fn post_profile(name: &str, body: &str, config: &ConfigManager) -> String {
    match parse_profile_body(body) {
        Ok(profile) => {
            let version = config.set_profile(name, profile);
            info!(name, version, "profile_updated");
            make_response(200, "application/json", &format!(r#"{{"version":{version}}}"#))
        }
        Err(e) => make_response(
            400,
            "application/json",
            &json!({ "error": e.to_string() }).to_string(),
        ),
    }
}

fn delete_profile(name: &str, config: &ConfigManager) -> String {
    if config.delete_profile(name) {
        info!(name, "profile_deleted");
        make_response(200, "application/json", r#"{"deleted":true}"#)
    } else {
        make_response(404, "application/json", r#"{"error":"not found"}"#)
    }
}

/// Build a profile from a JSON body
///
/// Direction-specific keys (`c2s_*`, `s2c_*`) win over short forms
/// (`latency_ms`, `drop_rate`, …) whenever they are present — a present
/// zero is a deliberate zero, never overridden.
pub fn parse_profile_body(body: &str) -> Result<AnomalyProfile> {
    let value: Value = if body.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(body).context("invalid JSON body")?
    };
    if !value.is_object() {
        bail!("profile body must be a JSON object");
    }

    Ok(AnomalyProfile {
        client_to_server: direction_profile(&value, "c2s_"),
        server_to_client: direction_profile(&value, "s2c_"),
        version: 0,
    })
}

/// Direction-prefixed key if present, else the short form
fn lookup<'a>(value: &'a Value, prefix: &str, key: &str) -> Option<&'a Value> {
    value
        .get(format!("{prefix}{key}"))
        .or_else(|| value.get(key))
}

fn direction_profile(value: &Value, prefix: &str) -> DirectionalProfile {
    let ms = |key: &str| lookup(value, prefix, key).and_then(Value::as_u64).unwrap_or(0) as u32;
    let rate = |key: &str| {
        lookup(value, prefix, key)
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32
    };

    DirectionalProfile {
        latency_ms: ms("latency_ms"),
        jitter_ms: ms("jitter_ms"),
        throttle_kbps: ms("throttle_kbps"),
        drop_rate: rate("drop_rate"),
        stall_probability: rate("stall_prob"),
        corrupt_rate: rate("corrupt_rate"),
        reorder_rate: rate("reorder_rate"),
        half_close_rate: rate("half_close_rate"),
    }
}

fn make_response(status: u16, content_type: &str, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Unknown",
    };
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::AnomalyEngine;
    use crate::scheduler::Scheduler;
    use crate::types::{ConfigLimits, ServerConfig};

    fn test_stack() -> (Arc<ConfigManager>, Arc<SessionManager>) {
        let config = Arc::new(ConfigManager::new(ServerConfig::default()));
        let manager = SessionManager::new(AnomalyEngine::new(1), Arc::clone(&config), Scheduler::new());
        (config, manager)
    }

    #[test]
    fn test_parse_direction_specific_keys() {
        let profile = parse_profile_body(
            r#"{"c2s_latency_ms": 100, "c2s_drop_rate": 0.5, "s2c_jitter_ms": 7}"#,
        )
        .unwrap();
        assert_eq!(profile.client_to_server.latency_ms, 100);
        assert_eq!(profile.client_to_server.drop_rate, 0.5);
        assert_eq!(profile.client_to_server.jitter_ms, 0);
        assert_eq!(profile.server_to_client.jitter_ms, 7);
        assert_eq!(profile.server_to_client.latency_ms, 0);
    }

    #[test]
    fn test_parse_short_forms_apply_both_ways() {
        let profile = parse_profile_body(r#"{"latency_ms": 250, "drop_rate": 0.25}"#).unwrap();
        assert_eq!(profile.client_to_server.latency_ms, 250);
        assert_eq!(profile.server_to_client.latency_ms, 250);
        assert_eq!(profile.client_to_server.drop_rate, 0.25);
        assert_eq!(profile.server_to_client.drop_rate, 0.25);
    }

    #[test]
    fn test_present_zero_wins_over_short_form() {
        let profile =
            parse_profile_body(r#"{"latency_ms": 100, "c2s_latency_ms": 0}"#).unwrap();
        assert_eq!(profile.client_to_server.latency_ms, 0);
        assert_eq!(profile.server_to_client.latency_ms, 100);
    }

    #[test]
    fn test_parse_extended_keys() {
        let profile = parse_profile_body(
            r#"{"c2s_corrupt_rate": 1.0, "c2s_half_close_rate": 0.5, "s2c_stall_prob": 0.1}"#,
        )
        .unwrap();
        assert_eq!(profile.client_to_server.corrupt_rate, 1.0);
        assert_eq!(profile.client_to_server.half_close_rate, 0.5);
        assert_eq!(profile.server_to_client.stall_probability, 0.1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_profile_body("not json").is_err());
        assert!(parse_profile_body("[1,2,3]").is_err());
    }

    #[test]
    fn test_route_health_and_sessions() {
        let (config, manager) = test_stack();
        let health = route("GET", "/health", "", &config, &manager);
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains(r#"{"status":"ok"}"#));

        let sessions = route("GET", "/sessions", "", &config, &manager);
        assert!(sessions.contains(r#""count":0"#));

        let missing = route("GET", "/nope", "", &config, &manager);
        assert!(missing.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn test_route_profile_lifecycle() {
        let (config, manager) = test_stack();
        let set = route(
            "POST",
            "/profiles/chaos",
            r#"{"latency_ms": 10}"#,
            &config,
            &manager,
        );
        assert!(set.starts_with("HTTP/1.1 200"));
        assert!(set.contains(r#""version":1"#));
        assert_eq!(config.get_profile("chaos").client_to_server.latency_ms, 10);

        let del = route("DELETE", "/profiles/chaos", "", &config, &manager);
        assert!(del.contains(r#""deleted":true"#));
        let del_again = route("DELETE", "/profiles/chaos", "", &config, &manager);
        assert!(del_again.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn test_route_rate_limits_mutations() {
        let (config, manager) = test_stack();
        let mut last = String::new();
        for _ in 0..=ConfigLimits::CONFIG_UPDATE_RATE_LIMIT {
            last = route("POST", "/profiles/p", "{}", &config, &manager);
        }
        assert!(last.starts_with("HTTP/1.1 429"), "got: {last}");
    }

    #[tokio::test]
    async fn test_http_end_to_end() {
        let (config, manager) = test_stack();
        let server = ControlServer::new(Arc::clone(&config), Arc::clone(&manager));
        let addr = server.start(0).await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.contains(r#"{"status":"ok"}"#));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let body = r#"{"c2s_drop_rate": 1.0}"#;
        let request = format!(
            "POST /profiles/default HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response).contains(r#""version":"#));
        assert_eq!(config.get_profile("default").client_to_server.drop_rate, 1.0);

        server.stop();
    }
}
