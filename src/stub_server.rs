//! Loopback HTTP server exposing any [`Backend`] under the deployed routes.
//!
//! Used by `epp-stub-backend` for local runs and by the HTTP integration
//! tests. Connections are served one at a time on a single thread.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{routes, Backend, BackendError, CommandAck};
use crate::record::RecordId;
use crate::session::ReportedStatus;

const MAX_REQUEST_BYTES: usize = 8192;

pub struct StubServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StubServerHandle {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("stub server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct StubServer {
    backend: Arc<dyn Backend>,
    addr: String,
}

impl StubServer {
    pub fn new(backend: Arc<dyn Backend>, addr: impl Into<String>) -> Self {
        Self {
            backend,
            addr: addr.into(),
        }
    }

    pub fn spawn(self) -> Result<StubServerHandle> {
        let configured_addr: SocketAddr = self.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let backend = self.backend;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_server(listener, backend.as_ref(), shutdown_thread) {
                log::warn!("stub server exited: {}", err);
            }
        });
        log::info!("stub backend listening on http://{}", addr);
        Ok(StubServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(listener: TcpListener, backend: &dyn Backend, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, backend) {
                    log::warn!("stub request failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, backend: &dyn Backend) -> Result<()> {
    // the listener is nonblocking; accepted streams must not be
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    log::debug!("stub {} {}", request.method, request.raw_path);
    let (status, body) = match route(&request, backend) {
        Ok(body) => (200, body),
        Err(Reply::NotFound) => (404, json!({ "detail": "Not Found" })),
        Err(Reply::MethodNotAllowed) => (405, json!({ "detail": "Method Not Allowed" })),
        Err(Reply::Backend(err)) => error_reply(err),
    };
    write_json_response(&mut stream, status, &body)
}

enum Reply {
    NotFound,
    MethodNotAllowed,
    Backend(BackendError),
}

impl From<BackendError> for Reply {
    fn from(err: BackendError) -> Self {
        Reply::Backend(err)
    }
}

fn route(request: &HttpRequest, backend: &dyn Backend) -> Result<Value, Reply> {
    let path = request.path.trim_start_matches('/');
    let method = request.method.as_str();
    if path == routes::RECORDS {
        return match method {
            "GET" => {
                let mut records = backend.list_records()?;
                if let Some(limit) = request.query("limite").and_then(|v| v.parse().ok()) {
                    records.truncate(limit);
                }
                Ok(json!({ "registros": records }))
            }
            "DELETE" => {
                backend.delete_all()?;
                Ok(json!({ "status": "success" }))
            }
            _ => Err(Reply::MethodNotAllowed),
        };
    }
    if let Some(raw_id) = path
        .strip_prefix(routes::RECORDS)
        .and_then(|rest| rest.strip_prefix('/'))
    {
        let id: RecordId = raw_id.parse().map_err(|_| Reply::NotFound)?;
        return match method {
            "GET" => {
                let detail = backend.record_detail(id)?;
                // placeholders are a client-side concern
                let detecciones: Vec<Value> = detail
                    .persons
                    .iter()
                    .filter(|p| !p.placeholder)
                    .map(|p| {
                        json!({
                            "numero_persona": p.numero_persona,
                            "tiene_casco": p.tiene_casco as u8,
                            "tiene_chaleco": p.tiene_chaleco as u8,
                            "tiene_gafas": p.tiene_gafas as u8,
                        })
                    })
                    .collect();
                Ok(json!({ "registro": detail.record, "detecciones": detecciones }))
            }
            "DELETE" => {
                backend.delete_record(id)?;
                Ok(json!({ "status": "success" }))
            }
            _ => Err(Reply::MethodNotAllowed),
        };
    }
    match (method, path) {
        ("GET", routes::SESSION_STATUS) => {
            let status = match backend.session_status()? {
                ReportedStatus::Running => "running".to_string(),
                ReportedStatus::Stopped => "stopped".to_string(),
                ReportedStatus::Other(other) => other,
            };
            Ok(json!({ "status": status }))
        }
        ("POST", routes::SESSION_START) => Ok(ack_body(backend.start_session()?)),
        ("POST", routes::SESSION_STOP) => Ok(ack_body(backend.stop_session()?)),
        (_, routes::SESSION_STATUS | routes::SESSION_START | routes::SESSION_STOP) => {
            Err(Reply::MethodNotAllowed)
        }
        _ => Err(Reply::NotFound),
    }
}

fn ack_body(ack: CommandAck) -> Value {
    json!({ "status": ack.as_str() })
}

fn error_reply(err: BackendError) -> (u16, Value) {
    match err {
        BackendError::NotFound(detail) => (404, json!({ "detail": detail })),
        BackendError::Status { status, detail } => (status, json!({ "detail": detail })),
        BackendError::Transport(detail) => (503, json!({ "detail": detail })),
        BackendError::Decode(detail) => (500, json!({ "detail": detail })),
    }
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
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Error",
    };
    let header = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
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
    raw_path: String,
}

impl HttpRequest {
    fn query(&self, key: &str) -> Option<&str> {
        let query = self.raw_path.split_once('?')?.1;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}
