//! HTTP client for the deployed backend API.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use super::{routes, Backend, BackendError, CommandAck};
use crate::config::MonitorConfig;
use crate::record::{
    normalize_records, DetailEnvelope, DetectionRecord, ListEnvelope, RecordDetail, RecordId,
};
use crate::session::ReportedStatus;

/// `{"status": "..."}` from the camera routes.
#[derive(Debug, Deserialize)]
struct StatusReply {
    #[serde(default)]
    status: Option<String>,
}

// FastAPI reports failures as {"detail": "..."}
#[derive(Debug, Deserialize)]
struct ErrorReply {
    detail: String,
}

pub struct HttpBackend {
    agent: ureq::Agent,
    base: Url,
    record_limit: u32,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration, record_limit: u32) -> Result<Self> {
        let mut base = Url::parse(base_url).context("parse backend url")?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported backend scheme '{}'; expected http(s)",
                base.scheme()
            ));
        }
        // join() replaces the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            base,
            record_limit,
        })
    }

    pub fn from_config(cfg: &MonitorConfig) -> Result<Self> {
        Self::new(&cfg.backend_url, cfg.request_timeout, cfg.record_limit)
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url, BackendError> {
        self.base
            .join(path)
            .map_err(|e| BackendError::Transport(format!("bad route '{path}': {e}")))
    }

    fn call(&self, method: &str, url: Url) -> Result<String, BackendError> {
        log::debug!("{} {}", method, url);
        let response = match self.agent.request_url(method, &url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                let detail = error_detail(&body);
                if status == 404 {
                    return Err(BackendError::NotFound(detail));
                }
                return Err(BackendError::Status { status, detail });
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(BackendError::Transport(err.to_string()))
            }
        };
        response
            .into_string()
            .map_err(|e| BackendError::Transport(format!("read response body: {e}")))
    }

    fn fetch<T: DeserializeOwned>(&self, method: &str, url: Url) -> Result<T, BackendError> {
        decode(&self.call(method, url)?)
    }

    fn command(&self, route: &str) -> Result<CommandAck, BackendError> {
        let body = self.call("POST", self.url(route)?)?;
        // an empty 200 is a plain acknowledgement
        let status = if body.trim().is_empty() {
            None
        } else {
            decode::<StatusReply>(&body)?.status
        };
        let ack = CommandAck::parse(status.as_deref());
        if ack != CommandAck::Done {
            log::info!("{} acknowledged as {}", route, ack.as_str());
        }
        Ok(ack)
    }
}

impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn list_records(&self) -> Result<Vec<DetectionRecord>, BackendError> {
        let mut url = self.url(routes::RECORDS)?;
        url.query_pairs_mut()
            .append_pair("limite", &self.record_limit.to_string());
        let envelope: ListEnvelope = self.fetch("GET", url)?;
        Ok(normalize_records(envelope.registros))
    }

    fn record_detail(&self, id: RecordId) -> Result<RecordDetail, BackendError> {
        let envelope: DetailEnvelope = self.fetch("GET", self.url(&routes::record(id))?)?;
        RecordDetail::from_wire(envelope).map_err(BackendError::Decode)
    }

    fn delete_record(&self, id: RecordId) -> Result<(), BackendError> {
        self.call("DELETE", self.url(&routes::record(id))?)?;
        Ok(())
    }

    fn delete_all(&self) -> Result<(), BackendError> {
        self.call("DELETE", self.url(routes::RECORDS)?)?;
        Ok(())
    }

    fn session_status(&self) -> Result<ReportedStatus, BackendError> {
        let reply: StatusReply = self.fetch("GET", self.url(routes::SESSION_STATUS)?)?;
        reply
            .status
            .as_deref()
            .map(ReportedStatus::parse)
            .ok_or_else(|| BackendError::Decode("status payload has no 'status'".into()))
    }

    fn start_session(&self) -> Result<CommandAck, BackendError> {
        self.command(routes::SESSION_START)
    }

    fn stop_session(&self) -> Result<CommandAck, BackendError> {
        self.command(routes::SESSION_STOP)
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, BackendError> {
    serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))
}

fn error_detail(body: &str) -> String {
    serde_json::from_str::<ErrorReply>(body)
        .map(|reply| reply.detail)
        .unwrap_or_else(|_| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gains_trailing_slash() -> Result<()> {
        let backend = HttpBackend::new("http://10.0.0.5:8000/epp", Duration::from_secs(1), 50)?;
        assert_eq!(backend.base_url().as_str(), "http://10.0.0.5:8000/epp/");
        assert_eq!(
            backend.url(routes::RECORDS).unwrap().as_str(),
            "http://10.0.0.5:8000/epp/api/registros"
        );
        Ok(())
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(HttpBackend::new("udp://10.0.0.5:9000", Duration::from_secs(1), 50).is_err());
    }

    #[test]
    fn error_detail_prefers_fastapi_detail() {
        assert_eq!(error_detail(r#"{"detail":"Registro no encontrado"}"#), "Registro no encontrado");
        assert_eq!(error_detail("  boom \n"), "boom");
    }

    #[test]
    fn status_reply_tolerates_missing_status() {
        let reply: StatusReply = serde_json::from_str(r#"{"message":"ok"}"#).unwrap();
        assert_eq!(CommandAck::parse(reply.status.as_deref()), CommandAck::Done);
        let reply: StatusReply = serde_json::from_str(r#"{"status":"already_running"}"#).unwrap();
        assert_eq!(CommandAck::parse(reply.status.as_deref()), CommandAck::AlreadyRunning);
    }
}
