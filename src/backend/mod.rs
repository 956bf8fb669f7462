//! Backend collaborator.
//!
//! The monitor never owns detection data or the camera process; it reaches
//! both through the [`Backend`] trait. `HttpBackend` talks to the deployed
//! API, `StubBackend` keeps everything in memory for local runs and tests.

use thiserror::Error;

use crate::record::{DetectionRecord, RecordDetail, RecordId};
use crate::session::ReportedStatus;

pub mod http;
pub mod stub;

pub use http::HttpBackend;
pub use stub::{StubBackend, StubOp};

/// Paths of the deployed API, relative to the backend base URL.
pub mod routes {
    pub const RECORDS: &str = "api/registros";
    pub const SESSION_STATUS: &str = "api/camera/status";
    pub const SESSION_START: &str = "api/camera/start";
    pub const SESSION_STOP: &str = "api/camera/stop";

    pub fn record(id: u64) -> String {
        format!("{RECORDS}/{id}")
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Transport(String),
    #[error("backend returned HTTP {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unexpected backend payload: {0}")]
    Decode(String),
}

/// Start and stop are intents; asking for the state the backend is already
/// in is acknowledged, not refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandAck {
    Done,
    AlreadyRunning,
    NotRunning,
}

impl CommandAck {
    pub fn parse(status: Option<&str>) -> Self {
        match status {
            Some("already_running") => CommandAck::AlreadyRunning,
            Some("not_running") => CommandAck::NotRunning,
            _ => CommandAck::Done,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandAck::Done => "success",
            CommandAck::AlreadyRunning => "already_running",
            CommandAck::NotRunning => "not_running",
        }
    }
}

/// Everything the monitor needs from the backend.
///
/// Implementations are called from worker threads and must not hold locks
/// across network I/O.
pub trait Backend: Send + Sync {
    /// Backend identifier for logs.
    fn name(&self) -> &'static str;

    /// Full current record set, newest first.
    fn list_records(&self) -> Result<Vec<DetectionRecord>, BackendError>;

    fn record_detail(&self, id: RecordId) -> Result<RecordDetail, BackendError>;

    fn delete_record(&self, id: RecordId) -> Result<(), BackendError>;

    fn delete_all(&self) -> Result<(), BackendError>;

    fn session_status(&self) -> Result<ReportedStatus, BackendError>;

    fn start_session(&self) -> Result<CommandAck, BackendError>;

    fn stop_session(&self) -> Result<CommandAck, BackendError>;
}
