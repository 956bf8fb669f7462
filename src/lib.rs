//! EPP Monitor
//!
//! Client for a personal-protective-equipment compliance dashboard. The
//! backend owns the detection records and the camera process; this crate
//! mirrors that state locally and drives the camera session.
//!
//! # Architecture
//!
//! Two single-owner state containers:
//!
//! 1. **Session controller** (`session`): a total state machine over
//!    `stopped → starting → connecting → running → stopping`, with fixed
//!    dwells before the backend start call and rollback on failure.
//! 2. **Record sync engine** (`sync`): a cached record snapshot, fully
//!    replaced on every refresh, with derived statistics and a trend series.
//!
//! Both are advanced by one owner thread (`monitor`); backend I/O runs on
//! worker threads and comes back as completions. Responses older than what
//! is already applied are discarded.
//!
//! # Module Structure
//!
//! - `record`: wire normalization, detail reconciliation, evidence paths
//! - `stats`: aggregates, trend series, compliance bands
//! - `session`: session state machine and a blocking controller
//! - `sync`: record cache, refresh and detail tickets, deletes
//! - `backend`: the `Backend` trait with HTTP and in-memory implementations
//! - `monitor`: the event loop for a live dashboard
//! - `stub_server`: serves any `Backend` over the deployed HTTP routes
//! - `config`, `report`, `ui`: configuration, text rendering, status notice

pub mod backend;
pub mod config;
pub mod monitor;
pub mod record;
pub mod report;
pub mod session;
pub mod stats;
pub mod stub_server;
pub mod sync;
pub mod ui;

pub use backend::{Backend, BackendError, CommandAck, HttpBackend, StubBackend, StubOp};
pub use config::MonitorConfig;
pub use monitor::{Command, Monitor, MonitorHandle, MonitorSettings, MonitorUpdate};
pub use record::{
    format_timestamp, DetectionRecord, EvidenceImage, PersonDetection, RecordDetail, RecordId,
};
pub use session::{
    ReportedStatus, SessionController, SessionMachine, SessionState, SessionTimings, SessionView,
};
pub use stats::{
    build_series, classify_compliance, compute_stats, rate_compliance, AggregateStats,
    ComplianceBand, ComplianceRating, Series, SeriesPoint,
};
pub use stub_server::{StubServer, StubServerHandle};
pub use sync::{RecordSync, RecordsView, RefreshOrigin, RefreshOutcome, UserAction, UserError};
