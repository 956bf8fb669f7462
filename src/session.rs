//! Camera session state machine.
//!
//! `SessionMachine` is a pure transition function: it never sleeps and never
//! talks to the backend. Each accepted event returns the effects the owner
//! must carry out (arm a timer, issue a backend command, alert the operator);
//! rejected events say why they were ignored. The monitor loop and the
//! blocking [`SessionController`] are the two owners that execute effects.
//!
//! Start runs a fixed narrative before the single backend call:
//!
//! ```text
//! stopped -> starting -(dwell)-> connecting -(dwell)-> running -(dwell)-> POST start
//! ```
//!
//! A failed start rolls back to `stopped`; a failed stop rolls back to
//! `running`. Status polls only reconcile when no sequence is in flight.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::backend::Backend;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Stopped,
    Starting,
    Connecting,
    Running,
    Stopping,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting => "starting",
            SessionState::Connecting => "connecting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
        }
    }

    /// Only shown to the operator; the backend never reports these.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Connecting | SessionState::Stopping
        )
    }
}

/// Session status as reported by `GET /session/status`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReportedStatus {
    Running,
    Stopped,
    Other(String),
}

impl ReportedStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => ReportedStatus::Running,
            "stopped" => ReportedStatus::Stopped,
            other => ReportedStatus::Other(other.to_string()),
        }
    }
}

/// Fixed dwell times of the start narrative and the notice dismiss delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionTimings {
    pub starting: Duration,
    pub connecting: Duration,
    pub connected: Duration,
    pub dismiss_after_start: Duration,
    pub dismiss_after_stop: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            starting: Duration::from_millis(2000),
            connecting: Duration::from_millis(1500),
            connected: Duration::from_millis(1500),
            dismiss_after_start: Duration::from_millis(500),
            dismiss_after_stop: Duration::from_millis(2000),
        }
    }
}

impl SessionTimings {
    pub fn immediate() -> Self {
        Self {
            starting: Duration::ZERO,
            connecting: Duration::ZERO,
            connected: Duration::ZERO,
            dismiss_after_start: Duration::ZERO,
            dismiss_after_stop: Duration::ZERO,
        }
    }
}

pub type OpId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionTimer {
    Dwell { op: OpId },
    DismissNotice { notice: u64 },
}

/// Issued before a status request; the response must carry it back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollTicket {
    seq: u64,
    epoch: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    StartRequested,
    StopRequested,
    Timer(SessionTimer),
    StartAcked { op: OpId, result: Result<(), String> },
    StopAcked { op: OpId, result: Result<(), String> },
    StatusPolled { ticket: PollTicket, reported: ReportedStatus },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEffect {
    Schedule { after: Duration, timer: SessionTimer },
    IssueStart { op: OpId },
    IssueStop { op: OpId },
    Alert(SessionAlert),
}

/// A user-initiated command failed and the machine rolled back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionAlert {
    StartFailed(String),
    StopFailed(String),
}

impl SessionAlert {
    pub fn message(&self) -> &str {
        match self {
            SessionAlert::StartFailed(msg) | SessionAlert::StopFailed(msg) => msg,
        }
    }
}

impl fmt::Display for SessionAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionAlert::StartFailed(msg) => write!(f, "Error al iniciar cámara: {msg}"),
            SessionAlert::StopFailed(msg) => write!(f, "Error al detener cámara: {msg}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ignored {
    /// A start or stop sequence is already in flight.
    Busy,
    InvalidFromState(SessionState),
    StaleTimer,
    StaleAck,
    StalePoll,
    /// Poll arrived while a sequence owns the state.
    SequenceInFlight,
    AlreadyInSync,
    UnknownStatus(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied(Vec<SessionEffect>),
    Ignored(Ignored),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }

    pub fn effects(self) -> Vec<SessionEffect> {
        match self {
            Outcome::Applied(effects) => effects,
            Outcome::Ignored(_) => Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StartStep {
    Starting,
    Connecting,
    Connected,
    AwaitingAck,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Sequence {
    Start { op: OpId, step: StartStep },
    Stop { op: OpId },
}

/// Read-only snapshot for the presentation layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub state: SessionState,
    pub active: bool,
    pub busy: bool,
    pub notice_visible: bool,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    active: bool,
    sequence: Option<Sequence>,
    timings: SessionTimings,
    next_op: OpId,
    // bumped whenever a sequence begins or ends; polls issued under an older
    // epoch are discarded
    epoch: u64,
    next_poll: u64,
    last_poll: u64,
    notice: Option<u64>,
    next_notice: u64,
    last_error: Option<String>,
}

impl SessionMachine {
    pub fn new(timings: SessionTimings) -> Self {
        Self {
            state: SessionState::Stopped,
            active: false,
            sequence: None,
            timings,
            next_op: 0,
            epoch: 0,
            next_poll: 0,
            last_poll: 0,
            notice: None,
            next_notice: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_busy(&self) -> bool {
        self.sequence.is_some()
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            state: self.state,
            active: self.active,
            busy: self.is_busy(),
            notice_visible: self.notice.is_some(),
            last_error: self.last_error.clone(),
        }
    }

    pub fn issue_poll(&mut self) -> PollTicket {
        self.next_poll += 1;
        PollTicket {
            seq: self.next_poll,
            epoch: self.epoch,
        }
    }

    pub fn handle(&mut self, event: SessionEvent) -> Outcome {
        let outcome = match event {
            SessionEvent::StartRequested => self.on_start_requested(),
            SessionEvent::StopRequested => self.on_stop_requested(),
            SessionEvent::Timer(SessionTimer::Dwell { op }) => self.on_dwell(op),
            SessionEvent::Timer(SessionTimer::DismissNotice { notice }) => {
                self.on_dismiss(notice)
            }
            SessionEvent::StartAcked { op, result } => self.on_start_acked(op, result),
            SessionEvent::StopAcked { op, result } => self.on_stop_acked(op, result),
            SessionEvent::StatusPolled { ticket, reported } => self.on_polled(ticket, reported),
        };
        if let Outcome::Ignored(reason) = &outcome {
            log::debug!("session event ignored in {}: {:?}", self.state.as_str(), reason);
        }
        outcome
    }

    fn on_start_requested(&mut self) -> Outcome {
        if self.sequence.is_some() {
            return Outcome::Ignored(Ignored::Busy);
        }
        if self.state != SessionState::Stopped {
            return Outcome::Ignored(Ignored::InvalidFromState(self.state));
        }
        let op = self.begin_sequence();
        self.sequence = Some(Sequence::Start {
            op,
            step: StartStep::Starting,
        });
        self.enter(SessionState::Starting);
        Outcome::Applied(vec![SessionEffect::Schedule {
            after: self.timings.starting,
            timer: SessionTimer::Dwell { op },
        }])
    }

    fn on_stop_requested(&mut self) -> Outcome {
        if self.sequence.is_some() {
            return Outcome::Ignored(Ignored::Busy);
        }
        if self.state != SessionState::Running {
            return Outcome::Ignored(Ignored::InvalidFromState(self.state));
        }
        let op = self.begin_sequence();
        self.sequence = Some(Sequence::Stop { op });
        self.enter(SessionState::Stopping);
        Outcome::Applied(vec![SessionEffect::IssueStop { op }])
    }

    fn on_dwell(&mut self, fired: OpId) -> Outcome {
        let Some(Sequence::Start { op, step }) = self.sequence else {
            return Outcome::Ignored(Ignored::StaleTimer);
        };
        if op != fired {
            return Outcome::Ignored(Ignored::StaleTimer);
        }
        let (next, effect) = match step {
            StartStep::Starting => {
                self.enter(SessionState::Connecting);
                (
                    StartStep::Connecting,
                    SessionEffect::Schedule {
                        after: self.timings.connecting,
                        timer: SessionTimer::Dwell { op },
                    },
                )
            }
            StartStep::Connecting => {
                self.enter(SessionState::Running);
                self.active = true;
                (
                    StartStep::Connected,
                    SessionEffect::Schedule {
                        after: self.timings.connected,
                        timer: SessionTimer::Dwell { op },
                    },
                )
            }
            StartStep::Connected => (StartStep::AwaitingAck, SessionEffect::IssueStart { op }),
            StartStep::AwaitingAck => return Outcome::Ignored(Ignored::StaleTimer),
        };
        self.sequence = Some(Sequence::Start { op, step: next });
        Outcome::Applied(vec![effect])
    }

    fn on_start_acked(&mut self, acked: OpId, result: Result<(), String>) -> Outcome {
        match self.sequence {
            Some(Sequence::Start {
                op,
                step: StartStep::AwaitingAck,
            }) if op == acked => {}
            _ => return Outcome::Ignored(Ignored::StaleAck),
        }
        self.end_sequence();
        match result {
            Ok(()) => {
                log::info!("camera session started");
                Outcome::Applied(self.schedule_dismiss(self.timings.dismiss_after_start))
            }
            Err(err) => {
                log::warn!("camera start failed, rolling back: {}", err);
                self.enter(SessionState::Stopped);
                self.active = false;
                self.notice = None;
                self.last_error = Some(err.clone());
                Outcome::Applied(vec![SessionEffect::Alert(SessionAlert::StartFailed(err))])
            }
        }
    }

    fn on_stop_acked(&mut self, acked: OpId, result: Result<(), String>) -> Outcome {
        match self.sequence {
            Some(Sequence::Stop { op }) if op == acked => {}
            _ => return Outcome::Ignored(Ignored::StaleAck),
        }
        self.end_sequence();
        match result {
            Ok(()) => {
                log::info!("camera session stopped");
                self.enter(SessionState::Stopped);
                self.active = false;
                Outcome::Applied(self.schedule_dismiss(self.timings.dismiss_after_stop))
            }
            Err(err) => {
                log::warn!("camera stop failed, still running: {}", err);
                self.enter(SessionState::Running);
                self.active = true;
                self.notice = None;
                self.last_error = Some(err.clone());
                Outcome::Applied(vec![SessionEffect::Alert(SessionAlert::StopFailed(err))])
            }
        }
    }

    fn on_dismiss(&mut self, notice: u64) -> Outcome {
        if self.notice != Some(notice) {
            return Outcome::Ignored(Ignored::StaleTimer);
        }
        self.notice = None;
        Outcome::Applied(Vec::new())
    }

    fn on_polled(&mut self, ticket: PollTicket, reported: ReportedStatus) -> Outcome {
        if ticket.seq <= self.last_poll {
            return Outcome::Ignored(Ignored::StalePoll);
        }
        self.last_poll = ticket.seq;
        if self.sequence.is_some() {
            return Outcome::Ignored(Ignored::SequenceInFlight);
        }
        if ticket.epoch != self.epoch {
            return Outcome::Ignored(Ignored::StalePoll);
        }
        let target = match reported {
            ReportedStatus::Running => SessionState::Running,
            ReportedStatus::Stopped => SessionState::Stopped,
            ReportedStatus::Other(status) => {
                return Outcome::Ignored(Ignored::UnknownStatus(status))
            }
        };
        let active = target == SessionState::Running;
        if self.state == target && self.active == active {
            return Outcome::Ignored(Ignored::AlreadyInSync);
        }
        log::info!(
            "backend reports session {}, correcting local {}",
            target.as_str(),
            self.state.as_str()
        );
        self.enter(target);
        self.active = active;
        Outcome::Applied(Vec::new())
    }

    fn begin_sequence(&mut self) -> OpId {
        self.next_op += 1;
        self.epoch += 1;
        self.next_notice += 1;
        self.notice = Some(self.next_notice);
        self.last_error = None;
        self.next_op
    }

    fn end_sequence(&mut self) {
        self.sequence = None;
        self.epoch += 1;
    }

    fn schedule_dismiss(&self, after: Duration) -> Vec<SessionEffect> {
        match self.notice {
            Some(notice) => vec![SessionEffect::Schedule {
                after,
                timer: SessionTimer::DismissNotice { notice },
            }],
            None => Vec::new(),
        }
    }

    fn enter(&mut self, next: SessionState) {
        if self.state != next {
            log::debug!("session {} -> {}", self.state.as_str(), next.as_str());
        }
        self.state = next;
    }
}

/// Runs the session machine synchronously against a backend, sleeping
/// through each dwell. Used by the one-shot CLI commands.
pub struct SessionController<'a> {
    machine: SessionMachine,
    backend: &'a dyn Backend,
    on_change: Option<Box<dyn FnMut(&SessionView) + 'a>>,
}

impl<'a> SessionController<'a> {
    pub fn new(backend: &'a dyn Backend, timings: SessionTimings) -> Self {
        Self {
            machine: SessionMachine::new(timings),
            backend,
            on_change: None,
        }
    }

    pub fn on_change(mut self, callback: impl FnMut(&SessionView) + 'a) -> Self {
        self.on_change = Some(Box::new(callback));
        self
    }

    pub fn view(&self) -> SessionView {
        self.machine.view()
    }

    /// Pulls the backend's status into the local machine.
    pub fn sync_status(&mut self) -> Result<SessionView> {
        let ticket = self.machine.issue_poll();
        let reported = self.backend.session_status()?;
        self.dispatch(SessionEvent::StatusPolled { ticket, reported })?;
        Ok(self.view())
    }

    pub fn start(&mut self) -> Result<SessionView> {
        self.dispatch(SessionEvent::StartRequested)?;
        Ok(self.view())
    }

    pub fn stop(&mut self) -> Result<SessionView> {
        self.dispatch(SessionEvent::StopRequested)?;
        Ok(self.view())
    }

    fn dispatch(&mut self, event: SessionEvent) -> Result<()> {
        let mut pending = VecDeque::from([event]);
        let mut alert = None;
        while let Some(event) = pending.pop_front() {
            let outcome = self.machine.handle(event);
            if outcome.is_applied() {
                let view = self.machine.view();
                if let Some(callback) = self.on_change.as_mut() {
                    callback(&view);
                }
            }
            for effect in outcome.effects() {
                match effect {
                    SessionEffect::Schedule { after, timer } => {
                        std::thread::sleep(after);
                        pending.push_back(SessionEvent::Timer(timer));
                    }
                    SessionEffect::IssueStart { op } => {
                        let result = self
                            .backend
                            .start_session()
                            .map(|_| ())
                            .map_err(|e| e.to_string());
                        pending.push_back(SessionEvent::StartAcked { op, result });
                    }
                    SessionEffect::IssueStop { op } => {
                        let result = self
                            .backend
                            .stop_session()
                            .map(|_| ())
                            .map_err(|e| e.to_string());
                        pending.push_back(SessionEvent::StopAcked { op, result });
                    }
                    SessionEffect::Alert(message) => alert = Some(message),
                }
            }
        }
        match alert {
            Some(alert) => Err(anyhow!("{}", alert)),
            None => Ok(()),
        }
    }
}
