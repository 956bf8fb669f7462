//! Single-owner event loop for a running dashboard.
//!
//! One thread owns the [`SessionMachine`] and the [`RecordSync`]. Timers
//! live in a deadline queue on that thread; backend I/O runs on short-lived
//! worker threads that post their completion back to the owner's channel,
//! so every state change happens on the owner in arrival order.

use anyhow::{anyhow, Result};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::backend::{Backend, BackendError, CommandAck};
use crate::config::MonitorConfig;
use crate::record::{DetectionRecord, RecordDetail, RecordId};
use crate::session::{
    PollTicket, ReportedStatus, SessionAlert, SessionEffect, SessionEvent, SessionMachine,
    SessionTimer, SessionTimings, SessionView,
};
use crate::sync::{
    DetailOutcome, DetailTicket, RecordSync, RecordsView, RefreshOrigin, RefreshOutcome,
    RefreshTicket, UserAction, UserError,
};

pub const REFRESHED_NOTICE: &str = "✓ Refrescado";

// upper bound on a single wait so the shutdown flag is seen promptly
const MAX_IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub refresh_interval: Duration,
    pub status_poll_interval: Duration,
    pub series_window: usize,
    pub session: SessionTimings,
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            refresh_interval: cfg.refresh_interval,
            status_poll_interval: cfg.status_poll_interval,
            series_window: cfg.series_window,
            session: cfg.session,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    StartSession,
    StopSession,
    Refresh,
    OpenDetail(RecordId),
    CloseDetail,
    Delete(RecordId),
    DeleteAll,
    Shutdown,
}

/// What the presentation layer gets told.
#[derive(Clone, Debug, PartialEq)]
pub enum MonitorUpdate {
    Session(SessionView),
    Records(RecordsView),
    Detail(Option<RecordDetail>),
    Notice(String),
    Error(UserError),
}

enum Completion {
    Status {
        ticket: PollTicket,
        result: Result<ReportedStatus, BackendError>,
    },
    StartAck {
        op: u64,
        result: Result<CommandAck, BackendError>,
    },
    StopAck {
        op: u64,
        result: Result<CommandAck, BackendError>,
    },
    Refresh {
        ticket: RefreshTicket,
        result: Result<Vec<DetectionRecord>, BackendError>,
    },
    Detail {
        ticket: DetailTicket,
        result: Result<RecordDetail, BackendError>,
    },
    Delete {
        action: UserAction,
        result: Result<(), BackendError>,
    },
}

enum Message {
    Command(Command),
    Completion(Completion),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerKind {
    StatusPoll,
    Refresh,
    Session(SessionTimer),
}

struct TimerEntry {
    deadline: Instant,
    // insertion order breaks deadline ties
    seq: u64,
    kind: TimerKind,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // reversed: BinaryHeap is a max-heap and the earliest deadline must pop first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    fn schedule(&mut self, after: Duration, kind: TimerKind) {
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline: Instant::now() + after,
            seq: self.next_seq,
            kind,
        });
    }

    fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        if self.heap.peek()?.deadline <= now {
            return self.heap.pop().map(|entry| entry.kind);
        }
        None
    }

    fn wait_time(&self, now: Instant) -> Duration {
        self.heap
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(now))
            .unwrap_or(MAX_IDLE_WAIT)
            .min(MAX_IDLE_WAIT)
    }

    fn clear(&mut self) {
        self.heap.clear();
    }
}

pub struct Monitor {
    backend: Arc<dyn Backend>,
    settings: MonitorSettings,
}

pub struct MonitorHandle {
    commands: Sender<Message>,
    updates: Receiver<MonitorUpdate>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(Message::Command(command))
            .map_err(|_| anyhow!("monitor loop has exited"))
    }

    pub fn updates(&self) -> &Receiver<MonitorUpdate> {
        &self.updates
    }

    /// Cancels both polling loops and every pending timer, then joins the
    /// owner thread. Completions still in flight are dropped.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.commands.send(Message::Command(Command::Shutdown));
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("monitor thread panicked"))?;
        }
        Ok(())
    }
}

impl Monitor {
    pub fn new(backend: Arc<dyn Backend>, settings: MonitorSettings) -> Self {
        Self { backend, settings }
    }

    /// Mounts the monitor: the status poll and the record refresh both fire
    /// immediately, then repeat at their fixed intervals.
    pub fn spawn(self) -> Result<MonitorHandle> {
        let (tx, rx) = mpsc::channel();
        let (updates_tx, updates_rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let worker_tx = tx.clone();
        log::info!(
            "monitor mounted on {} backend (refresh every {:?}, status every {:?})",
            self.backend.name(),
            self.settings.refresh_interval,
            self.settings.status_poll_interval
        );
        let join = std::thread::Builder::new()
            .name("epp-monitor".into())
            .spawn(move || {
                let mut owner = Owner::new(self.backend, self.settings, worker_tx, updates_tx);
                owner.run(rx, &shutdown_thread);
            })?;
        Ok(MonitorHandle {
            commands: tx,
            updates: updates_rx,
            shutdown,
            join: Some(join),
        })
    }
}

struct Owner {
    backend: Arc<dyn Backend>,
    settings: MonitorSettings,
    session: SessionMachine,
    records: RecordSync,
    timers: TimerQueue,
    completions: Sender<Message>,
    updates: Sender<MonitorUpdate>,
}

impl Owner {
    fn new(
        backend: Arc<dyn Backend>,
        settings: MonitorSettings,
        completions: Sender<Message>,
        updates: Sender<MonitorUpdate>,
    ) -> Self {
        Self {
            session: SessionMachine::new(settings.session),
            records: RecordSync::new(settings.series_window),
            timers: TimerQueue::default(),
            backend,
            settings,
            completions,
            updates,
        }
    }

    fn run(&mut self, rx: Receiver<Message>, shutdown: &AtomicBool) {
        self.publish(MonitorUpdate::Session(self.session.view()));
        self.publish(MonitorUpdate::Records(self.records.view()));
        self.timers.schedule(Duration::ZERO, TimerKind::StatusPoll);
        self.timers.schedule(Duration::ZERO, TimerKind::Refresh);

        while !shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            while let Some(kind) = self.timers.pop_due(now) {
                self.on_timer(kind);
            }
            match rx.recv_timeout(self.timers.wait_time(Instant::now())) {
                Ok(Message::Command(Command::Shutdown)) => break,
                Ok(Message::Command(command)) => self.on_command(command),
                Ok(Message::Completion(completion)) => self.on_completion(completion),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.timers.clear();
        log::info!("monitor stopped");
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::StatusPoll => {
                let ticket = self.session.issue_poll();
                self.io(move |backend| Completion::Status {
                    ticket,
                    result: backend.session_status(),
                });
                self.timers
                    .schedule(self.settings.status_poll_interval, TimerKind::StatusPoll);
            }
            TimerKind::Refresh => {
                self.refresh(RefreshOrigin::Scheduled);
                self.timers
                    .schedule(self.settings.refresh_interval, TimerKind::Refresh);
            }
            TimerKind::Session(timer) => self.drive(SessionEvent::Timer(timer)),
        }
    }

    fn on_command(&mut self, command: Command) {
        log::debug!("command {:?}", command);
        match command {
            Command::StartSession => self.drive(SessionEvent::StartRequested),
            Command::StopSession => self.drive(SessionEvent::StopRequested),
            Command::Refresh => self.refresh(RefreshOrigin::Manual),
            Command::OpenDetail(id) => {
                let ticket = self.records.begin_detail(id);
                self.io(move |backend| Completion::Detail {
                    ticket,
                    result: backend.record_detail(id),
                });
            }
            Command::CloseDetail => {
                self.records.close_detail();
                self.publish(MonitorUpdate::Detail(None));
            }
            Command::Delete(id) => self.io(move |backend| Completion::Delete {
                action: UserAction::Delete,
                result: backend.delete_record(id),
            }),
            Command::DeleteAll => self.io(|backend| Completion::Delete {
                action: UserAction::DeleteAll,
                result: backend.delete_all(),
            }),
            Command::Shutdown => {}
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Status { ticket, result } => match result {
                Ok(reported) => self.drive(SessionEvent::StatusPolled { ticket, reported }),
                Err(err) => log::warn!("status poll failed, retrying next cycle: {}", err),
            },
            Completion::StartAck { op, result } => {
                let result = result.map(|_| ()).map_err(|e| e.to_string());
                self.drive(SessionEvent::StartAcked { op, result });
            }
            Completion::StopAck { op, result } => {
                let result = result.map(|_| ()).map_err(|e| e.to_string());
                self.drive(SessionEvent::StopAcked { op, result });
            }
            Completion::Refresh { ticket, result } => {
                let had_detail = self.records.detail().is_some();
                match self.records.complete_refresh(ticket, result) {
                    RefreshOutcome::Applied { origin, .. } => {
                        self.publish(MonitorUpdate::Records(self.records.view()));
                        if had_detail {
                            self.publish(MonitorUpdate::Detail(self.records.detail().cloned()));
                        }
                        if origin.user_initiated() {
                            self.publish(MonitorUpdate::Notice(REFRESHED_NOTICE.to_string()));
                        }
                    }
                    RefreshOutcome::Stale => {}
                    RefreshOutcome::Retrying => {
                        self.publish(MonitorUpdate::Records(self.records.view()));
                    }
                    RefreshOutcome::Failed(err) => {
                        self.publish(MonitorUpdate::Records(self.records.view()));
                        self.publish(MonitorUpdate::Error(err));
                    }
                }
            }
            Completion::Detail { ticket, result } => {
                match self.records.complete_detail(ticket, result) {
                    DetailOutcome::Opened(_) => {
                        self.publish(MonitorUpdate::Detail(self.records.detail().cloned()));
                    }
                    DetailOutcome::Stale => {}
                    DetailOutcome::Failed(err) => self.publish(MonitorUpdate::Error(err)),
                }
            }
            Completion::Delete { action, result } => {
                match self.records.complete_delete(action, result) {
                    Ok(ticket) => {
                        self.publish(MonitorUpdate::Records(self.records.view()));
                        self.spawn_refresh(ticket);
                    }
                    Err(err) => self.publish(MonitorUpdate::Error(err)),
                }
            }
        }
    }

    fn refresh(&mut self, origin: RefreshOrigin) {
        let ticket = self.records.begin_refresh(origin);
        self.spawn_refresh(ticket);
    }

    fn spawn_refresh(&self, ticket: RefreshTicket) {
        self.io(move |backend| Completion::Refresh {
            ticket,
            result: backend.list_records(),
        });
    }

    /// Feeds one event through the session machine and carries out the
    /// effects it asks for.
    fn drive(&mut self, event: SessionEvent) {
        let outcome = self.session.handle(event);
        if !outcome.is_applied() {
            return;
        }
        self.publish(MonitorUpdate::Session(self.session.view()));
        for effect in outcome.effects() {
            match effect {
                SessionEffect::Schedule { after, timer } => {
                    self.timers.schedule(after, TimerKind::Session(timer));
                }
                SessionEffect::IssueStart { op } => self.io(move |backend| Completion::StartAck {
                    op,
                    result: backend.start_session(),
                }),
                SessionEffect::IssueStop { op } => self.io(move |backend| Completion::StopAck {
                    op,
                    result: backend.stop_session(),
                }),
                SessionEffect::Alert(alert) => {
                    let err = match &alert {
                        SessionAlert::StartFailed(msg) => {
                            UserError::new(UserAction::StartSession, msg)
                        }
                        SessionAlert::StopFailed(msg) => UserError::new(UserAction::StopSession, msg),
                    };
                    log::warn!("{}", alert);
                    self.publish(MonitorUpdate::Error(err));
                }
            }
        }
    }

    fn io<F>(&self, call: F)
    where
        F: FnOnce(&dyn Backend) -> Completion + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let tx = self.completions.clone();
        let spawned = std::thread::Builder::new()
            .name("epp-monitor-io".into())
            .spawn(move || {
                let completion = call(backend.as_ref());
                // the owner may have shut down meanwhile
                let _ = tx.send(Message::Completion(completion));
            });
        if let Err(err) = spawned {
            log::error!("failed to spawn backend worker: {}", err);
        }
    }

    fn publish(&self, update: MonitorUpdate) {
        let _ = self.updates.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_queue_pops_earliest_first() {
        let mut queue = TimerQueue::default();
        queue.schedule(Duration::from_millis(30), TimerKind::Refresh);
        queue.schedule(Duration::ZERO, TimerKind::StatusPoll);
        queue.schedule(Duration::ZERO, TimerKind::Refresh);
        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(queue.pop_due(later), Some(TimerKind::StatusPoll));
        assert_eq!(queue.pop_due(later), Some(TimerKind::Refresh));
        assert_eq!(queue.pop_due(later), Some(TimerKind::Refresh));
        assert_eq!(queue.pop_due(later), None);
    }

    #[test]
    fn idle_wait_is_bounded() {
        let mut queue = TimerQueue::default();
        assert_eq!(queue.wait_time(Instant::now()), MAX_IDLE_WAIT);
        queue.schedule(Duration::from_secs(60), TimerKind::Refresh);
        assert_eq!(queue.wait_time(Instant::now()), MAX_IDLE_WAIT);
        queue.clear();
        assert!(queue.pop_due(Instant::now() + Duration::from_secs(120)).is_none());
    }
}
