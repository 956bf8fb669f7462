//! Record cache and the operations that keep it in step with the backend.
//!
//! `RecordSync` owns the last complete record snapshot plus everything
//! derived from it. Requests are split into `begin_*` (hand out a ticket)
//! and `complete_*` (apply the response carrying that ticket) so the owner
//! can run I/O elsewhere; a response whose ticket is older than what is
//! already applied is dropped, and a failure is dropped once a newer request
//! has been issued. The `*_with` helpers run both halves inline
//! against a backend for one-shot callers.

use serde::Serialize;
use std::fmt;

use crate::backend::{Backend, BackendError};
use crate::record::{reconcile_persons, DetectionRecord, PersonDetection, RecordDetail, RecordId};
use crate::stats::{build_series, compute_stats, AggregateStats, Series};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RefreshOrigin {
    /// Fixed-interval background refresh.
    Scheduled,
    /// Operator pressed refresh.
    Manual,
    /// Follow-up to a successful deletion.
    AfterDelete,
}

impl RefreshOrigin {
    pub fn user_initiated(self) -> bool {
        !matches!(self, RefreshOrigin::Scheduled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshTicket {
    seq: u64,
    origin: RefreshOrigin,
}

impl RefreshTicket {
    pub fn origin(&self) -> RefreshOrigin {
        self.origin
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetailTicket {
    seq: u64,
    id: RecordId,
}

impl DetailTicket {
    pub fn id(&self) -> RecordId {
        self.id
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum UserAction {
    Refresh,
    OpenDetail,
    Delete,
    DeleteAll,
    StartSession,
    StopSession,
}

impl UserAction {
    pub fn label(self) -> &'static str {
        match self {
            UserAction::Refresh => "Error al refrescar datos",
            UserAction::OpenDetail => "Error al cargar el detalle",
            UserAction::Delete => "Error al eliminar registro",
            UserAction::DeleteAll => "Error al eliminar registros",
            UserAction::StartSession => "Error al iniciar cámara",
            UserAction::StopSession => "Error al detener cámara",
        }
    }
}

/// Failure of an explicit operator action; always shown to the operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserError {
    pub action: UserAction,
    pub message: String,
}

impl UserError {
    pub fn new(action: UserAction, err: impl ToString) -> Self {
        Self {
            action,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.action.label(), self.message)
    }
}

impl std::error::Error for UserError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied {
        origin: RefreshOrigin,
        records: usize,
        /// The open detail's record no longer exists and the view was closed.
        detail_closed: bool,
    },
    /// A newer refresh already landed.
    Stale,
    /// Background failure; logged and retried on the next interval.
    Retrying,
    Failed(UserError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DetailOutcome {
    Opened(RecordId),
    /// Superseded by a later detail request or closed meanwhile.
    Stale,
    Failed(UserError),
}

/// Everything the presentation layer reads after a refresh.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordsView {
    pub records: Vec<DetectionRecord>,
    pub stats: AggregateStats,
    pub series: Series,
    pub loading: bool,
}

#[derive(Debug)]
pub struct RecordSync {
    records: Vec<DetectionRecord>,
    stats: AggregateStats,
    series: Series,
    series_window: usize,
    loading: bool,
    next_refresh: u64,
    applied_refresh: u64,
    detail: Option<RecordDetail>,
    next_detail: u64,
    pending_detail: Option<u64>,
}

impl RecordSync {
    pub fn new(series_window: usize) -> Self {
        Self {
            records: Vec::new(),
            stats: AggregateStats::default(),
            series: Series::InsufficientData { available: 0 },
            series_window,
            loading: true,
            next_refresh: 0,
            applied_refresh: 0,
            detail: None,
            next_detail: 0,
            pending_detail: None,
        }
    }

    pub fn records(&self) -> &[DetectionRecord] {
        &self.records
    }

    pub fn stats(&self) -> &AggregateStats {
        &self.stats
    }

    pub fn series(&self) -> &Series {
        &self.series
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn detail(&self) -> Option<&RecordDetail> {
        self.detail.as_ref()
    }

    pub fn view(&self) -> RecordsView {
        RecordsView {
            records: self.records.clone(),
            stats: self.stats,
            series: self.series.clone(),
            loading: self.loading,
        }
    }

    pub fn begin_refresh(&mut self, origin: RefreshOrigin) -> RefreshTicket {
        self.next_refresh += 1;
        RefreshTicket {
            seq: self.next_refresh,
            origin,
        }
    }

    pub fn complete_refresh(
        &mut self,
        ticket: RefreshTicket,
        result: Result<Vec<DetectionRecord>, BackendError>,
    ) -> RefreshOutcome {
        if ticket.seq <= self.applied_refresh {
            log::debug!(
                "discarding refresh #{} (#{} already applied)",
                ticket.seq,
                self.applied_refresh
            );
            return RefreshOutcome::Stale;
        }
        // only the newest issued request may clear `loading` or report a failure
        let latest = ticket.seq == self.next_refresh;
        let records = match result {
            Ok(records) => records,
            Err(err) if !latest => {
                log::debug!(
                    "discarding failed refresh #{} (#{} issued since): {}",
                    ticket.seq,
                    self.next_refresh,
                    err
                );
                return RefreshOutcome::Stale;
            }
            Err(err) => {
                self.loading = false;
                if ticket.origin.user_initiated() {
                    log::warn!("record refresh failed: {}", err);
                    return RefreshOutcome::Failed(UserError::new(UserAction::Refresh, err));
                }
                log::warn!("background record refresh failed, retrying next cycle: {}", err);
                return RefreshOutcome::Retrying;
            }
        };
        self.applied_refresh = ticket.seq;
        self.records = records;
        self.stats = compute_stats(&self.records);
        self.series = build_series(&self.records, self.series_window);
        if latest {
            self.loading = false;
        }
        let detail_closed = self.reresolve_detail();
        RefreshOutcome::Applied {
            origin: ticket.origin,
            records: self.records.len(),
            detail_closed,
        }
    }

    // an open detail follows its record by id across snapshots
    fn reresolve_detail(&mut self) -> bool {
        let Some(detail) = self.detail.as_mut() else {
            return false;
        };
        match self.records.iter().find(|r| r.id == detail.record.id) {
            Some(fresh) => {
                let reported: Vec<PersonDetection> = std::mem::take(&mut detail.persons)
                    .into_iter()
                    .filter(|p| !p.placeholder)
                    .collect();
                detail.persons = reconcile_persons(fresh.total_personas, reported);
                detail.record = fresh.clone();
                false
            }
            None => {
                log::info!("record #{} disappeared, closing detail", detail.record.id);
                self.detail = None;
                true
            }
        }
    }

    pub fn begin_detail(&mut self, id: RecordId) -> DetailTicket {
        self.next_detail += 1;
        self.pending_detail = Some(self.next_detail);
        DetailTicket {
            seq: self.next_detail,
            id,
        }
    }

    pub fn complete_detail(
        &mut self,
        ticket: DetailTicket,
        result: Result<RecordDetail, BackendError>,
    ) -> DetailOutcome {
        if self.pending_detail != Some(ticket.seq) {
            return DetailOutcome::Stale;
        }
        self.pending_detail = None;
        match result {
            Ok(detail) => {
                self.detail = Some(detail);
                DetailOutcome::Opened(ticket.id)
            }
            Err(err) => {
                log::warn!("detail for record #{} failed: {}", ticket.id, err);
                DetailOutcome::Failed(UserError::new(UserAction::OpenDetail, err))
            }
        }
    }

    pub fn close_detail(&mut self) {
        self.pending_detail = None;
        self.detail = None;
    }

    /// Deletions never touch the cache: success hands back the refresh that
    /// must follow, failure leaves everything as displayed.
    pub fn complete_delete(
        &mut self,
        action: UserAction,
        result: Result<(), BackendError>,
    ) -> Result<RefreshTicket, UserError> {
        match result {
            Ok(()) => {
                self.loading = true;
                Ok(self.begin_refresh(RefreshOrigin::AfterDelete))
            }
            Err(err) => {
                log::warn!("{} failed: {}", action.label(), err);
                Err(UserError::new(action, err))
            }
        }
    }

    pub fn refresh_with(&mut self, backend: &dyn Backend, origin: RefreshOrigin) -> RefreshOutcome {
        let ticket = self.begin_refresh(origin);
        self.complete_refresh(ticket, backend.list_records())
    }

    pub fn open_detail_with(
        &mut self,
        backend: &dyn Backend,
        id: RecordId,
    ) -> Result<&RecordDetail, UserError> {
        let ticket = self.begin_detail(id);
        match self.complete_detail(ticket, backend.record_detail(id)) {
            DetailOutcome::Failed(err) => Err(err),
            DetailOutcome::Opened(_) | DetailOutcome::Stale => self
                .detail
                .as_ref()
                .ok_or_else(|| UserError::new(UserAction::OpenDetail, "detail superseded")),
        }
    }

    pub fn delete_with(
        &mut self,
        backend: &dyn Backend,
        id: RecordId,
    ) -> Result<RefreshOutcome, UserError> {
        let ticket = self.complete_delete(UserAction::Delete, backend.delete_record(id))?;
        Ok(self.complete_refresh(ticket, backend.list_records()))
    }

    pub fn delete_all_with(&mut self, backend: &dyn Backend) -> Result<RefreshOutcome, UserError> {
        let ticket = self.complete_delete(UserAction::DeleteAll, backend.delete_all())?;
        Ok(self.complete_refresh(ticket, backend.list_records()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{StubBackend, StubOp};
    use crate::stats::DEFAULT_SERIES_WINDOW;

    fn record(personas: u32, cascos: f64) -> DetectionRecord {
        DetectionRecord {
            id: 0,
            timestamp: None,
            total_personas: personas,
            cumplimiento_cascos: cascos,
            cumplimiento_chalecos: 100.0,
            cumplimiento_gafas: 100.0,
            cumplimiento_general: cascos,
            ruta_imagen: None,
        }
    }

    fn seeded() -> StubBackend {
        let stub = StubBackend::new();
        stub.insert(record(2, 50.0), vec![]);
        stub.insert(record(0, 100.0), vec![]);
        stub.insert(record(4, 75.0), vec![]);
        stub
    }

    fn person(numero: u32, casco: bool) -> PersonDetection {
        PersonDetection {
            numero_persona: numero,
            tiene_casco: casco,
            tiene_chaleco: false,
            tiene_gafas: false,
            placeholder: false,
        }
    }

    fn down() -> BackendError {
        BackendError::Transport("connection refused".into())
    }

    #[test]
    fn refresh_replaces_snapshot_and_recomputes() {
        let stub = seeded();
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        assert!(sync.is_loading());

        let outcome = sync.refresh_with(&stub, RefreshOrigin::Scheduled);
        assert!(matches!(outcome, RefreshOutcome::Applied { records: 3, .. }));
        assert!(!sync.is_loading());
        assert_eq!(sync.stats().total_personas, 6);
        assert_eq!(sync.stats().min_personas, 2);
        assert_eq!(sync.series().points().len(), 3);

        stub.delete_all().unwrap();
        sync.refresh_with(&stub, RefreshOrigin::Scheduled);
        assert!(sync.records().is_empty());
        assert_eq!(*sync.stats(), AggregateStats::default());
    }

    #[test]
    fn background_failure_is_silent_and_keeps_snapshot() {
        let stub = seeded();
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        sync.refresh_with(&stub, RefreshOrigin::Scheduled);
        stub.fail_next(StubOp::ListRecords, down());

        assert_eq!(
            sync.refresh_with(&stub, RefreshOrigin::Scheduled),
            RefreshOutcome::Retrying
        );
        assert_eq!(sync.records().len(), 3);
    }

    #[test]
    fn manual_failure_surfaces_without_mutation() {
        let stub = seeded();
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        sync.refresh_with(&stub, RefreshOrigin::Scheduled);
        let before = sync.view();
        stub.fail_next(StubOp::ListRecords, down());

        let RefreshOutcome::Failed(err) = sync.refresh_with(&stub, RefreshOrigin::Manual) else {
            panic!("manual refresh failure must surface");
        };
        assert_eq!(err.action, UserAction::Refresh);
        assert_eq!(sync.view(), before);
    }

    #[test]
    fn older_response_arriving_late_is_discarded() {
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        let old = sync.begin_refresh(RefreshOrigin::Scheduled);
        let new = sync.begin_refresh(RefreshOrigin::Manual);

        let mut fresh = record(1, 100.0);
        fresh.id = 2;
        assert!(matches!(
            sync.complete_refresh(new, Ok(vec![fresh.clone()])),
            RefreshOutcome::Applied { .. }
        ));
        assert_eq!(sync.complete_refresh(old, Ok(vec![])), RefreshOutcome::Stale);
        assert_eq!(sync.records(), &[fresh]);
    }

    #[test]
    fn older_failure_arriving_late_is_discarded() {
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        let old = sync.begin_refresh(RefreshOrigin::Manual);
        let new = sync.begin_refresh(RefreshOrigin::Scheduled);

        let mut fresh = record(1, 100.0);
        fresh.id = 5;
        sync.complete_refresh(new, Ok(vec![fresh.clone()]));
        assert_eq!(
            sync.complete_refresh(old, Err(down())),
            RefreshOutcome::Stale
        );
        assert_eq!(sync.records(), &[fresh]);
    }

    #[test]
    fn only_the_latest_request_clears_loading() {
        let stub = seeded();
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        sync.refresh_with(&stub, RefreshOrigin::Scheduled);

        let scheduled = sync.begin_refresh(RefreshOrigin::Scheduled);
        let after_delete = sync
            .complete_delete(UserAction::Delete, Ok(()))
            .expect("delete acknowledged");
        assert!(sync.is_loading());

        assert_eq!(
            sync.complete_refresh(scheduled, Err(down())),
            RefreshOutcome::Stale
        );
        assert!(sync.is_loading());

        assert!(matches!(
            sync.complete_refresh(after_delete, stub.list_records()),
            RefreshOutcome::Applied { .. }
        ));
        assert!(!sync.is_loading());
    }

    #[test]
    fn earlier_success_applies_but_keeps_loading_for_pending_request() {
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        let first = sync.begin_refresh(RefreshOrigin::Scheduled);
        let second = sync.begin_refresh(RefreshOrigin::Manual);

        sync.complete_refresh(first, Ok(vec![record(1, 100.0)]));
        assert_eq!(sync.records().len(), 1);
        assert!(sync.is_loading());

        let RefreshOutcome::Failed(err) = sync.complete_refresh(second, Err(down())) else {
            panic!("latest manual failure must surface");
        };
        assert_eq!(err.action, UserAction::Refresh);
        assert!(!sync.is_loading());
        assert_eq!(sync.records().len(), 1);
    }

    #[test]
    fn delete_refreshes_from_backend() {
        let stub = seeded();
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        sync.refresh_with(&stub, RefreshOrigin::Scheduled);
        let target = sync.records()[0].id;

        let outcome = sync.delete_with(&stub, target).expect("delete");
        assert!(matches!(
            outcome,
            RefreshOutcome::Applied {
                origin: RefreshOrigin::AfterDelete,
                records: 2,
                ..
            }
        ));
        assert!(sync.records().iter().all(|r| r.id != target));
        assert_eq!(stub.calls(StubOp::ListRecords), 2);
    }

    #[test]
    fn failed_delete_leaves_cache_untouched() {
        let stub = seeded();
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        sync.refresh_with(&stub, RefreshOrigin::Scheduled);
        stub.fail_next(StubOp::DeleteAll, down());

        let err = sync.delete_all_with(&stub).unwrap_err();
        assert_eq!(err.action, UserAction::DeleteAll);
        assert_eq!(sync.records().len(), 3);
        assert!(!sync.is_loading());
        assert_eq!(stub.calls(StubOp::ListRecords), 1);
    }

    #[test]
    fn open_detail_follows_record_by_id() {
        let stub = seeded();
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        sync.refresh_with(&stub, RefreshOrigin::Scheduled);
        let id = sync.records()[1].id;

        let detail = sync.open_detail_with(&stub, id).expect("detail");
        assert_eq!(detail.record.id, id);
        assert_eq!(detail.persons.len(), 0);

        // a newer record shifts positions; the detail stays on its id
        stub.insert(record(1, 0.0), vec![]);
        sync.refresh_with(&stub, RefreshOrigin::Scheduled);
        assert_eq!(sync.detail().map(|d| d.record.id), Some(id));

        stub.delete_record(id).unwrap();
        let outcome = sync.refresh_with(&stub, RefreshOrigin::Scheduled);
        assert!(matches!(
            outcome,
            RefreshOutcome::Applied {
                detail_closed: true,
                ..
            }
        ));
        assert!(sync.detail().is_none());
    }

    #[test]
    fn open_detail_keeps_person_count_in_step_with_record() {
        let stub = StubBackend::new();
        let id = stub.insert(record(2, 50.0), vec![person(1, true)]);
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        sync.refresh_with(&stub, RefreshOrigin::Scheduled);
        sync.open_detail_with(&stub, id).expect("detail");

        let mut grown = sync.records()[0].clone();
        grown.total_personas = 4;
        let ticket = sync.begin_refresh(RefreshOrigin::Scheduled);
        sync.complete_refresh(ticket, Ok(vec![grown]));
        let detail = sync.detail().expect("detail stays open");
        assert_eq!(detail.persons.len(), 4);
        assert!(!detail.persons[0].placeholder);
        assert_eq!(detail.synthesized_persons(), 3);

        let mut shrunk = detail.record.clone();
        shrunk.total_personas = 1;
        let ticket = sync.begin_refresh(RefreshOrigin::Scheduled);
        sync.complete_refresh(ticket, Ok(vec![shrunk]));
        let detail = sync.detail().expect("detail stays open");
        assert_eq!(detail.persons.len(), 1);
        assert!(detail.persons[0].tiene_casco);
        assert_eq!(detail.synthesized_persons(), 0);
    }

    #[test]
    fn detail_failure_does_not_open() {
        let stub = seeded();
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        let err = sync.open_detail_with(&stub, 99).unwrap_err();
        assert_eq!(err.action, UserAction::OpenDetail);
        assert!(sync.detail().is_none());
    }

    #[test]
    fn superseded_detail_response_is_dropped() {
        let stub = seeded();
        let mut sync = RecordSync::new(DEFAULT_SERIES_WINDOW);
        let first = sync.begin_detail(1);
        let second = sync.begin_detail(2);
        assert_eq!(
            sync.complete_detail(first, stub.record_detail(1)),
            DetailOutcome::Stale
        );
        assert_eq!(
            sync.complete_detail(second, stub.record_detail(2)),
            DetailOutcome::Opened(2)
        );
        assert_eq!(sync.detail().map(|d| d.record.id), Some(2));
    }

    #[test]
    fn user_error_renders_action_label() {
        let err = UserError::new(UserAction::Delete, "HTTP 500");
        assert_eq!(err.to_string(), "Error al eliminar registro: HTTP 500");
    }
}
