use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{Backend, BackendError, CommandAck};
use crate::record::{reconcile_persons, DetectionRecord, PersonDetection, RecordDetail, RecordId};
use crate::session::ReportedStatus;

/// Operations the stub can count, delay and fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StubOp {
    ListRecords,
    RecordDetail,
    DeleteRecord,
    DeleteAll,
    SessionStatus,
    StartSession,
    StopSession,
}

struct StoredRecord {
    record: DetectionRecord,
    detections: Vec<PersonDetection>,
}

#[derive(Default)]
struct StubState {
    // newest first, like the deployed API
    records: Vec<StoredRecord>,
    next_id: RecordId,
    running: bool,
    calls: HashMap<StubOp, usize>,
    failures: HashMap<StubOp, VecDeque<BackendError>>,
    delays: HashMap<StubOp, Duration>,
    feed: Option<StdRng>,
}

/// In-memory backend for local runs and tests.
#[derive(Default)]
pub struct StubBackend {
    state: Mutex<StubState>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While the session runs, every list call first records one synthetic
    /// detection, so a local run shows a live feed.
    pub fn with_synthetic_feed(self, seed: u64) -> Self {
        self.lock().feed = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Stores a record under the next id and returns that id. `detections`
    /// may disagree with `total_personas`; detail requests reconcile them.
    pub fn insert(
        &self,
        mut record: DetectionRecord,
        detections: Vec<PersonDetection>,
    ) -> RecordId {
        let mut state = self.lock();
        state.next_id += 1;
        record.id = state.next_id;
        let id = record.id;
        state.records.insert(0, StoredRecord { record, detections });
        id
    }

    pub fn set_running(&self, running: bool) {
        self.lock().running = running;
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    /// The next call of `op` fails with `err`. Queued failures are consumed
    /// in order.
    pub fn fail_next(&self, op: StubOp, err: BackendError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    pub fn set_delay(&self, op: StubOp, delay: Duration) {
        self.lock().delays.insert(op, delay);
    }

    pub fn calls(&self, op: StubOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // counts the call, sleeps without holding the lock, then pops a failure
    fn enter(&self, op: StubOp) -> Result<(), BackendError> {
        let delay = {
            let mut state = self.lock();
            *state.calls.entry(op).or_default() += 1;
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        match self.lock().failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Backend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn list_records(&self) -> Result<Vec<DetectionRecord>, BackendError> {
        self.enter(StubOp::ListRecords)?;
        let mut state = self.lock();
        if state.running {
            if let Some(mut rng) = state.feed.take() {
                let (mut record, detections) = synthetic_record(&mut rng);
                state.feed = Some(rng);
                state.next_id += 1;
                record.id = state.next_id;
                state.records.insert(0, StoredRecord { record, detections });
            }
        }
        Ok(state.records.iter().map(|s| s.record.clone()).collect())
    }

    fn record_detail(&self, id: RecordId) -> Result<RecordDetail, BackendError> {
        self.enter(StubOp::RecordDetail)?;
        let state = self.lock();
        let stored = state
            .records
            .iter()
            .find(|s| s.record.id == id)
            .ok_or_else(|| BackendError::NotFound("Registro no encontrado".into()))?;
        Ok(RecordDetail {
            record: stored.record.clone(),
            persons: reconcile_persons(stored.record.total_personas, stored.detections.clone()),
        })
    }

    fn delete_record(&self, id: RecordId) -> Result<(), BackendError> {
        self.enter(StubOp::DeleteRecord)?;
        let mut state = self.lock();
        let before = state.records.len();
        state.records.retain(|s| s.record.id != id);
        if state.records.len() == before {
            return Err(BackendError::NotFound("Registro no encontrado".into()));
        }
        Ok(())
    }

    fn delete_all(&self) -> Result<(), BackendError> {
        self.enter(StubOp::DeleteAll)?;
        let mut state = self.lock();
        log::info!("stub backend: deleting {} records", state.records.len());
        state.records.clear();
        Ok(())
    }

    fn session_status(&self) -> Result<ReportedStatus, BackendError> {
        self.enter(StubOp::SessionStatus)?;
        Ok(if self.lock().running {
            ReportedStatus::Running
        } else {
            ReportedStatus::Stopped
        })
    }

    fn start_session(&self) -> Result<CommandAck, BackendError> {
        self.enter(StubOp::StartSession)?;
        let mut state = self.lock();
        if state.running {
            return Ok(CommandAck::AlreadyRunning);
        }
        state.running = true;
        Ok(CommandAck::Done)
    }

    fn stop_session(&self) -> Result<CommandAck, BackendError> {
        self.enter(StubOp::StopSession)?;
        let mut state = self.lock();
        if !state.running {
            return Ok(CommandAck::NotRunning);
        }
        state.running = false;
        Ok(CommandAck::Done)
    }
}

fn synthetic_record(rng: &mut StdRng) -> (DetectionRecord, Vec<PersonDetection>) {
    let personas: u32 = rng.gen_range(0..=4);
    let mut with = [0u32; 3];
    let detections: Vec<PersonDetection> = (1..=personas)
        .map(|numero| {
            let flags = [rng.gen_bool(0.8), rng.gen_bool(0.6), rng.gen_bool(0.4)];
            for (count, flag) in with.iter_mut().zip(flags) {
                *count += flag as u32;
            }
            PersonDetection {
                numero_persona: numero,
                tiene_casco: flags[0],
                tiene_chaleco: flags[1],
                tiene_gafas: flags[2],
                placeholder: false,
            }
        })
        .collect();
    let pct = |n: u32| {
        if personas == 0 {
            0.0
        } else {
            (n as f64 * 1000.0 / personas as f64).round() / 10.0
        }
    };
    let (cascos, chalecos, gafas) = (pct(with[0]), pct(with[1]), pct(with[2]));
    let record = DetectionRecord {
        id: 0,
        timestamp: Some(
            chrono::Local::now()
                .naive_local()
                .format("%Y-%m-%dT%H:%M:%S")
                .to_string(),
        ),
        total_personas: personas,
        cumplimiento_cascos: cascos,
        cumplimiento_chalecos: chalecos,
        cumplimiento_gafas: gafas,
        cumplimiento_general: ((cascos + chalecos + gafas) / 3.0 * 10.0).round() / 10.0,
        ruta_imagen: None,
    };
    (record, detections)
}
