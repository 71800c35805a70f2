pub mod calendar;
mod directory;
mod error;
mod guard;
pub mod lifecycle;
mod mutations;
mod queries;
pub mod work;
#[cfg(test)]
mod tests;

pub use calendar::DayOccupancy;
pub use directory::Directory;
pub use error::EngineError;
pub use lifecycle::{AppointmentAction, AppointmentChange};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;
pub type SharedTask = Arc<RwLock<TaskAssignment>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL file. Appends that arrive together share one fsync; any other
/// command first flushes whatever batch is open.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut deferred = None;
        match first {
            WalCommand::Append { event, response } => batch.push((event, response)),
            other => deferred = Some(other),
        }
        while deferred.is_none() {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => deferred = Some(other),
                Err(_) => break,
            }
        }
        if !batch.is_empty() {
            commit_batch(&mut wal, &mut batch);
        }
        if let Some(cmd) = deferred {
            run_command(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so the next batch starts clean.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn run_command(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Engine ───────────────────────────────────────────────

/// In-memory booking state, rebuilt from the WAL on startup.
///
/// Lock order is `compaction_gate` → slot → task. The slot lock is the
/// booking guard: whoever holds a slot's write lock decides its occupancy.
pub struct Engine {
    pub(super) slots: DashMap<SlotKey, SharedSlotState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// appointment id → the slot that stores it
    pub(super) appointment_index: DashMap<Ulid, SlotKey>,
    pub(super) tasks: DashMap<Ulid, SharedTask>,
    /// appointment id → ids of tasks that reference it
    pub(super) appointment_tasks: DashMap<Ulid, Vec<Ulid>>,
    pub directory: Directory,
    /// Held shared by every mutation, exclusively by compaction.
    pub(super) compaction_gate: RwLock<()>,
    pub(super) horizon_days: i64,
}

/// Plain state built during replay, before anything is shared.
#[derive(Default)]
struct Replayed {
    slots: HashMap<SlotKey, SlotState>,
    index: HashMap<Ulid, SlotKey>,
    tasks: HashMap<Ulid, TaskAssignment>,
}

impl Replayed {
    fn put_appointment(&mut self, appointment: &Appointment) {
        let key = appointment.key;
        self.slots
            .entry(key)
            .or_insert_with(|| SlotState::new(key))
            .upsert(appointment.clone());
        self.index.insert(appointment.id, key);
    }

    fn apply(&mut self, event: &Event, directory: &Directory) {
        match event {
            Event::ServiceRegistered { service } => directory.put_service(service.clone()),
            Event::EmployeeRegistered { employee } | Event::EmployeeUpdated { employee } => {
                directory.put_employee(employee.clone())
            }
            Event::AppointmentBooked { appointment } => self.put_appointment(appointment),
            Event::AppointmentChanged { appointment, tasks } => {
                self.put_appointment(appointment);
                for task in tasks {
                    self.tasks.insert(task.id, task.clone());
                }
            }
            Event::AppointmentPurged { id, key } => {
                if let Some(rs) = self.slots.get_mut(key) {
                    rs.remove(id);
                }
                self.index.remove(id);
            }
            Event::AssignmentCreated { task, appointment } => {
                if let Some(a) = appointment {
                    self.put_appointment(a);
                }
                self.tasks.insert(task.id, task.clone());
            }
            Event::AssignmentChanged { task } => {
                self.tasks.insert(task.id, task.clone());
            }
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, horizon_days: i64) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let directory = Directory::new();
        let mut replayed = Replayed::default();
        for event in &events {
            replayed.apply(event, &directory);
        }
        if !events.is_empty() {
            info!(
                events = events.len(),
                appointments = replayed.index.len(),
                assignments = replayed.tasks.len(),
                "replayed WAL"
            );
        }

        let engine = Self {
            slots: DashMap::new(),
            wal_tx,
            appointment_index: DashMap::new(),
            tasks: DashMap::new(),
            appointment_tasks: DashMap::new(),
            directory,
            compaction_gate: RwLock::new(()),
            horizon_days,
        };
        for (key, rs) in replayed.slots {
            engine.slots.insert(key, Arc::new(RwLock::new(rs)));
        }
        for (id, key) in replayed.index {
            engine.appointment_index.insert(id, key);
        }
        for (id, task) in replayed.tasks {
            if let Some(appointment_id) = task.appointment_id {
                engine.link_task(appointment_id, id);
            }
            engine.tasks.insert(id, Arc::new(RwLock::new(task)));
        }
        Ok(engine)
    }

    pub fn horizon_days(&self) -> i64 {
        self.horizon_days
    }

    /// Send one event to the group-commit writer and wait for the fsync.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| {
                warn!("WAL append failed: {e}");
                EngineError::WalError(e.to_string())
            })
    }

    /// Durably log an appointment-bearing event, then apply it to the slot the
    /// caller holds. Linked task post-images are applied by the caller.
    pub(super) async fn persist_and_apply(&self, rs: &mut SlotState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        match event {
            Event::AppointmentBooked { appointment }
            | Event::AppointmentChanged { appointment, .. }
            | Event::AssignmentCreated {
                appointment: Some(appointment),
                ..
            } => {
                rs.upsert(appointment.clone());
                self.appointment_index.insert(appointment.id, appointment.key);
            }
            Event::AppointmentPurged { id, .. } => {
                rs.remove(id);
                self.appointment_index.remove(id);
                self.appointment_tasks.remove(id);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn get_slot(&self, key: &SlotKey) -> Option<SharedSlotState> {
        self.slots.get(key).map(|e| e.value().clone())
    }

    /// The shared state for `key`, created empty on first use.
    pub(super) fn slot_or_create(&self, key: SlotKey) -> SharedSlotState {
        self.slots
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(SlotState::new(key))))
            .clone()
    }

    pub fn slot_for_appointment(&self, id: &Ulid) -> Option<SlotKey> {
        self.appointment_index.get(id).map(|e| *e.value())
    }

    /// Resolve appointment → slot and take the slot's write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let key = self.slot_for_appointment(id).ok_or(EngineError::NotFound(*id))?;
        let rs = self.get_slot(&key).ok_or(EngineError::NotFound(*id))?;
        let guard = rs.write_owned().await;
        if guard.get(id).is_none() {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    pub fn get_task(&self, id: &Ulid) -> Option<SharedTask> {
        self.tasks.get(id).map(|e| e.value().clone())
    }

    pub(super) fn link_task(&self, appointment_id: Ulid, task_id: Ulid) {
        let mut ids = self.appointment_tasks.entry(appointment_id).or_default();
        if !ids.contains(&task_id) {
            ids.push(task_id);
        }
    }

    pub(super) fn linked_tasks(&self, appointment_id: &Ulid) -> Vec<Ulid> {
        self.appointment_tasks
            .get(appointment_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
