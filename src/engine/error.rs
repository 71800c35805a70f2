use ulid::Ulid;

use crate::model::{AppointmentStatus, SlotKey, TaskStatus};

#[derive(Debug)]
pub enum EngineError {
    /// Another active appointment already holds this slot.
    SlotOccupied(SlotKey),
    PastDate(SlotKey),
    HorizonExceeded {
        key: SlotKey,
        horizon_days: i64,
    },
    InvalidSlot(String),
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    NotAssigned(Ulid),
    NotCancellable {
        id: Ulid,
        status: AppointmentStatus,
    },
    PermissionDenied(&'static str),
    NotFound(Ulid),
    AlreadyExists(String),
    CycleDetected(Ulid),
    InvalidSupervisor(Ulid),
    EmployeeInactive(Ulid),
    ServiceInactive(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn appointment_transition(from: AppointmentStatus, to: AppointmentStatus) -> Self {
        EngineError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        }
    }

    pub fn task_transition(from: TaskStatus, to: TaskStatus) -> Self {
        EngineError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotOccupied(key) => write!(
                f,
                "time slot {} on {} is already booked",
                key.slot.label(),
                key.date
            ),
            EngineError::PastDate(key) => {
                write!(f, "cannot book {}: date is in the past", key.date)
            }
            EngineError::HorizonExceeded { key, horizon_days } => write!(
                f,
                "cannot book {}: more than {horizon_days} days ahead",
                key.date
            ),
            EngineError::InvalidSlot(raw) => write!(f, "invalid time slot: {raw}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::NotAssigned(id) => {
                write!(f, "caller is not the assigned employee of {id}")
            }
            EngineError::NotCancellable { id, status } => write!(
                f,
                "appointment {id} cannot be cancelled in status {}",
                status.as_str()
            ),
            EngineError::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::CycleDetected(id) => {
                write!(f, "supervisor cycle detected at employee: {id}")
            }
            EngineError::InvalidSupervisor(id) => {
                write!(f, "employee {id} cannot act as a supervisor")
            }
            EngineError::EmployeeInactive(id) => write!(f, "employee {id} is inactive"),
            EngineError::ServiceInactive(id) => write!(f, "service {id} is not bookable"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
