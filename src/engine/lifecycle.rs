//! Appointment state machine. Every function here takes the current record
//! and returns the post-image; nothing is applied until the caller persists it.

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::guard::validate_notes;
use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentAction {
    /// `booked -> assigned`, or resume `on_hold -> assigned`.
    Assign { employee: Ulid },
    /// `assigned -> in_progress`, or resume `on_hold -> in_progress`.
    Start,
    Complete,
    Hold,
}

impl AppointmentAction {
    pub fn target(self) -> AppointmentStatus {
        match self {
            AppointmentAction::Assign { .. } => AppointmentStatus::Assigned,
            AppointmentAction::Start => AppointmentStatus::InProgress,
            AppointmentAction::Complete => AppointmentStatus::Completed,
            AppointmentAction::Hold => AppointmentStatus::OnHold,
        }
    }
}

/// One write against an appointment: an optional transition plus optional
/// annotations, applied together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentChange {
    pub action: Option<AppointmentAction>,
    pub priority: Option<Priority>,
    pub work_notes: Option<String>,
}

impl AppointmentChange {
    pub fn is_empty(&self) -> bool {
        self.action.is_none() && self.priority.is_none() && self.work_notes.is_none()
    }
}

/// Plan a status transition. Checks run in a fixed order: caller role,
/// status guard, then assignee.
pub fn plan_transition(
    current: &Appointment,
    actor: &Actor,
    action: AppointmentAction,
    now: Ms,
    service_duration: Option<Ms>,
) -> Result<Appointment, EngineError> {
    if actor.role == Role::Customer {
        return Err(EngineError::PermissionDenied(
            "customers cannot change work status",
        ));
    }

    let mut next = current.clone();
    let reject = || EngineError::appointment_transition(current.status, action.target());

    match action {
        AppointmentAction::Assign { employee } => {
            let resuming = current.status == AppointmentStatus::OnHold;
            if !resuming && !current.can_be_assigned() {
                return Err(reject());
            }
            let reassigning = current.assigned_employee.is_some_and(|e| e != employee);
            if (employee != actor.id || reassigning) && !actor.can_manage() {
                if resuming && !current.is_assigned_to(actor.id) {
                    return Err(EngineError::NotAssigned(current.id));
                }
                return Err(EngineError::PermissionDenied(
                    "only a super employee may assign work to others",
                ));
            }
            next.assigned_employee = Some(employee);
            next.status = AppointmentStatus::Assigned;
        }
        AppointmentAction::Start => {
            if !current.can_start_work() || current.status == AppointmentStatus::Booked {
                return Err(reject());
            }
            let resuming = current.status == AppointmentStatus::OnHold;
            let allowed = current.is_assigned_to(actor.id) || (resuming && actor.can_manage());
            if !allowed {
                return Err(EngineError::NotAssigned(current.id));
            }
            next.status = AppointmentStatus::InProgress;
            if next.work_started_at.is_none() {
                next.work_started_at = Some(now);
                next.estimated_completion = service_duration.map(|d| now + d);
            }
        }
        AppointmentAction::Complete => {
            if !current.can_complete_work() {
                return Err(reject());
            }
            if !current.is_assigned_to(actor.id) {
                return Err(EngineError::NotAssigned(current.id));
            }
            next.status = AppointmentStatus::Completed;
            next.work_completed_at = Some(match current.work_started_at {
                Some(start) => now.max(start),
                None => now,
            });
        }
        AppointmentAction::Hold => {
            if !matches!(
                current.status,
                AppointmentStatus::Assigned | AppointmentStatus::InProgress
            ) {
                return Err(reject());
            }
            if !current.is_assigned_to(actor.id) && !actor.can_manage() {
                return Err(EngineError::NotAssigned(current.id));
            }
            next.status = AppointmentStatus::OnHold;
        }
    }
    Ok(next)
}

/// Plan priority and work-note edits. Work notes belong to the assignee or a
/// manager; priority can only move while the appointment is active.
pub fn plan_annotate(
    current: &Appointment,
    actor: &Actor,
    priority: Option<Priority>,
    work_notes: Option<String>,
) -> Result<Appointment, EngineError> {
    if !actor.can_manage() && !current.is_assigned_to(actor.id) {
        return Err(match actor.role {
            Role::Customer => EngineError::PermissionDenied("customers cannot edit work details"),
            _ => EngineError::NotAssigned(current.id),
        });
    }
    validate_notes(work_notes.as_deref())?;
    let mut next = current.clone();
    if let Some(p) = priority {
        if current.status.is_terminal() {
            return Err(EngineError::appointment_transition(current.status, current.status));
        }
        next.priority = p;
    }
    if work_notes.is_some() {
        next.work_notes = work_notes;
    }
    Ok(next)
}

/// Plan a full change: transition first, then annotations on the result.
pub fn plan_change(
    current: &Appointment,
    actor: &Actor,
    change: AppointmentChange,
    now: Ms,
    service_duration: Option<Ms>,
) -> Result<Appointment, EngineError> {
    let base = match change.action {
        Some(action) => plan_transition(current, actor, action, now, service_duration)?,
        None => current.clone(),
    };
    if change.priority.is_none() && change.work_notes.is_none() {
        return Ok(base);
    }
    plan_annotate(&base, actor, change.priority, change.work_notes)
}

/// Only the owning customer or an admin may cancel, and only a `booked`
/// appointment whose date has not passed.
pub fn plan_cancel(
    current: &Appointment,
    actor: &Actor,
    today: NaiveDate,
) -> Result<Appointment, EngineError> {
    if !actor.is_admin() && current.customer_id != actor.id {
        return Err(EngineError::PermissionDenied(
            "only the booking customer or an admin may cancel",
        ));
    }
    if current.status != AppointmentStatus::Booked || current.key.date < today {
        return Err(EngineError::NotCancellable {
            id: current.id,
            status: current.status,
        });
    }
    let mut next = current.clone();
    next.status = AppointmentStatus::Cancelled;
    Ok(next)
}
