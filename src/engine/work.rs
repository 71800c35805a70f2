//! TaskAssignment status machine.
//!
//! ```text
//! pending ──> accepted ──> in_progress ──> completed
//!    │            │
//!    └────────────┴──> rejected
//! ```

use crate::limits::*;
use crate::model::*;
use ulid::Ulid;

use super::EngineError;

fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Accepted)
            | (Pending, Rejected)
            | (Accepted, InProgress)
            | (Accepted, Rejected)
            | (InProgress, Completed)
    )
}

pub(crate) fn validate_new_assignment(new: &NewAssignment) -> Result<(), EngineError> {
    if new.title.trim().is_empty() || new.title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("assignment title must be 1-200 characters"));
    }
    if new.description.len() > MAX_NOTES_LEN {
        return Err(EngineError::LimitExceeded("assignment description too long"));
    }
    Ok(())
}

/// Build a new `pending` task. Only super employees and admins delegate, and a
/// super employee only to one of `reports`, their direct subordinates.
pub fn plan_task_create(
    actor: &Actor,
    new: &NewAssignment,
    reports: &[Ulid],
    now: Ms,
) -> Result<TaskAssignment, EngineError> {
    if !actor.can_manage() {
        return Err(EngineError::PermissionDenied(
            "only a super employee may create assignments",
        ));
    }
    if !actor.is_admin() && !reports.contains(&new.assigned_to) {
        return Err(EngineError::PermissionDenied(
            "assignments go to direct subordinates only",
        ));
    }
    validate_new_assignment(new)?;
    Ok(TaskAssignment {
        id: new.id,
        assigned_by: actor.id,
        assigned_to: new.assigned_to,
        appointment_id: new.appointment_id,
        title: new.title.clone(),
        description: new.description.clone(),
        priority: new.priority,
        status: TaskStatus::Pending,
        assigned_at: now,
        due_at: new.due_at,
        accepted_at: None,
        started_at: None,
        completed_at: None,
        progress: 0,
        employee_notes: None,
        supervisor_notes: None,
    })
}

/// Plan an update. The assignee owns status, progress and employee notes; the
/// creator (or an admin) owns supervisor notes and nothing else.
pub fn plan_task_update(
    current: &TaskAssignment,
    actor: &Actor,
    update: AssignmentUpdate,
    now: Ms,
) -> Result<TaskAssignment, EngineError> {
    if update.touches_assignee_fields() && actor.id != current.assigned_to {
        return Err(EngineError::PermissionDenied(
            "only the assignee may change status, progress or employee notes",
        ));
    }
    if update.supervisor_notes.is_some() && actor.id != current.assigned_by && !actor.is_admin() {
        return Err(EngineError::PermissionDenied(
            "only the assigning supervisor may edit supervisor notes",
        ));
    }
    for notes in [&update.employee_notes, &update.supervisor_notes].into_iter().flatten() {
        if notes.len() > MAX_NOTES_LEN {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
    }

    let mut next = current.clone();

    if let Some(to) = update.status
        && to != current.status
    {
        if !transition_allowed(current.status, to) {
            return Err(EngineError::task_transition(current.status, to));
        }
        next.status = to;
        match to {
            TaskStatus::Accepted => {
                next.accepted_at.get_or_insert(now);
            }
            TaskStatus::InProgress => {
                next.started_at.get_or_insert(now);
            }
            TaskStatus::Completed => {
                next.completed_at.get_or_insert(now);
            }
            TaskStatus::Pending | TaskStatus::Rejected => {}
        }
    }

    if let Some(raw) = update.progress {
        if current.status.is_closed() {
            return Err(EngineError::task_transition(current.status, current.status));
        }
        next.progress = clamp_progress(raw);
    }
    if next.status == TaskStatus::Completed {
        next.progress = 100;
    }

    if update.employee_notes.is_some() {
        next.employee_notes = update.employee_notes;
    }
    if update.supervisor_notes.is_some() {
        next.supervisor_notes = update.supervisor_notes;
    }
    Ok(next)
}

/// Close a task because its appointment completed. Closed tasks are untouched.
pub(crate) fn complete_linked(task: &TaskAssignment, now: Ms) -> Option<TaskAssignment> {
    if task.status.is_closed() {
        return None;
    }
    let mut next = task.clone();
    next.status = TaskStatus::Completed;
    next.progress = 100;
    next.completed_at.get_or_insert(now);
    Some(next)
}
