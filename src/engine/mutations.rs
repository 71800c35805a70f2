use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{APPOINTMENTS_PURGED_TOTAL, BOOKINGS_TOTAL};

use super::guard::{check_slot_free, now_ms, today, validate_booking_window, validate_notes, validate_vehicle};
use super::lifecycle::{self, AppointmentAction, AppointmentChange};
use super::work;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Directory ────────────────────────────────────────────

    /// Register or replace a catalog entry. Re-registering with
    /// `active = false` withdraws the service from booking.
    pub async fn register_service(&self, actor: &Actor, service: Service) -> Result<(), EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::PermissionDenied("only an admin may register services"));
        }
        if service.name.trim().is_empty() || service.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name must be 1-200 characters"));
        }
        if let Some(d) = service.estimated_duration
            && !(1..=MAX_SERVICE_DURATION_MS).contains(&d)
        {
            return Err(EngineError::LimitExceeded("service duration out of range"));
        }

        let _gate = self.compaction_gate.read().await;
        let _dir = self.directory.write_lock.lock().await;
        if self.directory.service(&service.id).is_none() && self.directory.service_count() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }

        let event = Event::ServiceRegistered { service: service.clone() };
        self.wal_append(&event).await?;
        info!(service = %service.id, name = %service.name, active = service.active, "service registered");
        self.directory.put_service(service);
        Ok(())
    }

    pub async fn register_employee(&self, actor: &Actor, employee: Employee) -> Result<(), EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::PermissionDenied("only an admin may register employees"));
        }
        if employee.code.trim().is_empty() || employee.code.len() > MAX_CODE_LEN {
            return Err(EngineError::LimitExceeded("employee code must be 1-20 characters"));
        }
        if employee.specialization.as_ref().is_some_and(|s| s.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("specialization too long"));
        }
        if employee.rating_centi > MAX_RATING_CENTI {
            return Err(EngineError::LimitExceeded("rating must be between 0 and 5"));
        }

        let _gate = self.compaction_gate.read().await;
        let _dir = self.directory.write_lock.lock().await;
        if self.directory.employee_count() >= MAX_EMPLOYEES {
            return Err(EngineError::LimitExceeded("too many employees"));
        }
        if self.directory.employee(&employee.id).is_some() {
            return Err(EngineError::AlreadyExists(employee.id.to_string()));
        }
        if self.directory.code_taken(&employee.code) {
            return Err(EngineError::AlreadyExists(format!("employee code {}", employee.code)));
        }
        if let Some(sup) = employee.supervisor_id {
            self.directory.validate_supervisor(employee.id, sup)?;
        }

        let event = Event::EmployeeRegistered { employee: employee.clone() };
        self.wal_append(&event).await?;
        info!(employee = %employee.id, code = %employee.code, kind = employee.kind.as_str(), "employee registered");
        self.directory.put_employee(employee);
        Ok(())
    }

    /// Status may be set by the employee, their super-employee supervisor or
    /// an admin. Everything else needs a super employee or admin.
    pub async fn update_employee(&self, actor: &Actor, id: Ulid, patch: EmployeePatch) -> Result<Employee, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let _dir = self.directory.write_lock.lock().await;
        let current = self.directory.employee(&id).ok_or(EngineError::NotFound(id))?;

        if patch.touches_managed_fields() && !actor.can_manage() {
            return Err(EngineError::PermissionDenied(
                "only a super employee may change activation, supervisor or rating",
            ));
        }
        if patch.status.is_some() {
            let supervises = actor.role == Role::Supervisor && current.supervisor_id == Some(actor.id);
            if !(actor.is_admin() || actor.id == id || supervises) {
                return Err(EngineError::PermissionDenied(
                    "only the employee or their supervisor may change status",
                ));
            }
        }
        if let Some(Some(sup)) = patch.supervisor_id {
            self.directory.validate_supervisor(id, sup)?;
        }
        if patch.rating_centi.is_some_and(|r| r > MAX_RATING_CENTI) {
            return Err(EngineError::LimitExceeded("rating must be between 0 and 5"));
        }

        let mut next = current.clone();
        if let Some(s) = patch.status {
            next.status = s;
        }
        if let Some(a) = patch.active {
            next.active = a;
        }
        if let Some(sup) = patch.supervisor_id {
            next.supervisor_id = sup;
        }
        if let Some(r) = patch.rating_centi {
            next.rating_centi = r;
        }
        if next == current {
            return Ok(next);
        }

        let event = Event::EmployeeUpdated { employee: next.clone() };
        self.wal_append(&event).await?;
        self.directory.put_employee(next.clone());
        Ok(next)
    }

    // ── Booking guard ────────────────────────────────────────

    /// Reserve a (date, slot) for a customer. Check and insert happen under the
    /// slot's write lock, so concurrent requests for one key serialize.
    pub async fn book_appointment(&self, actor: &Actor, req: BookingRequest) -> Result<Appointment, EngineError> {
        let key = req.key;
        let result = self.try_book(actor, req).await;
        let outcome = match &result {
            Ok(_) => "booked",
            Err(EngineError::SlotOccupied(_)) => "slot_occupied",
            Err(_) => "rejected",
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        match &result {
            Ok(a) => info!(appointment = %a.id, customer = %a.customer_id, slot = %key, "appointment booked"),
            Err(e) => debug!(slot = %key, "booking refused: {e}"),
        }
        result
    }

    async fn try_book(&self, actor: &Actor, req: BookingRequest) -> Result<Appointment, EngineError> {
        if actor.role != Role::Customer {
            return Err(EngineError::PermissionDenied("only customers book appointments"));
        }
        validate_booking_window(&req.key, today(), self.horizon_days)?;
        validate_vehicle(&req.vehicle)?;
        validate_notes(req.notes.as_deref())?;
        let service = self
            .directory
            .service(&req.service_id)
            .ok_or(EngineError::NotFound(req.service_id))?;
        if !service.active {
            return Err(EngineError::ServiceInactive(service.id));
        }

        let _gate = self.compaction_gate.read().await;

        // Claim the id first so a replayed request cannot book twice.
        match self.appointment_index.entry(req.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(req.id.to_string())),
            Entry::Vacant(v) => {
                v.insert(req.key);
            }
        }

        let rs = self.slot_or_create(req.key);
        let mut guard = rs.write().await;
        let result = match check_slot_free(&guard) {
            Ok(()) => {
                let appointment = Appointment {
                    id: req.id,
                    customer_id: actor.id,
                    service_id: req.service_id,
                    key: req.key,
                    status: AppointmentStatus::Booked,
                    priority: req.priority,
                    assigned_employee: None,
                    vehicle: req.vehicle,
                    notes: req.notes,
                    work_notes: None,
                    created_at: now_ms(),
                    work_started_at: None,
                    work_completed_at: None,
                    estimated_completion: None,
                };
                let event = Event::AppointmentBooked { appointment: appointment.clone() };
                self.persist_and_apply(&mut guard, &event).await.map(|()| appointment)
            }
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.appointment_index.remove(&req.id);
        }
        result
    }

    // ── Appointment lifecycle ────────────────────────────────

    /// Apply a transition and/or annotation. Completing an appointment also
    /// closes every open task linked to it, in the same event.
    pub async fn change_appointment(
        &self,
        actor: &Actor,
        id: Ulid,
        change: AppointmentChange,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_appointment_write(&id).await?;
        let current = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if change.is_empty() {
            return Ok(current);
        }

        let action = change.action;
        let duration = self
            .directory
            .service(&current.service_id)
            .and_then(|s| s.estimated_duration);
        let now = now_ms();
        let next = lifecycle::plan_change(&current, actor, change, now, duration)?;
        if let Some(AppointmentAction::Assign { employee }) = action {
            self.directory.assignable(&employee)?;
        }

        let mut task_guards = Vec::new();
        let mut closed = Vec::new();
        if next.status == AppointmentStatus::Completed && current.status != AppointmentStatus::Completed {
            let mut ids = self.linked_tasks(&id);
            ids.sort();
            for task_id in ids {
                let Some(task) = self.get_task(&task_id) else { continue };
                let task_guard = task.write_owned().await;
                if let Some(done) = work::complete_linked(&task_guard, now) {
                    closed.push(done);
                    task_guards.push(task_guard);
                }
            }
        }

        let event = Event::AppointmentChanged {
            appointment: next.clone(),
            tasks: closed.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        for (task_guard, done) in task_guards.iter_mut().zip(closed) {
            **task_guard = done;
        }

        if next.status != current.status {
            info!(
                appointment = %id,
                from = current.status.as_str(),
                to = next.status.as_str(),
                actor = %actor.id,
                "appointment status changed"
            );
        }
        Ok(next)
    }

    pub async fn transition_appointment(
        &self,
        actor: &Actor,
        id: Ulid,
        action: AppointmentAction,
    ) -> Result<Appointment, EngineError> {
        let change = AppointmentChange {
            action: Some(action),
            ..Default::default()
        };
        self.change_appointment(actor, id, change).await
    }

    /// Move an appointment to a target status, with optional annotations.
    /// `assigned` without an employee means the caller picks the work up.
    /// `cancelled` routes to cancellation and ignores annotations.
    pub async fn update_appointment(
        &self,
        actor: &Actor,
        id: Ulid,
        update: AppointmentUpdate,
    ) -> Result<Appointment, EngineError> {
        let action = match update.status {
            None => update
                .assigned_employee
                .map(|employee| AppointmentAction::Assign { employee }),
            Some(AppointmentStatus::Assigned) => {
                let employee = match update.assigned_employee {
                    Some(e) => e,
                    None if actor.is_staff() => actor.id,
                    None => return Err(EngineError::LimitExceeded("assigned_employee is required")),
                };
                Some(AppointmentAction::Assign { employee })
            }
            Some(AppointmentStatus::InProgress) => Some(AppointmentAction::Start),
            Some(AppointmentStatus::Completed) => Some(AppointmentAction::Complete),
            Some(AppointmentStatus::OnHold) => Some(AppointmentAction::Hold),
            Some(AppointmentStatus::Cancelled) => return self.cancel_appointment(actor, id).await,
            Some(AppointmentStatus::Booked) => {
                let current = self.appointment(&id).await.ok_or(EngineError::NotFound(id))?;
                return Err(EngineError::appointment_transition(
                    current.status,
                    AppointmentStatus::Booked,
                ));
            }
        };
        let change = AppointmentChange {
            action,
            priority: update.priority,
            work_notes: update.work_notes,
        };
        self.change_appointment(actor, id, change).await
    }

    /// Cancel a `booked` appointment. The record is kept with status
    /// `cancelled` and the slot is free for the next booking.
    pub async fn cancel_appointment(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_appointment_write(&id).await?;
        let current = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        let next = lifecycle::plan_cancel(&current, actor, today())?;

        let event = Event::AppointmentChanged {
            appointment: next.clone(),
            tasks: Vec::new(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(appointment = %id, slot = %next.key, "appointment cancelled");
        Ok(next)
    }

    // ── Work assignments ─────────────────────────────────────

    /// Delegate a task. With an appointment reference the appointment is
    /// assigned to the same employee in the same event.
    pub async fn create_assignment(&self, actor: &Actor, new: NewAssignment) -> Result<TaskAssignment, EngineError> {
        let reports = self.directory.subordinates(&actor.id);
        let task = work::plan_task_create(actor, &new, &reports, now_ms())?;
        self.directory.assignable(&new.assigned_to)?;

        let _gate = self.compaction_gate.read().await;

        // Claim the id before persisting; the held write lock keeps the
        // unpersisted task from readers and updaters.
        let shared = Arc::new(RwLock::new(task.clone()));
        let held = shared.clone().write_owned().await;
        match self.tasks.entry(task.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(task.id.to_string())),
            Entry::Vacant(v) => {
                v.insert(shared);
            }
        }

        let result = self.persist_new_assignment(&task).await;
        if result.is_err() {
            self.tasks.remove(&task.id);
        }
        drop(held);
        result?;

        info!(
            assignment = %task.id,
            by = %task.assigned_by,
            to = %task.assigned_to,
            "assignment created"
        );
        Ok(task)
    }

    async fn persist_new_assignment(&self, task: &TaskAssignment) -> Result<(), EngineError> {
        let Some(appointment_id) = task.appointment_id else {
            self.wal_append(&Event::AssignmentCreated {
                task: task.clone(),
                appointment: None,
            })
            .await?;
            return Ok(());
        };

        let mut guard = self.resolve_appointment_write(&appointment_id).await?;
        let current = guard
            .get(&appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))?;
        let linked = if current.can_be_assigned() {
            let mut next = current.clone();
            next.assigned_employee = Some(task.assigned_to);
            next.status = AppointmentStatus::Assigned;
            Some(next)
        } else if current.status.is_active() && current.is_assigned_to(task.assigned_to) {
            None
        } else {
            return Err(EngineError::appointment_transition(
                current.status,
                AppointmentStatus::Assigned,
            ));
        };
        let event = Event::AssignmentCreated {
            task: task.clone(),
            appointment: linked,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        self.link_task(appointment_id, task.id);
        Ok(())
    }

    pub async fn update_assignment(
        &self,
        actor: &Actor,
        id: Ulid,
        update: AssignmentUpdate,
    ) -> Result<TaskAssignment, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let task = self.get_task(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = task.write().await;
        // A create that failed to persist has already released its claim.
        if !self.tasks.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let next = work::plan_task_update(&guard, actor, update, now_ms())?;
        if next == *guard {
            return Ok(next);
        }

        self.wal_append(&Event::AssignmentChanged { task: next.clone() }).await?;
        if next.status != guard.status {
            debug!(
                assignment = %id,
                from = guard.status.as_str(),
                to = next.status.as_str(),
                "assignment status changed"
            );
        }
        *guard = next.clone();
        Ok(next)
    }

    // ── Retention & compaction ───────────────────────────────

    /// Terminal appointments on dates before `cutoff`.
    pub async fn collect_purgeable(&self, cutoff: NaiveDate) -> Vec<(Ulid, SlotKey)> {
        let states: Vec<_> = self
            .slots
            .iter()
            .filter(|e| e.key().date < cutoff)
            .map(|e| e.value().clone())
            .collect();
        let mut out = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            out.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| a.status.is_terminal())
                    .map(|a| (a.id, a.key)),
            );
        }
        out
    }

    /// Drop cancelled and completed appointments dated before `cutoff`.
    /// Active appointments are never touched.
    pub async fn purge_appointments(&self, cutoff: NaiveDate) -> Result<usize, EngineError> {
        let mut purged = 0usize;
        for (id, key) in self.collect_purgeable(cutoff).await {
            let _gate = self.compaction_gate.read().await;
            let Some(rs) = self.get_slot(&key) else { continue };
            let mut guard = rs.write().await;
            if !guard.get(&id).is_some_and(|a| a.status.is_terminal()) {
                continue;
            }
            self.persist_and_apply(&mut guard, &Event::AppointmentPurged { id, key })
                .await?;
            purged += 1;
        }
        // Past dates can never be booked again, so empty states can go.
        self.slots.retain(|key, rs| {
            key.date >= cutoff || rs.try_read().map_or(true, |g| !g.appointments.is_empty())
        });
        if purged > 0 {
            metrics::counter!(APPOINTMENTS_PURGED_TOTAL).increment(purged as u64);
        }
        Ok(purged)
    }

    /// Rewrite the WAL as the minimal event set for the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let mut events: Vec<Event> = self
            .directory
            .services()
            .into_iter()
            .map(|service| Event::ServiceRegistered { service })
            .collect();
        events.extend(
            self.directory
                .employees()
                .into_iter()
                .map(|employee| Event::EmployeeRegistered { employee }),
        );

        let states: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        for rs in states {
            let guard = rs.read().await;
            events.extend(
                guard
                    .appointments
                    .iter()
                    .cloned()
                    .map(|appointment| Event::AppointmentBooked { appointment }),
            );
        }

        let tasks: Vec<_> = self.tasks.iter().map(|e| e.value().clone()).collect();
        for task in tasks {
            let task = task.read().await.clone();
            events.push(Event::AssignmentCreated { task, appointment: None });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }
}
