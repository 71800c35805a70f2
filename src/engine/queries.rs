use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::calendar::{self, DayOccupancy};
use super::guard::{now_ms, today};
use super::{Engine, EngineError};

/// Per-employee counters derived from appointments in one pass.
#[derive(Default)]
struct WorkStats {
    pending: usize,
    /// Completions with both work timestamps; the only ones that count.
    completed: usize,
    duration_total: Ms,
}

impl Engine {
    /// Snapshot the occupant of each of the day's slots.
    pub async fn day_occupancy(&self, date: NaiveDate) -> DayOccupancy {
        let mut day = DayOccupancy::empty(date);
        for slot in TimeSlot::ALL {
            if let Some(rs) = self.get_slot(&SlotKey::new(date, slot)) {
                let guard = rs.read().await;
                day.set(slot, guard.occupant().cloned());
            }
        }
        day
    }

    pub async fn available_slots(&self, date: NaiveDate) -> Vec<TimeSlot> {
        let day = self.day_occupancy(date).await;
        calendar::available_slots(&day, today())
    }

    /// Per-slot detail for a date. `daily_summary` is the same view without
    /// the slot rows, so the two can never disagree.
    pub async fn daily_detail(&self, date: NaiveDate) -> DailyDetail {
        let day = self.day_occupancy(date).await;
        calendar::daily_detail(&day, |id| self.directory.service_name(&id))
    }

    pub async fn daily_summary(&self, date: NaiveDate) -> DailyDetail {
        let mut detail = self.daily_detail(date).await;
        detail.slots.clear();
        detail
    }

    pub async fn appointment(&self, id: &Ulid) -> Option<Appointment> {
        let rs = self.get_slot(&self.slot_for_appointment(id)?)?;
        let guard = rs.read().await;
        guard.get(id).cloned()
    }

    /// Appointments visible to `actor`, ordered by date, slot and creation.
    /// Customers only ever see their own.
    pub async fn list_appointments(&self, actor: &Actor, filter: AppointmentFilter) -> Vec<Appointment> {
        let states: Vec<_> = match filter {
            AppointmentFilter::Id(id) => self
                .slot_for_appointment(&id)
                .and_then(|key| self.get_slot(&key))
                .into_iter()
                .collect(),
            AppointmentFilter::Date(date) => TimeSlot::ALL
                .into_iter()
                .filter_map(|slot| self.get_slot(&SlotKey::new(date, slot)))
                .collect(),
            _ => self.slots.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            out.extend(guard.appointments.iter().filter(|a| matches_filter(a, &filter)).cloned());
        }
        if actor.role == Role::Customer {
            out.retain(|a| a.customer_id == actor.id);
        }
        out.sort_by(|a, b| (a.key, a.created_at).cmp(&(b.key, b.created_at)));
        out
    }

    /// Booked, unassigned appointments from today on: the pick-up list.
    pub async fn available_work(&self) -> Vec<Appointment> {
        let today = today();
        let states: Vec<_> = self
            .slots
            .iter()
            .filter(|e| e.key().date >= today)
            .map(|e| e.value().clone())
            .collect();
        let mut out = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            if let Some(a) = guard.occupant()
                && a.can_be_assigned()
            {
                out.push(a.clone());
            }
        }
        out.sort_by_key(|a| a.key);
        out
    }

    /// Tasks visible to `actor`: admins see all, employees see the ones they
    /// gave or received.
    pub async fn list_assignments(
        &self,
        actor: &Actor,
        filter: AssignmentFilter,
    ) -> Result<Vec<TaskAssignment>, EngineError> {
        if actor.role == Role::Customer {
            return Err(EngineError::PermissionDenied("assignments are staff-only"));
        }
        let shared: Vec<_> = match filter {
            AssignmentFilter::Id(id) => self.get_task(&id).into_iter().collect(),
            AssignmentFilter::Appointment(aid) => self
                .linked_tasks(&aid)
                .iter()
                .filter_map(|id| self.get_task(id))
                .collect(),
            _ => self.tasks.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for task in shared {
            let t = task.read().await;
            let visible = actor.is_admin() || t.assigned_to == actor.id || t.assigned_by == actor.id;
            let wanted = match filter {
                AssignmentFilter::AssignedTo(id) => t.assigned_to == id,
                AssignmentFilter::AssignedBy(id) => t.assigned_by == id,
                _ => true,
            };
            if visible && wanted {
                out.push(t.clone());
            }
        }
        out.sort_by_key(|t| (t.due_at, t.id));
        Ok(out)
    }

    async fn work_stats(&self) -> HashMap<Ulid, WorkStats> {
        let states: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut stats: HashMap<Ulid, WorkStats> = HashMap::new();
        for rs in states {
            let guard = rs.read().await;
            for a in &guard.appointments {
                let Some(emp) = a.assigned_employee else { continue };
                let s = stats.entry(emp).or_default();
                match a.status {
                    AppointmentStatus::Assigned | AppointmentStatus::InProgress | AppointmentStatus::OnHold => {
                        s.pending += 1
                    }
                    AppointmentStatus::Completed => {
                        if let Some(d) = a.work_duration() {
                            s.duration_total += d;
                            s.completed += 1;
                        }
                    }
                    AppointmentStatus::Booked | AppointmentStatus::Cancelled => {}
                }
            }
        }
        stats
    }

    /// Appointments assigned to the employee that are not yet finished.
    pub async fn pending_task_count(&self, employee_id: Ulid) -> usize {
        self.work_stats()
            .await
            .get(&employee_id)
            .map_or(0, |s| s.pending)
    }

    /// Employees with derived performance counters. `None` lists everyone.
    pub async fn employee_profiles(&self, only: Option<Ulid>) -> Vec<EmployeeProfile> {
        let employees = match only {
            Some(id) => self.directory.employee(&id).into_iter().collect(),
            None => self.directory.employees(),
        };
        let stats = self.work_stats().await;
        employees
            .into_iter()
            .map(|employee| {
                let s = stats.get(&employee.id);
                EmployeeProfile {
                    pending_tasks: s.map_or(0, |s| s.pending),
                    tasks_completed: s.map_or(0, |s| s.completed),
                    avg_completion_ms: s
                        .filter(|s| s.completed > 0)
                        .map(|s| s.duration_total / s.completed as Ms),
                    employee,
                }
            })
            .collect()
    }

    /// Supervisor dashboard: one row per active direct report.
    pub async fn workload(&self, actor: &Actor, supervisor_id: Ulid) -> Result<Vec<WorkloadRow>, EngineError> {
        if !actor.is_admin() && !(actor.role == Role::Supervisor && actor.id == supervisor_id) {
            return Err(EngineError::PermissionDenied(
                "only the supervisor or an admin may view this workload",
            ));
        }
        let supervisor = self
            .directory
            .employee(&supervisor_id)
            .ok_or(EngineError::NotFound(supervisor_id))?;

        let stats = self.work_stats().await;
        let now = now_ms();
        let mut open: HashMap<Ulid, (usize, usize)> = HashMap::new();
        let tasks: Vec<_> = self.tasks.iter().map(|e| e.value().clone()).collect();
        for task in tasks {
            let t = task.read().await;
            if t.status.is_closed() {
                continue;
            }
            let entry = open.entry(t.assigned_to).or_default();
            entry.0 += 1;
            if t.is_overdue(now) {
                entry.1 += 1;
            }
        }

        let mut rows: Vec<WorkloadRow> = self
            .directory
            .subordinates(&supervisor.id)
            .into_iter()
            .filter_map(|id| self.directory.employee(&id))
            .filter(|e| e.active)
            .map(|e| {
                let (open_assignments, overdue_assignments) = open.get(&e.id).copied().unwrap_or_default();
                WorkloadRow {
                    employee_id: e.id,
                    active_appointments: stats.get(&e.id).map_or(0, |s| s.pending),
                    open_assignments,
                    overdue_assignments,
                    code: e.code,
                    status: e.status,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(rows)
    }
}

fn matches_filter(a: &Appointment, filter: &AppointmentFilter) -> bool {
    match *filter {
        AppointmentFilter::All => true,
        AppointmentFilter::Id(id) => a.id == id,
        AppointmentFilter::Customer(id) => a.customer_id == id,
        AppointmentFilter::AssignedTo(id) => a.assigned_employee == Some(id),
        AppointmentFilter::Date(date) => a.key.date == date,
        AppointmentFilter::Status(status) => a.status == status,
    }
}
