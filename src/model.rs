use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only timestamp type.
pub type Ms = i64;

// ── Slots ────────────────────────────────────────────────────

/// One of the five fixed daily time points, shared by every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimeSlot {
    At0900,
    At1100,
    At1300,
    At1500,
    At1700,
}

impl TimeSlot {
    /// All slots in ascending time order.
    pub const ALL: [TimeSlot; 5] = [
        TimeSlot::At0900,
        TimeSlot::At1100,
        TimeSlot::At1300,
        TimeSlot::At1500,
        TimeSlot::At1700,
    ];

    pub fn code(self) -> &'static str {
        match self {
            TimeSlot::At0900 => "09:00",
            TimeSlot::At1100 => "11:00",
            TimeSlot::At1300 => "13:00",
            TimeSlot::At1500 => "15:00",
            TimeSlot::At1700 => "17:00",
        }
    }

    /// Human-facing label, e.g. `"1:00 PM"`.
    pub fn label(self) -> &'static str {
        match self {
            TimeSlot::At0900 => "9:00 AM",
            TimeSlot::At1100 => "11:00 AM",
            TimeSlot::At1300 => "1:00 PM",
            TimeSlot::At1500 => "3:00 PM",
            TimeSlot::At1700 => "5:00 PM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        TimeSlot::ALL.into_iter().find(|slot| slot.code() == s.trim())
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// The unit of exclusivity: at most one active appointment per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub slot: TimeSlot,
}

impl SlotKey {
    pub fn new(date: NaiveDate, slot: TimeSlot) -> Self {
        Self { date, slot }
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.date, self.slot.code())
    }
}

// ── Appointments ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Booked,
    Assigned,
    InProgress,
    OnHold,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    /// Active statuses occupy their slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AppointmentStatus::Booked
                | AppointmentStatus::Assigned
                | AppointmentStatus::InProgress
                | AppointmentStatus::OnHold
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Booked => "booked",
            AppointmentStatus::Assigned => "assigned",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::OnHold => "on_hold",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "booked" => Some(AppointmentStatus::Booked),
            "assigned" => Some(AppointmentStatus::Assigned),
            "in_progress" => Some(AppointmentStatus::InProgress),
            "on_hold" => Some(AppointmentStatus::OnHold),
            "completed" => Some(AppointmentStatus::Completed),
            "cancelled" => Some(AppointmentStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub make: String,
    pub model: String,
    pub year: u16,
    pub plate: String,
}

impl Vehicle {
    /// Short form used by the daily view, e.g. `"Honda Civic"`.
    pub fn summary(&self) -> String {
        format!("{} {}", self.make, self.model)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub service_id: Ulid,
    pub key: SlotKey,
    pub status: AppointmentStatus,
    pub priority: Priority,
    pub assigned_employee: Option<Ulid>,
    pub vehicle: Vehicle,
    /// Customer's own request text.
    pub notes: Option<String>,
    /// Employee progress notes.
    pub work_notes: Option<String>,
    pub created_at: Ms,
    pub work_started_at: Option<Ms>,
    pub work_completed_at: Option<Ms>,
    pub estimated_completion: Option<Ms>,
}

impl Appointment {
    pub fn can_be_assigned(&self) -> bool {
        self.status == AppointmentStatus::Booked && self.assigned_employee.is_none()
    }

    pub fn can_start_work(&self) -> bool {
        matches!(
            self.status,
            AppointmentStatus::Booked | AppointmentStatus::Assigned | AppointmentStatus::OnHold
        ) && self.assigned_employee.is_some()
    }

    pub fn can_complete_work(&self) -> bool {
        matches!(
            self.status,
            AppointmentStatus::Assigned | AppointmentStatus::InProgress
        ) && self.assigned_employee.is_some()
    }

    /// Derived: estimated completion has passed and the work is still open.
    pub fn is_overdue(&self, now: Ms) -> bool {
        self.estimated_completion
            .is_some_and(|eta| eta < now && !self.status.is_terminal())
    }

    pub fn work_duration(&self) -> Option<Ms> {
        match (self.work_started_at, self.work_completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn is_assigned_to(&self, employee_id: Ulid) -> bool {
        self.assigned_employee == Some(employee_id)
    }
}

/// Validated booking input handed to the booking guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub service_id: Ulid,
    pub key: SlotKey,
    pub vehicle: Vehicle,
    pub notes: Option<String>,
    pub priority: Priority,
}

/// A requested write against an appointment, expressed as the target status
/// rather than the action that reaches it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentUpdate {
    pub status: Option<AppointmentStatus>,
    pub assigned_employee: Option<Ulid>,
    pub priority: Option<Priority>,
    pub work_notes: Option<String>,
}

/// All appointments ever placed on one (date, slot), oldest first.
/// Terminal entries stay as history until the reaper purges them.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub key: SlotKey,
    pub appointments: Vec<Appointment>,
}

impl SlotState {
    pub fn new(key: SlotKey) -> Self {
        Self {
            key,
            appointments: Vec::new(),
        }
    }

    /// The appointment holding this slot, if any. The single occupancy rule
    /// every availability read goes through.
    pub fn occupant(&self) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.status.is_active())
    }

    pub fn get(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    /// Insert or replace by id, keeping creation order.
    pub fn upsert(&mut self, appointment: Appointment) {
        match self.appointments.iter_mut().find(|a| a.id == appointment.id) {
            Some(slot) => *slot = appointment,
            None => {
                let pos = self
                    .appointments
                    .partition_point(|a| a.created_at <= appointment.created_at);
                self.appointments.insert(pos, appointment);
            }
        }
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == *id)?;
        Some(self.appointments.remove(pos))
    }
}

// ── Task assignments ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Accepted,
    InProgress,
    Completed,
    Rejected,
}

impl TaskStatus {
    /// Closed tasks never become overdue and accept no further progress.
    pub fn is_closed(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Accepted => "accepted",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(TaskStatus::Pending),
            "accepted" => Some(TaskStatus::Accepted),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "rejected" => Some(TaskStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub id: Ulid,
    pub assigned_by: Ulid,
    pub assigned_to: Ulid,
    pub appointment_id: Option<Ulid>,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assigned_at: Ms,
    pub due_at: Ms,
    pub accepted_at: Option<Ms>,
    pub started_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    /// Always within 0..=100.
    pub progress: u8,
    pub employee_notes: Option<String>,
    pub supervisor_notes: Option<String>,
}

impl TaskAssignment {
    pub fn is_overdue(&self, now: Ms) -> bool {
        self.due_at < now && !self.status.is_closed()
    }
}

/// Clamp a caller-supplied percentage into 0..=100.
pub fn clamp_progress(raw: i64) -> u8 {
    raw.clamp(0, 100) as u8
}

/// Input for creating a delegation record; the creator is the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAssignment {
    pub id: Ulid,
    pub assigned_to: Ulid,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub due_at: Ms,
    pub appointment_id: Option<Ulid>,
}

/// Partial update of a task. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<i64>,
    pub employee_notes: Option<String>,
    pub supervisor_notes: Option<String>,
}

impl AssignmentUpdate {
    /// True if any field the assignee owns is being touched.
    pub fn touches_assignee_fields(&self) -> bool {
        self.status.is_some() || self.progress.is_some() || self.employee_notes.is_some()
    }
}

// ── Employees, services, callers ─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EmployeeKind {
    #[default]
    Regular,
    Super,
}

impl EmployeeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EmployeeKind::Regular => "regular",
            EmployeeKind::Super => "super",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regular" => Some(EmployeeKind::Regular),
            "super" => Some(EmployeeKind::Super),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EmployeeStatus {
    #[default]
    Available,
    Busy,
    Break,
    OffDuty,
}

impl EmployeeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EmployeeStatus::Available => "available",
            EmployeeStatus::Busy => "busy",
            EmployeeStatus::Break => "break",
            EmployeeStatus::OffDuty => "off_duty",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "available" => Some(EmployeeStatus::Available),
            "busy" => Some(EmployeeStatus::Busy),
            "break" => Some(EmployeeStatus::Break),
            "off_duty" => Some(EmployeeStatus::OffDuty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: Ulid,
    /// Unique human-facing code, e.g. `EMP0042`.
    pub code: String,
    pub kind: EmployeeKind,
    pub specialization: Option<String>,
    pub active: bool,
    pub status: EmployeeStatus,
    pub supervisor_id: Option<Ulid>,
    /// Hundredths of a point out of 5.00.
    pub rating_centi: u16,
}

impl Employee {
    pub fn new(id: Ulid, code: String, kind: EmployeeKind) -> Self {
        Self {
            id,
            code,
            kind,
            specialization: None,
            active: true,
            status: EmployeeStatus::Available,
            supervisor_id: None,
            rating_centi: 500,
        }
    }

    pub fn is_super(&self) -> bool {
        self.kind == EmployeeKind::Super
    }

    pub fn rating_display(&self) -> String {
        format!("{}.{:02}", self.rating_centi / 100, self.rating_centi % 100)
    }
}

/// Partial employee update. `supervisor_id: Some(None)` detaches from a supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmployeePatch {
    pub status: Option<EmployeeStatus>,
    pub active: Option<bool>,
    pub supervisor_id: Option<Option<Ulid>>,
    pub rating_centi: Option<u16>,
}

impl EmployeePatch {
    /// Fields only a super employee or admin may write.
    pub fn touches_managed_fields(&self) -> bool {
        self.active.is_some() || self.supervisor_id.is_some() || self.rating_centi.is_some()
    }
}

/// Catalog entry mirrored from the service catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub estimated_duration: Option<Ms>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Customer,
    Employee,
    Supervisor,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Employee => "employee",
            Role::Supervisor => "supervisor",
            Role::Admin => "admin",
        }
    }
}

/// The resolved caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn customer(id: Ulid) -> Self {
        Self { id, role: Role::Customer }
    }

    pub fn employee(id: Ulid) -> Self {
        Self { id, role: Role::Employee }
    }

    pub fn supervisor(id: Ulid) -> Self {
        Self { id, role: Role::Supervisor }
    }

    pub fn admin() -> Self {
        Self { id: Ulid::nil(), role: Role::Admin }
    }

    /// Employees of either type.
    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Employee | Role::Supervisor)
    }

    /// Super employees and admins: may delegate and override.
    pub fn can_manage(&self) -> bool {
        matches!(self.role, Role::Supervisor | Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── WAL records ──────────────────────────────────────────────

/// The event types. Each carries the full post-image of what it touched.
/// This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceRegistered {
        service: Service,
    },
    EmployeeRegistered {
        employee: Employee,
    },
    EmployeeUpdated {
        employee: Employee,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    /// Status or field change, plus any linked tasks closed in the same step.
    AppointmentChanged {
        appointment: Appointment,
        tasks: Vec<TaskAssignment>,
    },
    AppointmentPurged {
        id: Ulid,
        key: SlotKey,
    },
    AssignmentCreated {
        task: TaskAssignment,
        appointment: Option<Appointment>,
    },
    AssignmentChanged {
        task: TaskAssignment,
    },
}

// ── Query projections ────────────────────────────────────────

/// What `daily_detail` shows about the appointment holding a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupantSummary {
    pub appointment_id: Ulid,
    pub customer_id: Ulid,
    pub service: String,
    pub status: AppointmentStatus,
    pub vehicle: String,
    pub assigned_employee: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDetail {
    pub slot: TimeSlot,
    pub occupied: bool,
    pub occupant: Option<OccupantSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyDetail {
    pub date: NaiveDate,
    pub total: usize,
    pub occupied: usize,
    pub available: usize,
    pub slots: Vec<SlotDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmployeeProfile {
    pub employee: Employee,
    pub pending_tasks: usize,
    pub tasks_completed: usize,
    pub avg_completion_ms: Option<Ms>,
}

/// One subordinate's row on a supervisor dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRow {
    pub employee_id: Ulid,
    pub code: String,
    pub status: EmployeeStatus,
    pub active_appointments: usize,
    pub open_assignments: usize,
    pub overdue_assignments: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentFilter {
    All,
    Id(Ulid),
    Customer(Ulid),
    AssignedTo(Ulid),
    Date(NaiveDate),
    Status(AppointmentStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentFilter {
    All,
    Id(Ulid),
    AssignedTo(Ulid),
    AssignedBy(Ulid),
    Appointment(Ulid),
}
