use dashmap::DashMap;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::limits::MAX_HIERARCHY_DEPTH;
use crate::model::*;

use super::EngineError;

/// Employees and services known to the core, plus the supervision index.
/// Writes are serialized through `write_lock`; reads are lock-free.
pub struct Directory {
    employees: DashMap<Ulid, Employee>,
    codes: DashMap<String, Ulid>,
    services: DashMap<Ulid, Service>,
    /// Supervisor → direct reports.
    subordinates: DashMap<Ulid, Vec<Ulid>>,
    pub(super) write_lock: Mutex<()>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Self {
            employees: DashMap::new(),
            codes: DashMap::new(),
            services: DashMap::new(),
            subordinates: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    // ── Services ─────────────────────────────────────────────

    pub fn service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn service_name(&self, id: &Ulid) -> String {
        self.services
            .get(id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn services(&self) -> Vec<Service> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    pub(super) fn put_service(&self, service: Service) {
        self.services.insert(service.id, service);
    }

    // ── Employees ────────────────────────────────────────────

    pub fn employee(&self, id: &Ulid) -> Option<Employee> {
        self.employees.get(id).map(|e| e.value().clone())
    }

    pub fn employee_count(&self) -> usize {
        self.employees.len()
    }

    pub fn code_taken(&self, code: &str) -> bool {
        self.codes.contains_key(code)
    }

    /// All employees, ordered by code.
    pub fn employees(&self) -> Vec<Employee> {
        let mut all: Vec<Employee> = self.employees.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.code.cmp(&b.code));
        all
    }

    /// Direct reports only; the index is not walked transitively.
    pub fn subordinates(&self, supervisor_id: &Ulid) -> Vec<Ulid> {
        self.subordinates
            .get(supervisor_id)
            .map(|kids| kids.clone())
            .unwrap_or_default()
    }

    /// Insert or replace an employee record and keep both indexes in step.
    pub(crate) fn put_employee(&self, employee: Employee) {
        if let Some(prev) = self.employees.get(&employee.id).map(|e| e.value().clone()) {
            if prev.supervisor_id != employee.supervisor_id
                && let Some(old) = prev.supervisor_id
                && let Some(mut kids) = self.subordinates.get_mut(&old)
            {
                kids.retain(|k| *k != employee.id);
            }
            if prev.code != employee.code {
                self.codes.remove(&prev.code);
            }
        }
        if let Some(sup) = employee.supervisor_id {
            let mut kids = self.subordinates.entry(sup).or_default();
            if !kids.contains(&employee.id) {
                kids.push(employee.id);
            }
        }
        self.codes.insert(employee.code.clone(), employee.id);
        self.employees.insert(employee.id, employee);
    }

    /// An active employee that can take work.
    pub fn assignable(&self, id: &Ulid) -> Result<Employee, EngineError> {
        let employee = self.employee(id).ok_or(EngineError::NotFound(*id))?;
        if !employee.active {
            return Err(EngineError::EmployeeInactive(*id));
        }
        Ok(employee)
    }

    /// Check that `supervisor_id` may supervise `employee_id`: it must exist,
    /// be a super employee, and linking must not close a loop.
    pub fn validate_supervisor(&self, employee_id: Ulid, supervisor_id: Ulid) -> Result<(), EngineError> {
        if supervisor_id == employee_id {
            return Err(EngineError::CycleDetected(employee_id));
        }
        let supervisor = self
            .employee(&supervisor_id)
            .ok_or(EngineError::NotFound(supervisor_id))?;
        if !supervisor.is_super() {
            return Err(EngineError::InvalidSupervisor(supervisor_id));
        }

        let mut depth = 0usize;
        let mut cur = Some(supervisor_id);
        while let Some(id) = cur {
            if id == employee_id {
                return Err(EngineError::CycleDetected(employee_id));
            }
            depth += 1;
            if depth > MAX_HIERARCHY_DEPTH {
                return Err(EngineError::LimitExceeded("supervision chain too deep"));
            }
            cur = self.employees.get(&id).and_then(|e| e.supervisor_id);
        }
        Ok(())
    }
}
