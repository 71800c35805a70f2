//! Slot Calendar: occupancy and availability for one date, computed from a
//! snapshot of the five slot states. No locks, no I/O.

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// The active occupant (if any) of each fixed slot on one date.
#[derive(Debug, Clone)]
pub struct DayOccupancy {
    pub date: NaiveDate,
    occupants: [Option<Appointment>; 5],
}

impl DayOccupancy {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            occupants: Default::default(),
        }
    }

    /// Record the occupant of `slot` as reported by `SlotState::occupant`.
    pub fn set(&mut self, slot: TimeSlot, occupant: Option<Appointment>) {
        self.occupants[slot.index()] = occupant.filter(|a| a.status.is_active());
    }

    pub fn occupant(&self, slot: TimeSlot) -> Option<&Appointment> {
        self.occupants[slot.index()].as_ref()
    }

    pub fn occupied_count(&self) -> usize {
        self.occupants.iter().filter(|o| o.is_some()).count()
    }

    /// Free slots in the day, 0..=5.
    pub fn capacity(&self) -> usize {
        TimeSlot::ALL.len() - self.occupied_count()
    }
}

/// Free slots in ascending time order. Dates before `today` have none.
pub fn available_slots(day: &DayOccupancy, today: NaiveDate) -> Vec<TimeSlot> {
    if day.date < today {
        return Vec::new();
    }
    TimeSlot::ALL
        .into_iter()
        .filter(|slot| day.occupant(*slot).is_none())
        .collect()
}

/// Per-slot view of a date. `service_name` resolves a service id to its
/// display name.
pub fn daily_detail(day: &DayOccupancy, service_name: impl Fn(Ulid) -> String) -> DailyDetail {
    let slots: Vec<SlotDetail> = TimeSlot::ALL
        .into_iter()
        .map(|slot| {
            let occupant = day.occupant(slot).map(|a| OccupantSummary {
                appointment_id: a.id,
                customer_id: a.customer_id,
                service: service_name(a.service_id),
                status: a.status,
                vehicle: a.vehicle.summary(),
                assigned_employee: a.assigned_employee,
            });
            SlotDetail {
                slot,
                occupied: occupant.is_some(),
                occupant,
            }
        })
        .collect();

    let occupied = day.occupied_count();
    DailyDetail {
        date: day.date,
        total: TimeSlot::ALL.len(),
        occupied,
        available: TimeSlot::ALL.len() - occupied,
        slots,
    }
}
