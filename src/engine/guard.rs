use chrono::{Days, NaiveDate, Utc};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

pub(crate) fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Bookable dates run from today through `today + horizon_days`, inclusive.
pub(crate) fn validate_booking_window(
    key: &SlotKey,
    today: NaiveDate,
    horizon_days: i64,
) -> Result<(), EngineError> {
    if key.date < today {
        return Err(EngineError::PastDate(*key));
    }
    let last = today
        .checked_add_days(Days::new(horizon_days.max(0) as u64))
        .unwrap_or(NaiveDate::MAX);
    if key.date > last {
        return Err(EngineError::HorizonExceeded {
            key: *key,
            horizon_days,
        });
    }
    Ok(())
}

/// Caller must hold the slot's write lock for the result to mean anything.
pub(crate) fn check_slot_free(rs: &SlotState) -> Result<(), EngineError> {
    match rs.occupant() {
        Some(_) => Err(EngineError::SlotOccupied(rs.key)),
        None => Ok(()),
    }
}

pub(crate) fn validate_vehicle(vehicle: &Vehicle) -> Result<(), EngineError> {
    if vehicle.make.trim().is_empty() || vehicle.model.trim().is_empty() {
        return Err(EngineError::LimitExceeded("vehicle make and model are required"));
    }
    if vehicle.make.len() > MAX_VEHICLE_FIELD_LEN || vehicle.model.len() > MAX_VEHICLE_FIELD_LEN {
        return Err(EngineError::LimitExceeded("vehicle field too long"));
    }
    if vehicle.plate.trim().is_empty() || vehicle.plate.len() > MAX_PLATE_LEN {
        return Err(EngineError::LimitExceeded("license plate must be 1-20 characters"));
    }
    if !(MIN_VEHICLE_YEAR..=MAX_VEHICLE_YEAR).contains(&vehicle.year) {
        return Err(EngineError::LimitExceeded("vehicle year out of range"));
    }
    Ok(())
}

pub(crate) fn validate_notes(notes: Option<&str>) -> Result<(), EngineError> {
    match notes {
        Some(n) if n.len() > MAX_NOTES_LEN => Err(EngineError::LimitExceeded("notes too long")),
        _ => Ok(()),
    }
}
