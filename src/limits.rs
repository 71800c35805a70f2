//! Hard caps on caller-supplied input. Everything here is checked before a
//! lock is taken or an event reaches the WAL.

use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_CODE_LEN: usize = 20;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_NOTES_LEN: usize = 4096;

pub const MAX_VEHICLE_FIELD_LEN: usize = 50;
pub const MAX_PLATE_LEN: usize = 20;
pub const MIN_VEHICLE_YEAR: u16 = 1900;
pub const MAX_VEHICLE_YEAR: u16 = 2100;

/// Rating is stored in hundredths: 500 == 5.00.
pub const MAX_RATING_CENTI: u16 = 500;

pub const MAX_HIERARCHY_DEPTH: usize = 32;
pub const MAX_EMPLOYEES: usize = 10_000;
pub const MAX_SERVICES: usize = 10_000;

/// Services longer than a working week are rejected as input errors.
pub const MAX_SERVICE_DURATION_MS: Ms = 7 * 24 * 3_600_000;
