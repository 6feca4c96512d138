use chrono::Datelike;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::first_full_day;
use super::EngineError;

pub(crate) fn validate_stay(stay: &Stay) -> Result<(), EngineError> {
    if stay.start > stay.end {
        return Err(EngineError::InvalidStay("check-out before check-in"));
    }
    validate_years(stay)?;
    if (stay.end - stay.start).num_days() > MAX_STAY_DAYS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

pub(crate) fn validate_years(stay: &Stay) -> Result<(), EngineError> {
    for year in [stay.start.year(), stay.end.year()] {
        if !(MIN_VALID_YEAR..=MAX_VALID_YEAR).contains(&year) {
            return Err(EngineError::InvalidStay("date out of range"));
        }
    }
    Ok(())
}

pub(crate) fn validate_guest(guest: &Guest) -> Result<(), EngineError> {
    if guest.name.trim().is_empty() {
        return Err(EngineError::Invalid("guest name is required"));
    }
    if guest.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("guest name too long"));
    }
    if guest.email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    if guest.phone.len() > MAX_PHONE_LEN {
        return Err(EngineError::LimitExceeded("phone too long"));
    }
    Ok(())
}

pub(crate) fn validate_cabin(name: &str, capacity: u32, location: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Invalid("cabin name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("cabin name too long"));
    }
    if location.len() > MAX_LOCATION_LEN {
        return Err(EngineError::LimitExceeded("location too long"));
    }
    if capacity == 0 {
        return Err(EngineError::Invalid("capacity must be at least 1"));
    }
    Ok(())
}

/// Reject `stay` if any of its days is already at the cabin's capacity.
/// Caller holds the cabin's write lock, so check and insert are atomic.
pub(crate) fn check_capacity(
    cs: &CabinState,
    stay: &Stay,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match first_full_day(cs, stay, exclude) {
        Some(day) => Err(EngineError::CapacityExceeded {
            day,
            capacity: cs.cabin.capacity,
        }),
        None => Ok(()),
    }
}
