use std::collections::BTreeMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Expand each stay into its days and count how many stays cover each day.
/// Only days inside `window` are counted.
pub fn occupancy_by_day<'a>(
    stays: impl IntoIterator<Item = &'a Stay>,
    window: &Stay,
) -> BTreeMap<NaiveDate, u32> {
    let mut counts = BTreeMap::new();
    for stay in stays {
        if let Some(clamped) = stay.clamp_to(window) {
            for day in clamped.days() {
                *counts.entry(day).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Per-day availability of a cabin over `window`.
///
/// Days before `today` are reported as `Past` regardless of bookings.
pub fn daily_availability(cs: &CabinState, window: &Stay, today: NaiveDate) -> Vec<DayAvailability> {
    let capacity = cs.cabin.capacity;
    let counts = occupancy_by_day(cs.occupying(window).map(|b| &b.stay), window);

    window
        .days()
        .map(|date| {
            let booked = counts.get(&date).copied().unwrap_or(0);
            let status = if date < today {
                DayStatus::Past
            } else if booked >= capacity {
                DayStatus::Full
            } else if booked > 0 {
                DayStatus::Partial
            } else {
                DayStatus::Available
            };
            DayAvailability {
                date,
                booked,
                available: capacity.saturating_sub(booked),
                status,
            }
        })
        .collect()
}

/// Days inside `window` where the number of stays reaches `capacity`.
pub fn saturated_days(stays: &[Stay], capacity: u32, window: &Stay) -> Vec<NaiveDate> {
    if stays.is_empty() {
        return Vec::new();
    }
    occupancy_by_day(stays, window)
        .into_iter()
        .filter(|(_, count)| *count >= capacity)
        .map(|(day, _)| day)
        .collect()
}

/// Merge sorted days into runs of consecutive days.
pub fn merge_days(sorted: &[NaiveDate]) -> Vec<Stay> {
    let mut merged: Vec<Stay> = Vec::new();
    for &day in sorted {
        if let Some(last) = merged.last_mut()
            && last.end.succ_opt() == Some(day)
        {
            last.end = day;
            continue;
        }
        merged.push(Stay::new(day, day));
    }
    merged
}

/// First day of `stay` on which the cabin is already at capacity,
/// ignoring the booking `exclude` (used when an existing booking is edited).
pub fn first_full_day(cs: &CabinState, stay: &Stay, exclude: Option<Ulid>) -> Option<NaiveDate> {
    let capacity = cs.cabin.capacity;
    let others = cs
        .occupying(stay)
        .filter(|b| Some(b.id) != exclude);

    if capacity <= 1 {
        // Fast path: any overlapping occupying booking is a conflict
        return others
            .map(|b| b.stay.start.max(stay.start))
            .min();
    }

    let stays: Vec<Stay> = others.map(|b| b.stay).collect();
    saturated_days(&stays, capacity, stay).into_iter().next()
}
