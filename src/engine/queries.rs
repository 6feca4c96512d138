use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{daily_availability, merge_days, saturated_days};
use super::conflict::validate_years;
use super::{Engine, EngineError};

impl Engine {
    /// Cabins ordered by nightly price, optionally restricted to a location.
    pub async fn list_cabins(&self, location: Option<&str>) -> Vec<Cabin> {
        let states: Vec<_> = self.cabins.iter().map(|e| e.value().clone()).collect();
        let mut cabins = Vec::with_capacity(states.len());
        for cs in states {
            let guard = cs.read().await;
            if location.is_none_or(|l| guard.cabin.location == l) {
                cabins.push(guard.cabin.clone());
            }
        }
        cabins.sort_by(|a, b| a.nightly_price.cmp(&b.nightly_price).then(a.name.cmp(&b.name)));
        cabins
    }

    pub async fn get_cabin(&self, id: Ulid) -> Option<Cabin> {
        let cs = self.cabin_state(&id)?;
        let guard = cs.read().await;
        Some(guard.cabin.clone())
    }

    pub async fn availability(
        &self,
        cabin_id: Ulid,
        window: Stay,
        today: NaiveDate,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        validate_window(&window)?;
        let cs = self
            .cabin_state(&cabin_id)
            .ok_or(EngineError::CabinNotFound(cabin_id))?;
        let guard = cs.read().await;
        Ok(daily_availability(&guard, &window, today))
    }

    /// Runs of consecutive days on which the cabin is fully booked.
    pub async fn full_ranges(&self, cabin_id: Ulid, window: Stay) -> Result<Vec<Stay>, EngineError> {
        validate_window(&window)?;
        let cs = self
            .cabin_state(&cabin_id)
            .ok_or(EngineError::CabinNotFound(cabin_id))?;
        let guard = cs.read().await;
        let stays: Vec<Stay> = guard.occupying(&window).map(|b| b.stay).collect();
        let days = saturated_days(&stays, guard.cabin.capacity, &window);
        Ok(merge_days(&days))
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let cabin_id = self.cabin_of_booking(&id)?;
        let cs = self.cabin_state(&cabin_id)?;
        let guard = cs.read().await;
        guard.booking(id).cloned()
    }

    /// Booking owning a gateway request token.
    pub async fn find_by_token(&self, token: &str) -> Option<Booking> {
        let id = self.index.by_token.get(token).map(|e| *e.value())?;
        self.get_booking(id).await
    }

    /// Bookings matching `filter`, newest stay first.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let states: Vec<_> = match filter.cabin_id {
            Some(id) => self.cabin_state(&id).into_iter().collect(),
            None => self.cabins.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for cs in states {
            let guard = cs.read().await;
            if let Some(loc) = &filter.location
                && guard.cabin.location != *loc
            {
                continue;
            }
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| filter.from.is_none_or(|from| b.stay.start >= from))
                    .filter(|b| filter.to.is_none_or(|to| b.stay.end <= to))
                    .filter(|b| filter.status.is_none_or(|s| b.status == s))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| b.stay.start.cmp(&a.stay.start).then(b.id.cmp(&a.id)));
        out
    }

    /// A cabin together with its occupying bookings, for the export feed.
    pub async fn occupying_bookings(&self, cabin_id: Ulid) -> Result<(Cabin, Vec<Booking>), EngineError> {
        let cs = self
            .cabin_state(&cabin_id)
            .ok_or(EngineError::CabinNotFound(cabin_id))?;
        let guard = cs.read().await;
        let bookings = guard
            .bookings
            .iter()
            .filter(|b| b.status.occupies())
            .cloned()
            .collect();
        Ok((guard.cabin.clone(), bookings))
    }

    pub fn list_sources(&self, enabled_only: bool) -> Vec<CalendarSource> {
        let mut sources: Vec<_> = self
            .sources
            .iter()
            .map(|s| s.value().clone())
            .filter(|s| !enabled_only || s.enabled)
            .collect();
        sources.sort_by_key(|s| s.cabin_id);
        sources
    }

    pub fn get_source(&self, cabin_id: Ulid) -> Option<CalendarSource> {
        self.sources.get(&cabin_id).map(|s| s.value().clone())
    }

    pub fn link_by_token(&self, token: &str) -> Option<CalendarLink> {
        self.links.get(token).map(|l| l.value().clone())
    }

    pub fn link_for_cabin(&self, cabin_id: Ulid) -> Option<CalendarLink> {
        let token = self.cabin_links.get(&cabin_id)?.value().clone();
        self.link_by_token(&token)
    }
}

fn validate_window(window: &Stay) -> Result<(), EngineError> {
    if window.start > window.end {
        return Err(EngineError::InvalidStay("window end before start"));
    }
    if (window.end - window.start).num_days() > MAX_QUERY_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    validate_years(window)
}
