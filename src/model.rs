use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Inclusive date range `[start, end]`. Both the check-in and the check-out
/// day count as occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Stay {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "Stay start must not be after end");
        Self { start, end }
    }

    /// Billable nights. A same-day stay still bills one night.
    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days().max(1)
    }

    pub fn overlaps(&self, other: &Stay) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// Intersection with `window`, if any.
    pub fn clamp_to(&self, window: &Stay) -> Option<Stay> {
        if !self.overlaps(window) {
            return None;
        }
        Some(Stay::new(
            self.start.max(window.start),
            self.end.min(window.end),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Failed,
    Refunded,
}

/// Outcome of asking a booking to move to a new status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Applied,
    Unchanged,
    Ignored,
}

impl BookingStatus {
    /// Whether a booking in this status takes a unit of capacity.
    pub fn occupies(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_become(self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, _) | (BookingStatus::Confirmed, BookingStatus::Refunded)
        )
    }

    pub fn transition(self, next: BookingStatus) -> Transition {
        if self == next {
            Transition::Unchanged
        } else if self.can_become(next) {
            Transition::Applied
        } else {
            Transition::Ignored
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Failed => "failed",
            BookingStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a booking came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingSource {
    /// Customer booking form, paid through the gateway.
    Direct,
    /// Entered by an administrator.
    Admin,
    /// Imported from an Airbnb iCal feed.
    Airbnb,
}

impl BookingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingSource::Direct => "direct",
            BookingSource::Admin => "admin",
            BookingSource::Airbnb => "airbnb",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub document: Option<String>,
    pub document_type: Option<String>,
}

/// Everything the payment gateway told us about a booking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInfo {
    /// Gateway `requestId` of the checkout session.
    pub request_token: Option<String>,
    pub process_url: Option<String>,
    /// Last raw status string reported by the gateway (`APPROVED`, `REJECTED`, ...).
    pub gateway_status: Option<String>,
    pub reason: Option<String>,
    /// Raw JSON of the last notification or lookup.
    pub details: Option<String>,
    pub internal_reference: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub payment_date: Option<String>,
    pub refund_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub cabin_id: Ulid,
    pub guest: Guest,
    pub stay: Stay,
    pub status: BookingStatus,
    pub amount: Option<u64>,
    pub source: BookingSource,
    /// UID of the external calendar event this booking mirrors.
    pub external_id: Option<String>,
    pub notes: Option<String>,
    pub payment: PaymentInfo,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cabin {
    pub id: Ulid,
    pub name: String,
    /// Price per night in whole CLP.
    pub nightly_price: u64,
    /// Units of this cabin that can be let at once.
    pub capacity: u32,
    pub location: String,
}

#[derive(Debug, Clone)]
pub struct CabinState {
    pub cabin: Cabin,
    /// All bookings of the cabin, any status, sorted by `stay.start`.
    pub bookings: Vec<Booking>,
}

impl CabinState {
    pub fn new(cabin: Cabin) -> Self {
        Self {
            cabin,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by stay.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.stay.start <= booking.stay.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings whose stay overlaps `query`, any status.
    /// Binary search skips bookings starting after `query.end`.
    pub fn overlapping(&self, query: &Stay) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.stay.start <= query.end);
        let start = query.start;
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.stay.end >= start)
    }

    /// Overlapping bookings that take capacity.
    pub fn occupying(&self, query: &Stay) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.status.occupies())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Error,
}

/// External iCal feed pulled into a cabin's bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSource {
    pub cabin_id: Ulid,
    pub url: String,
    pub enabled: bool,
    pub last_synced: Option<DateTime<Utc>>,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub sync_status: Option<SyncStatus>,
    pub sync_message: Option<String>,
}

/// Public export token for a cabin's iCal feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarLink {
    pub cabin_id: Ulid,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CabinCreated {
        cabin: Cabin,
    },
    CabinUpdated {
        cabin: Cabin,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Full replacement. `previous_cabin` differs from `booking.cabin_id`
    /// when an administrator moved the booking.
    BookingUpdated {
        booking: Booking,
        previous_cabin: Ulid,
    },
    BookingDeleted {
        id: Ulid,
        cabin_id: Ulid,
    },
    SourceSaved {
        source: CalendarSource,
    },
    LinkSaved {
        link: CalendarLink,
    },
}

impl Event {
    /// Cabins whose state this event touches, in apply order.
    pub fn cabin_ids(&self) -> Vec<Ulid> {
        match self {
            Event::CabinCreated { cabin } | Event::CabinUpdated { cabin } => vec![cabin.id],
            Event::BookingCreated { booking } => vec![booking.cabin_id],
            Event::BookingUpdated {
                booking,
                previous_cabin,
            } => {
                if *previous_cabin == booking.cabin_id {
                    vec![booking.cabin_id]
                } else {
                    vec![*previous_cabin, booking.cabin_id]
                }
            }
            Event::BookingDeleted { cabin_id, .. } => vec![*cabin_id],
            Event::SourceSaved { .. } | Event::LinkSaved { .. } => Vec::new(),
        }
    }
}

// ── Engine inputs ─────────────────────────────────────────────

/// Guest email stored on bookings imported from an external calendar.
pub const IMPORTED_GUEST_EMAIL: &str = "airbnb@imported.invalid";
pub const IMPORTED_GUEST_PHONE: &str = "Airbnb import";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CabinDraft {
    pub name: String,
    pub nightly_price: u64,
    pub capacity: u32,
    pub location: String,
}

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub cabin_id: Ulid,
    pub guest: Guest,
    pub stay: Stay,
    pub status: BookingStatus,
    pub source: BookingSource,
    pub amount: Option<u64>,
    pub notes: Option<String>,
}

/// Administrator edit of an existing booking. Status is untouched.
#[derive(Debug, Clone)]
pub struct BookingEdit {
    pub cabin_id: Ulid,
    pub guest: Guest,
    pub stay: Stay,
    pub notes: Option<String>,
}

/// Status change reported by the gateway (or the reaper).
#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    pub status: BookingStatus,
    pub gateway_status: Option<String>,
    pub reason: Option<String>,
    pub details: Option<String>,
    pub date: Option<String>,
    pub internal_reference: Option<String>,
}

impl PaymentUpdate {
    pub fn status(status: BookingStatus) -> Self {
        Self {
            status,
            gateway_status: None,
            reason: None,
            details: None,
            date: None,
            internal_reference: None,
        }
    }
}

/// One VEVENT of an external feed, already mapped to our date convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEvent {
    pub uid: String,
    pub stay: Stay,
    pub guest_name: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Inserted(Booking),
    Updated(Booking),
    Unchanged(Booking),
}

#[derive(Debug, Clone, Default)]
pub struct BookingFilter {
    pub cabin_id: Option<Ulid>,
    /// Bookings starting on or after this day.
    pub from: Option<NaiveDate>,
    /// Bookings ending on or before this day.
    pub to: Option<NaiveDate>,
    pub location: Option<String>,
    pub status: Option<BookingStatus>,
}

/// Per-day occupancy of a cabin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DayStatus {
    Past,
    Available,
    Partial,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub booked: u32,
    pub available: u32,
    pub status: DayStatus,
}
