use chrono::{Days, NaiveDate, Utc};
use icalendar::{Calendar, Component, EventLike, Property, ValueType};

use crate::model::{Booking, Cabin};

pub const CALENDAR_TIMEZONE: &str = "America/Santiago";

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Render the export feed of a cabin: one all-day event per booking.
/// Callers pass occupying bookings only.
pub fn export_calendar(cabin: &Cabin, bookings: &[Booking]) -> String {
    let mut cal = Calendar::new();
    cal.name(&format!("Bookings - {} ({})", cabin.name, cabin.location));
    cal.timezone(CALENDAR_TIMEZONE);

    let dtstamp = Utc::now().format(STAMP_FORMAT).to_string();
    for booking in bookings {
        let mut ev = icalendar::Event::new();
        ev.uid(&booking.id.to_string());
        ev.summary(&format!("Booking: {}", booking.guest.name));
        ev.description(&format!(
            "Booking for {}. Contact: {}, {}",
            booking.guest.name, booking.guest.email, booking.guest.phone
        ));
        ev.location(&cabin.location);
        ev.add_property("STATUS", "CONFIRMED");
        ev.add_property("DTSTAMP", &dtstamp);
        ev.add_property(
            "CREATED",
            booking.created_at.format(STAMP_FORMAT).to_string(),
        );

        let end = booking
            .stay
            .end
            .checked_add_days(Days::new(1))
            .unwrap_or(booking.stay.end);
        add_date_property(&mut ev, "DTSTART", booking.stay.start);
        add_date_property(&mut ev, "DTEND", end);

        cal.push(ev.done());
    }

    cal.done().to_string()
}

/// Attachment name offered for a cabin's feed.
pub fn export_filename(cabin: &Cabin) -> String {
    let safe: String = cabin
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ' ' { c } else { '_' })
        .collect();
    format!("{safe}-bookings.ics")
}

fn add_date_property(ev: &mut icalendar::Event, name: &str, date: NaiveDate) {
    let mut prop = Property::new(name, date.format("%Y%m%d").to_string());
    prop.append_parameter(ValueType::Date);
    ev.append_property(prop);
}
