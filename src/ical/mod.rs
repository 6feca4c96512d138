//! iCal feeds: reading external (Airbnb) calendars into booking imports and
//! rendering a cabin's occupying bookings as an export feed.

mod generate;
mod parse;

pub use generate::{export_calendar, export_filename, CALENDAR_TIMEZONE};
pub use parse::{parse_feed, FeedError};
