use chrono::{Days, NaiveDate};
use icalendar::{
    parser::{read_calendar, unfold, Component},
    CalendarDateTime, DatePerhapsTime,
};
use tracing::debug;

use crate::limits::{MAX_FEED_EVENTS, MAX_NAME_LEN, MAX_NOTES_LEN};
use crate::model::{ExternalEvent, Stay};

#[derive(Debug)]
pub enum FeedError {
    Malformed(String),
    TooManyEvents(usize),
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::Malformed(e) => write!(f, "malformed calendar: {e}"),
            FeedError::TooManyEvents(n) => {
                write!(f, "calendar has {n} events, limit is {MAX_FEED_EVENTS}")
            }
        }
    }
}

impl std::error::Error for FeedError {}

/// Parse a feed into importable events. VEVENTs missing UID, DTSTART or
/// DTEND are skipped. DTEND is exclusive, so the stay ends the day before
/// (never before the start).
pub fn parse_feed(content: &str) -> Result<Vec<ExternalEvent>, FeedError> {
    let content = content.trim_start_matches('\u{feff}').trim_start();
    if !content.starts_with("BEGIN:VCALENDAR") {
        return Err(FeedError::Malformed("missing BEGIN:VCALENDAR".into()));
    }
    let unfolded = unfold(content);
    let calendar = read_calendar(&unfolded).map_err(|e| FeedError::Malformed(e.to_string()))?;

    let vevents: Vec<&Component> = calendar
        .components
        .iter()
        .filter(|c| c.name == "VEVENT")
        .collect();
    if vevents.len() > MAX_FEED_EVENTS {
        return Err(FeedError::TooManyEvents(vevents.len()));
    }

    let mut events = Vec::with_capacity(vevents.len());
    for vevent in vevents {
        match to_external(vevent) {
            Some(event) => events.push(event),
            None => debug!("skipping VEVENT without UID or dates"),
        }
    }
    Ok(events)
}

fn to_external(vevent: &Component) -> Option<ExternalEvent> {
    let uid = vevent.find_prop("UID")?.val.to_string();
    if uid.trim().is_empty() {
        return None;
    }
    let start = to_date(DatePerhapsTime::try_from(vevent.find_prop("DTSTART")?).ok()?);
    let end_exclusive = to_date(DatePerhapsTime::try_from(vevent.find_prop("DTEND")?).ok()?);
    let end = end_exclusive
        .checked_sub_days(Days::new(1))
        .unwrap_or(end_exclusive)
        .max(start);
    let stay = Stay::new(start, end);

    let summary = vevent
        .find_prop("SUMMARY")
        .map(|p| p.val.to_string())
        .unwrap_or_default();
    let guest_name = if is_placeholder(&summary) {
        placeholder_name(start, end_exclusive.max(start))
    } else {
        truncate(summary.trim(), MAX_NAME_LEN)
    };
    let notes = vevent
        .find_prop("DESCRIPTION")
        .map(|p| p.val.to_string())
        .filter(|d| !d.trim().is_empty())
        .map(|d| truncate(&d, MAX_NOTES_LEN));

    Some(ExternalEvent {
        uid,
        stay,
        guest_name,
        notes,
    })
}

fn to_date(dpt: DatePerhapsTime) -> NaiveDate {
    match dpt {
        DatePerhapsTime::Date(d) => d,
        DatePerhapsTime::DateTime(dt) => match dt {
            CalendarDateTime::Utc(dt) => dt.date_naive(),
            CalendarDateTime::Floating(naive) => naive.date(),
            CalendarDateTime::WithTimezone { date_time, .. } => date_time.date(),
        },
    }
}

/// Airbnb blocks carry no guest name.
fn is_placeholder(summary: &str) -> bool {
    let s = summary.trim();
    s.is_empty() || s == "Reserved" || s.contains("Not Available")
}

fn placeholder_name(start: NaiveDate, end: NaiveDate) -> String {
    format!(
        "Airbnb guest ({} to {})",
        start.format("%d/%m/%Y"),
        end.format("%d/%m/%Y")
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    const AIRBNB_FEED: &str = "BEGIN:VCALENDAR\r\n\
PRODID:-//Airbnb Inc//Hosting Calendar 0.8.8//EN\r\n\
CALSCALE:GREGORIAN\r\n\
VERSION:2.0\r\n\
BEGIN:VEVENT\r\n\
DTEND;VALUE=DATE:20250315\r\n\
DTSTART;VALUE=DATE:20250310\r\n\
UID:1418fb94e984-a1@airbnb.com\r\n\
SUMMARY:Reserved\r\n\
DESCRIPTION:Reservation URL: https://www.airbnb.com/hosting/reservations/d\r\n\
 etails/HM123\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
DTEND;VALUE=DATE:20250402\r\n\
DTSTART;VALUE=DATE:20250401\r\n\
UID:1418fb94e984-a2@airbnb.com\r\n\
SUMMARY:Airbnb (Not available)\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
DTEND:20250420T150000Z\r\n\
DTSTART:20250418T120000Z\r\n\
UID:manual-1\r\n\
SUMMARY:Carla Díaz\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
DTSTART;VALUE=DATE:20250501\r\n\
SUMMARY:No uid and no end\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    #[test]
    fn parses_airbnb_feed() {
        let events = parse_feed(AIRBNB_FEED).unwrap();
        assert_eq!(events.len(), 3);

        let first = &events[0];
        assert_eq!(first.uid, "1418fb94e984-a1@airbnb.com");
        assert_eq!(first.stay, Stay::new(d("2025-03-10"), d("2025-03-14")));
        assert_eq!(first.guest_name, "Airbnb guest (10/03/2025 to 15/03/2025)");
        assert!(first.notes.as_deref().unwrap().contains("details/HM123"));

        // Case differs from "Not Available", so the summary is kept.
        assert_eq!(events[1].guest_name, "Airbnb (Not available)");
        assert_eq!(events[1].stay, Stay::new(d("2025-04-01"), d("2025-04-01")));
        assert_eq!(events[1].notes, None);

        let timed = &events[2];
        assert_eq!(timed.guest_name, "Carla Díaz");
        assert_eq!(timed.stay, Stay::new(d("2025-04-18"), d("2025-04-19")));
    }

    #[test]
    fn not_available_summary_is_replaced() {
        let feed = "BEGIN:VCALENDAR\nVERSION:2.0\nPRODID:TEST\nBEGIN:VEVENT\nUID:x\n\
DTSTART;VALUE=DATE:20250101\nDTEND;VALUE=DATE:20250103\nSUMMARY:Airbnb (Not Available)\n\
END:VEVENT\nEND:VCALENDAR";
        let events = parse_feed(feed).unwrap();
        assert_eq!(events[0].guest_name, "Airbnb guest (01/01/2025 to 03/01/2025)");
        assert_eq!(events[0].stay, Stay::new(d("2025-01-01"), d("2025-01-02")));
    }

    #[test]
    fn same_day_end_clamps_to_start() {
        let feed = "BEGIN:VCALENDAR\nVERSION:2.0\nPRODID:TEST\nBEGIN:VEVENT\nUID:y\n\
DTSTART;VALUE=DATE:20250105\nDTEND;VALUE=DATE:20250105\nSUMMARY:Block\n\
END:VEVENT\nEND:VCALENDAR";
        let events = parse_feed(feed).unwrap();
        assert_eq!(events[0].stay, Stay::new(d("2025-01-05"), d("2025-01-05")));
    }

    #[test]
    fn empty_calendar_has_no_events() {
        let feed = "BEGIN:VCALENDAR\nVERSION:2.0\nPRODID:TEST\nEND:VCALENDAR";
        assert!(parse_feed(feed).unwrap().is_empty());
    }

    #[test]
    fn non_calendar_body_is_rejected() {
        assert!(matches!(
            parse_feed("<html>login required</html>"),
            Err(FeedError::Malformed(_))
        ));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("ñandú", 3), "ñ");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
