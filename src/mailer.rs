use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::model::{Booking, BookingSource, BookingStatus, Event};
use crate::notify::NotifyHub;
use crate::observability::EMAILS_SENT_TOTAL;

const BRAND: &str = "Atrapa Mar Cabins";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// A direct booking that was confirmed by this very update. Later edits of
/// a confirmed booking move `updated_at` past `confirmed_at`.
pub fn just_confirmed(booking: &Booking) -> bool {
    booking.status == BookingStatus::Confirmed
        && booking.source == BookingSource::Direct
        && booking.payment.confirmed_at == Some(booking.updated_at)
}

pub fn render_confirmation(booking: &Booking, cabin_name: &str) -> ConfirmationEmail {
    let name = escape_html(&booking.guest.name);
    let amount = booking
        .amount
        .map(|a| format!("${}", group_thousands(a)))
        .unwrap_or_else(|| "-".into());
    let html = format!(
        "<h2>Your booking is confirmed!</h2>\n\
<p>Hello {name},</p>\n\
<p>Your payment was processed and your booking is confirmed.</p>\n\
<h3>Booking details:</h3>\n\
<ul>\n\
<li><strong>Booking number:</strong> {id}</li>\n\
<li><strong>Cabin:</strong> {cabin}</li>\n\
<li><strong>Check-in:</strong> {start}</li>\n\
<li><strong>Check-out:</strong> {end}</li>\n\
<li><strong>Amount paid:</strong> {amount}</li>\n\
</ul>\n\
<p>See you soon at {BRAND}.</p>\n",
        id = booking.id,
        cabin = escape_html(cabin_name),
        start = booking.stay.start,
        end = booking.stay.end,
    );
    ConfirmationEmail {
        to: booking.guest.email.clone(),
        subject: format!("Booking confirmation #{} - {BRAND}", booking.id),
        html,
    }
}

/// Subscriber that prepares a confirmation email for every booking the
/// gateway confirms. Delivery is a log line; no mail transport is wired.
pub async fn run_mailer(engine: Arc<Engine>, notify: Arc<NotifyHub>) {
    let mut rx = notify.subscribe();
    loop {
        match rx.recv().await {
            Ok(Event::BookingUpdated { booking, .. }) if just_confirmed(&booking) => {
                let cabin_name = engine
                    .get_cabin(booking.cabin_id)
                    .await
                    .map(|c| c.name)
                    .unwrap_or_default();
                let email = render_confirmation(&booking, &cabin_name);
                info!(
                    "confirmation email prepared for booking {} ({} bytes): {}",
                    booking.id,
                    email.html.len(),
                    email.subject
                );
                metrics::counter!(EMAILS_SENT_TOTAL).increment(1);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!("mailer lagged, skipped {n} events"),
            Err(RecvError::Closed) => break,
        }
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            _ => out.push(c),
        }
    }
    out
}

/// `1234567` -> `1.234.567`, the Chilean grouping.
fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(c);
    }
    out
}
