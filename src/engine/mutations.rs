use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_capacity, validate_cabin, validate_guest, validate_stay};
use super::{Engine, EngineError, WalCommand};

const LINK_TOKEN_LEN: usize = 32;

fn validate_notes(notes: &Option<String>) -> Result<(), EngineError> {
    match notes {
        Some(n) if n.len() > MAX_NOTES_LEN => Err(EngineError::LimitExceeded("notes too long")),
        _ => Ok(()),
    }
}

impl Engine {
    // ── Cabins ───────────────────────────────────────────────

    pub async fn create_cabin(&self, draft: CabinDraft) -> Result<Cabin, EngineError> {
        validate_cabin(&draft.name, draft.capacity, &draft.location)?;
        let _gate = self.gate.read().await;
        if self.cabins.len() >= MAX_CABINS {
            return Err(EngineError::LimitExceeded("too many cabins"));
        }

        let cabin = Cabin {
            id: Ulid::new(),
            name: draft.name,
            nightly_price: draft.nightly_price,
            capacity: draft.capacity,
            location: draft.location,
        };
        let event = Event::CabinCreated { cabin: cabin.clone() };
        self.wal_append(&event).await?;
        self.cabins
            .insert(cabin.id, Arc::new(RwLock::new(CabinState::new(cabin.clone()))));
        self.notify.send(&event);
        Ok(cabin)
    }

    /// Replace a cabin's attributes. Lowering capacity below the current
    /// occupancy is allowed; existing bookings are kept.
    pub async fn update_cabin(&self, id: Ulid, draft: CabinDraft) -> Result<Cabin, EngineError> {
        validate_cabin(&draft.name, draft.capacity, &draft.location)?;
        let _gate = self.gate.read().await;
        let cs = self.cabin_state(&id).ok_or(EngineError::CabinNotFound(id))?;
        let mut guard = cs.write().await;

        let cabin = Cabin {
            id,
            name: draft.name,
            nightly_price: draft.nightly_price,
            capacity: draft.capacity,
            location: draft.location,
        };
        let event = Event::CabinUpdated { cabin: cabin.clone() };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        Ok(cabin)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Insert a booking. Occupying bookings are capacity-checked under the
    /// cabin's write lock, so two concurrent requests can't both take the
    /// last unit.
    pub async fn create_booking(&self, new: NewBooking) -> Result<Booking, EngineError> {
        validate_stay(&new.stay)?;
        validate_guest(&new.guest)?;
        validate_notes(&new.notes)?;
        let _gate = self.gate.read().await;
        let cs = self
            .cabin_state(&new.cabin_id)
            .ok_or(EngineError::CabinNotFound(new.cabin_id))?;
        let mut guard = cs.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_CABIN {
            return Err(EngineError::LimitExceeded("too many bookings on cabin"));
        }
        if new.status.occupies() {
            check_capacity(&guard, &new.stay, None)?;
        }

        let now = Utc::now();
        let booking = Booking {
            id: Ulid::new(),
            cabin_id: new.cabin_id,
            guest: new.guest,
            stay: new.stay,
            status: new.status,
            amount: new.amount,
            source: new.source,
            external_id: None,
            notes: new.notes,
            payment: PaymentInfo::default(),
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated { booking: booking.clone() };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "source" => booking.source.as_str())
            .increment(1);
        Ok(booking)
    }

    /// Remember the gateway session created for a booking.
    pub async fn attach_payment_session(
        &self,
        id: Ulid,
        request_token: String,
        process_url: String,
    ) -> Result<Booking, EngineError> {
        let _gate = self.gate.read().await;
        if let Some(owner) = self.index.by_token.get(&request_token)
            && *owner.value() != id
        {
            return Err(EngineError::Duplicate(request_token));
        }
        let mut guard = self.resolve_booking_write(&id).await?;
        let mut booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        booking.payment.request_token = Some(request_token);
        booking.payment.process_url = Some(process_url);
        booking.updated_at = Utc::now();

        let event = Event::BookingUpdated {
            previous_cabin: booking.cabin_id,
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        Ok(booking)
    }

    /// Move a booking to the status the gateway reported.
    ///
    /// Never fails on a disallowed move: the booking comes back unchanged
    /// with `Transition::Ignored`. Re-delivering the same update writes
    /// nothing.
    pub async fn apply_payment(
        &self,
        id: Ulid,
        update: PaymentUpdate,
    ) -> Result<(Booking, Transition), EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;

        let transition = current.status.transition(update.status);
        metrics::counter!(
            observability::PAYMENT_TRANSITIONS_TOTAL,
            "outcome" => transition_label(transition)
        )
        .increment(1);
        if transition == Transition::Ignored {
            tracing::warn!(
                "booking {id}: ignoring {} -> {} transition",
                current.status,
                update.status
            );
            return Ok((current, transition));
        }

        let now = Utc::now();
        let mut next = current.clone();
        let payment = &mut next.payment;
        if update.gateway_status.is_some() {
            payment.gateway_status = update.gateway_status;
        }
        if update.reason.is_some() {
            payment.reason = update.reason;
        }
        if update.details.is_some() {
            payment.details = update.details;
        }
        if update.internal_reference.is_some() {
            payment.internal_reference = update.internal_reference;
        }
        if transition == Transition::Applied {
            next.status = update.status;
            match update.status {
                BookingStatus::Confirmed => {
                    next.payment.confirmed_at = Some(now);
                    next.payment.payment_date = update.date.or_else(|| Some(now.to_rfc3339()));
                }
                BookingStatus::Refunded => {
                    next.payment.refund_date = update.date.or_else(|| Some(now.to_rfc3339()));
                }
                BookingStatus::Pending | BookingStatus::Failed => {}
            }
        }
        if next == current {
            return Ok((current, transition));
        }
        next.updated_at = now;

        let event = Event::BookingUpdated {
            previous_cabin: next.cabin_id,
            booking: next.clone(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        if transition == Transition::Applied {
            tracing::info!("booking {id}: {} -> {}", current.status, next.status);
        }
        Ok((next, transition))
    }

    /// Administrator edit. May move the booking to another cabin; the target
    /// is capacity-checked when the booking occupies days.
    pub async fn update_booking(&self, id: Ulid, edit: BookingEdit) -> Result<Booking, EngineError> {
        validate_stay(&edit.stay)?;
        validate_guest(&edit.guest)?;
        validate_notes(&edit.notes)?;
        let _gate = self.gate.read().await;

        let from = self.cabin_of_booking(&id).ok_or(EngineError::NotFound(id))?;
        let to = edit.cabin_id;
        let from_cs = self.cabin_state(&from).ok_or(EngineError::CabinNotFound(from))?;

        if from == to {
            let mut guard = from_cs.write().await;
            let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
            if current.status.occupies() {
                check_capacity(&guard, &edit.stay, Some(id))?;
            }
            let updated = apply_edit(current, edit);
            let event = Event::BookingUpdated {
                previous_cabin: from,
                booking: updated.clone(),
            };
            self.persist_and_apply(&mut [&mut *guard], &event).await?;
            return Ok(updated);
        }

        let to_cs = self.cabin_state(&to).ok_or(EngineError::CabinNotFound(to))?;
        // Acquire write locks in sorted order to prevent deadlocks.
        let (mut from_guard, mut to_guard) = if from < to {
            let f = from_cs.write_owned().await;
            let t = to_cs.write_owned().await;
            (f, t)
        } else {
            let t = to_cs.write_owned().await;
            let f = from_cs.write_owned().await;
            (f, t)
        };

        let current = from_guard
            .booking(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if to_guard.bookings.len() >= MAX_BOOKINGS_PER_CABIN {
            return Err(EngineError::LimitExceeded("too many bookings on cabin"));
        }
        if current.status.occupies() {
            check_capacity(&to_guard, &edit.stay, None)?;
        }
        let updated = apply_edit(current, edit);
        let event = Event::BookingUpdated {
            previous_cabin: from,
            booking: updated.clone(),
        };
        self.persist_and_apply(&mut [&mut *from_guard, &mut *to_guard], &event)
            .await?;
        Ok(updated)
    }

    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        let event = Event::BookingDeleted {
            id,
            cabin_id: booking.cabin_id,
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        Ok(booking)
    }

    /// Mirror one external calendar event. The external calendar is
    /// authoritative: no capacity check, and a known UID takes the feed's
    /// dates.
    pub async fn import_external(
        &self,
        cabin_id: Ulid,
        ext: ExternalEvent,
    ) -> Result<ImportOutcome, EngineError> {
        validate_stay(&ext.stay)?;
        let _gate = self.gate.read().await;

        if let Some(existing) = self.index.by_external.get(&ext.uid).map(|e| *e.value()) {
            let mut guard = self.resolve_booking_write(&existing).await?;
            let current = guard
                .booking(existing)
                .cloned()
                .ok_or(EngineError::NotFound(existing))?;
            if current.stay == ext.stay {
                return Ok(ImportOutcome::Unchanged(current));
            }
            let mut next = current;
            next.stay = ext.stay;
            next.updated_at = Utc::now();
            let event = Event::BookingUpdated {
                previous_cabin: next.cabin_id,
                booking: next.clone(),
            };
            self.persist_and_apply(&mut [&mut *guard], &event).await?;
            return Ok(ImportOutcome::Updated(next));
        }

        let cs = self
            .cabin_state(&cabin_id)
            .ok_or(EngineError::CabinNotFound(cabin_id))?;
        let mut guard = cs.write().await;
        // A concurrent sync may have inserted it while we waited
        if self.index.by_external.contains_key(&ext.uid) {
            return Err(EngineError::Duplicate(ext.uid));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_CABIN {
            return Err(EngineError::LimitExceeded("too many bookings on cabin"));
        }

        let now = Utc::now();
        let mut guest_name = ext.guest_name;
        guest_name.truncate(floor_char_boundary(&guest_name, MAX_NAME_LEN));
        let mut notes = ext.notes;
        if let Some(n) = notes.as_mut() {
            n.truncate(floor_char_boundary(n, MAX_NOTES_LEN));
        }
        let booking = Booking {
            id: Ulid::new(),
            cabin_id,
            guest: Guest {
                name: guest_name,
                email: IMPORTED_GUEST_EMAIL.into(),
                phone: IMPORTED_GUEST_PHONE.into(),
                document: None,
                document_type: None,
            },
            stay: ext.stay,
            status: BookingStatus::Confirmed,
            amount: None,
            source: BookingSource::Airbnb,
            external_id: Some(ext.uid),
            notes,
            payment: PaymentInfo::default(),
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated { booking: booking.clone() };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "source" => "airbnb").increment(1);
        Ok(ImportOutcome::Inserted(booking))
    }

    /// Pending direct bookings created at or before `now - ttl`.
    /// Uses `try_read`, so a cabin busy with a write is skipped this round.
    pub fn collect_expired_pending(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<Ulid> {
        let cutoff = now - ttl;
        let mut expired = Vec::new();
        for entry in self.cabins.iter() {
            let cs = entry.value().clone();
            if let Ok(guard) = cs.try_read() {
                expired.extend(
                    guard
                        .bookings
                        .iter()
                        .filter(|b| {
                            b.status == BookingStatus::Pending
                                && b.source == BookingSource::Direct
                                && b.created_at <= cutoff
                        })
                        .map(|b| b.id),
                );
            }
        }
        expired
    }

    // ── Calendar sources & export links ──────────────────────

    /// Create or replace the iCal source of a cabin. Sync history is kept
    /// when the URL is unchanged.
    pub async fn save_source(&self, cabin_id: Ulid, url: String) -> Result<CalendarSource, EngineError> {
        if url.len() > MAX_URL_LEN {
            return Err(EngineError::LimitExceeded("calendar URL too long"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(EngineError::Invalid("calendar URL must be http or https"));
        }
        let _gate = self.gate.read().await;
        let cs = self
            .cabin_state(&cabin_id)
            .ok_or(EngineError::CabinNotFound(cabin_id))?;
        // Serializes source writes per cabin
        let _guard = cs.write().await;

        let source = match self.sources.get(&cabin_id).map(|s| s.value().clone()) {
            Some(existing) if existing.url == url => CalendarSource {
                enabled: true,
                ..existing
            },
            _ => CalendarSource {
                cabin_id,
                url,
                enabled: true,
                last_synced: None,
                last_sync_attempt: None,
                sync_status: None,
                sync_message: None,
            },
        };
        self.persist_global(&Event::SourceSaved { source: source.clone() })
            .await?;
        Ok(source)
    }

    pub async fn set_source_enabled(
        &self,
        cabin_id: Ulid,
        enabled: bool,
    ) -> Result<CalendarSource, EngineError> {
        let _gate = self.gate.read().await;
        let cs = self
            .cabin_state(&cabin_id)
            .ok_or(EngineError::CabinNotFound(cabin_id))?;
        let _guard = cs.write().await;
        let mut source = self
            .sources
            .get(&cabin_id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::SourceNotFound(cabin_id))?;
        if source.enabled == enabled {
            return Ok(source);
        }
        source.enabled = enabled;
        self.persist_global(&Event::SourceSaved { source: source.clone() })
            .await?;
        Ok(source)
    }

    /// Record the outcome of one sync run: `Ok(summary)` or `Err(message)`.
    pub async fn record_sync(
        &self,
        cabin_id: Ulid,
        outcome: Result<String, String>,
    ) -> Result<CalendarSource, EngineError> {
        let _gate = self.gate.read().await;
        let cs = self
            .cabin_state(&cabin_id)
            .ok_or(EngineError::CabinNotFound(cabin_id))?;
        let _guard = cs.write().await;
        let mut source = self
            .sources
            .get(&cabin_id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::SourceNotFound(cabin_id))?;

        let now = Utc::now();
        source.last_sync_attempt = Some(now);
        match outcome {
            Ok(message) => {
                source.last_synced = Some(now);
                source.sync_status = Some(SyncStatus::Success);
                source.sync_message = Some(message);
            }
            Err(message) => {
                source.sync_status = Some(SyncStatus::Error);
                source.sync_message = Some(message);
            }
        }
        self.persist_global(&Event::SourceSaved { source: source.clone() })
            .await?;
        Ok(source)
    }

    /// Generate a fresh export token for a cabin, replacing the old one.
    pub async fn create_link(&self, cabin_id: Ulid) -> Result<CalendarLink, EngineError> {
        let _gate = self.gate.read().await;
        let cs = self
            .cabin_state(&cabin_id)
            .ok_or(EngineError::CabinNotFound(cabin_id))?;
        let _guard = cs.write().await;

        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(LINK_TOKEN_LEN)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        let link = CalendarLink {
            cabin_id,
            token,
            created_at: Utc::now(),
        };
        self.persist_global(&Event::LinkSaved { link: link.clone() })
            .await?;
        Ok(link)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;

        let mut events = Vec::new();
        let cabins: Vec<_> = self.cabins.iter().map(|e| e.value().clone()).collect();
        for cs in cabins {
            let guard = cs.read().await;
            events.push(Event::CabinCreated {
                cabin: guard.cabin.clone(),
            });
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated { booking: b.clone() }));
        }
        events.extend(
            self.sources
                .iter()
                .map(|s| Event::SourceSaved { source: s.value().clone() }),
        );
        events.extend(
            self.links
                .iter()
                .map(|l| Event::LinkSaved { link: l.value().clone() }),
        );

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn apply_edit(mut booking: Booking, edit: BookingEdit) -> Booking {
    booking.cabin_id = edit.cabin_id;
    booking.guest = edit.guest;
    booking.stay = edit.stay;
    booking.notes = edit.notes;
    booking.updated_at = Utc::now();
    booking
}

fn transition_label(t: Transition) -> &'static str {
    match t {
        Transition::Applied => "applied",
        Transition::Unchanged => "unchanged",
        Transition::Ignored => "ignored",
    }
}

/// Largest index `<= max` that lies on a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}
