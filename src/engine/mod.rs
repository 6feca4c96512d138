mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{daily_availability, first_full_day, merge_days, occupancy_by_day, saturated_days};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCabinState = Arc<RwLock<CabinState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                // Non-append commands run after the batch they interrupted
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Secondary indexes ────────────────────────────────────

/// Lookups that don't need a cabin lock. Maintained by `apply_to_cabin`.
#[derive(Default)]
pub(super) struct BookingIndex {
    /// booking id → cabin id
    pub(super) cabin_of: DashMap<Ulid, Ulid>,
    /// gateway request token → booking id
    pub(super) by_token: DashMap<String, Ulid>,
    /// external calendar UID → booking id
    pub(super) by_external: DashMap<String, Ulid>,
}

impl BookingIndex {
    fn remember(&self, booking: &Booking) {
        self.cabin_of.insert(booking.id, booking.cabin_id);
        if let Some(token) = &booking.payment.request_token {
            self.by_token.insert(token.clone(), booking.id);
        }
        if let Some(uid) = &booking.external_id {
            self.by_external.insert(uid.clone(), booking.id);
        }
    }

    fn forget(&self, booking: &Booking) {
        self.cabin_of.remove(&booking.id);
        if let Some(token) = &booking.payment.request_token {
            self.by_token.remove(token);
        }
        if let Some(uid) = &booking.external_id {
            self.by_external.remove(uid);
        }
    }
}

pub struct Engine {
    pub(super) cabins: DashMap<Ulid, SharedCabinState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) index: BookingIndex,
    pub(super) sources: DashMap<Ulid, CalendarSource>,
    /// export token → link
    pub(super) links: DashMap<String, CalendarLink>,
    /// cabin id → current export token
    pub(super) cabin_links: DashMap<Ulid, String>,
    /// Mutations hold this shared for their whole duration; compaction holds
    /// it exclusively so no append lands between snapshot and swap.
    /// Always acquired before any cabin lock.
    pub(super) gate: RwLock<()>,
}

/// Apply an event to one cabin's state (no locking; caller holds the lock).
fn apply_to_cabin(cs: &mut CabinState, event: &Event, index: &BookingIndex) {
    match event {
        Event::CabinUpdated { cabin } => cs.cabin = cabin.clone(),
        Event::BookingCreated { booking } => {
            cs.insert_booking(booking.clone());
            index.remember(booking);
        }
        Event::BookingUpdated {
            booking,
            previous_cabin,
        } => {
            let id = cs.cabin.id;
            if (id == *previous_cabin || id == booking.cabin_id)
                && let Some(old) = cs.remove_booking(booking.id)
            {
                index.forget(&old);
            }
            if id == booking.cabin_id {
                cs.insert_booking(booking.clone());
                index.remember(booking);
            }
        }
        Event::BookingDeleted { id, .. } => {
            if let Some(old) = cs.remove_booking(*id) {
                index.forget(&old);
            }
        }
        // Handled at the engine level, not per cabin
        Event::CabinCreated { .. } | Event::SourceSaved { .. } | Event::LinkSaved { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            cabins: DashMap::new(),
            wal_tx,
            notify,
            index: BookingIndex::default(),
            sources: DashMap::new(),
            links: DashMap::new(),
            cabin_links: DashMap::new(),
            gate: RwLock::new(()),
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this runs inside the runtime.
        for event in &events {
            if !engine.apply_global(event) {
                continue;
            }
            for cabin_id in event.cabin_ids() {
                let Some(cs) = engine.cabin_state(&cabin_id) else {
                    tracing::warn!("replay: event for unknown cabin {cabin_id}, skipped");
                    continue;
                };
                let mut guard = cs
                    .try_write()
                    .map_err(|_| io::Error::other("replay: cabin state already locked"))?;
                apply_to_cabin(&mut guard, event, &engine.index);
            }
        }

        tracing::info!(
            "replayed {} events: {} cabins, {} bookings",
            events.len(),
            engine.cabins.len(),
            engine.index.cabin_of.len()
        );
        Ok(engine)
    }

    /// Apply the parts of an event that live outside cabin state.
    /// Returns whether the event still needs to be applied per cabin.
    fn apply_global(&self, event: &Event) -> bool {
        match event {
            Event::CabinCreated { cabin } => {
                self.cabins
                    .insert(cabin.id, Arc::new(RwLock::new(CabinState::new(cabin.clone()))));
                false
            }
            Event::SourceSaved { source } => {
                self.sources.insert(source.cabin_id, source.clone());
                false
            }
            Event::LinkSaved { link } => {
                if let Some(old) = self.cabin_links.insert(link.cabin_id, link.token.clone()) {
                    self.links.remove(&old);
                }
                self.links.insert(link.token.clone(), link.clone());
                false
            }
            _ => true,
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn cabin_state(&self, id: &Ulid) -> Option<SharedCabinState> {
        self.cabins.get(id).map(|e| e.value().clone())
    }

    pub fn cabin_of_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.index.cabin_of.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify. `guards` must hold every cabin the
    /// event touches.
    pub(super) async fn persist_and_apply(
        &self,
        guards: &mut [&mut CabinState],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for cabin_id in event.cabin_ids() {
            if let Some(cs) = guards.iter_mut().find(|cs| cs.cabin.id == cabin_id) {
                apply_to_cabin(cs, event, &self.index);
            }
        }
        self.notify.send(event);
        Ok(())
    }

    /// WAL-append + apply + notify for events with no cabin state.
    pub(super) async fn persist_global(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_global(event);
        self.notify.send(event);
        Ok(())
    }

    /// Lookup booking → cabin, acquire the cabin's write lock.
    ///
    /// The booking may move between the lookup and the lock; callers must
    /// re-read it from the guard.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<CabinState>, EngineError> {
        let cabin_id = self
            .cabin_of_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let cs = self
            .cabin_state(&cabin_id)
            .ok_or(EngineError::CabinNotFound(cabin_id))?;
        let guard = cs.write_owned().await;
        if guard.booking(*booking_id).is_none() {
            return Err(EngineError::NotFound(*booking_id));
        }
        Ok(guard)
    }
}
