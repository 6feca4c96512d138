//! Calendar synchronization: pulls every enabled iCal source into the
//! engine, one source at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::ical::parse_feed;
use crate::limits::MAX_FEED_BYTES;
use crate::model::{CalendarSource, ImportOutcome};
use crate::observability::{CALENDAR_SYNC_EVENTS_TOTAL, CALENDAR_SYNC_RUNS_TOTAL};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum FetchError {
    Http(String),
    Status(u16),
    TooLarge,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Http(e) => write!(f, "could not download calendar: {e}"),
            FetchError::Status(code) => write!(f, "calendar server answered HTTP {code}"),
            FetchError::TooLarge => write!(f, "calendar larger than {MAX_FEED_BYTES} bytes"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Downloads the raw body of an iCal feed.
#[async_trait]
pub trait CalendarFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| FetchError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CalendarFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        debug!("downloading calendar from {url}");
        let mut response = self
            .client
            .get(url)
            .header("Accept", "text/calendar")
            .send()
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        if response
            .content_length()
            .is_some_and(|len| len as usize > MAX_FEED_BYTES)
        {
            return Err(FetchError::TooLarge);
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?
        {
            if body.len() + chunk.len() > MAX_FEED_BYTES {
                return Err(FetchError::TooLarge);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Counts from importing one feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportCounts {
    pub imported: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl ImportCounts {
    pub fn summary(&self) -> String {
        format!(
            "imported {} new bookings and updated {}",
            self.imported, self.updated
        )
    }
}

/// Result for one source in a sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub cabin_id: Ulid,
    pub cabin_name: Option<String>,
    pub success: bool,
    #[serde(flatten)]
    pub counts: ImportCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fetch and import one feed into `cabin_id`, without touching the
/// source's sync bookkeeping.
pub async fn import_feed(
    engine: &Engine,
    fetcher: &dyn CalendarFetcher,
    cabin_id: Ulid,
    url: &str,
) -> Result<ImportCounts, String> {
    let body = fetcher.fetch(url).await.map_err(|e| e.to_string())?;
    let events = parse_feed(&body).map_err(|e| e.to_string())?;
    debug!("processing {} events for cabin {cabin_id}", events.len());

    let mut counts = ImportCounts::default();
    for event in events {
        let uid = event.uid.clone();
        match engine.import_external(cabin_id, event).await {
            Ok(ImportOutcome::Inserted(_)) => counts.imported += 1,
            Ok(ImportOutcome::Updated(_)) => counts.updated += 1,
            Ok(ImportOutcome::Unchanged(_)) => counts.unchanged += 1,
            Err(EngineError::CabinNotFound(id)) => {
                return Err(EngineError::CabinNotFound(id).to_string());
            }
            Err(EngineError::WalError(e)) => return Err(format!("could not persist import: {e}")),
            Err(e) => {
                warn!("skipping calendar event {uid}: {e}");
                counts.skipped += 1;
            }
        }
    }

    metrics::counter!(CALENDAR_SYNC_EVENTS_TOTAL, "outcome" => "imported").increment(counts.imported as u64);
    metrics::counter!(CALENDAR_SYNC_EVENTS_TOTAL, "outcome" => "updated").increment(counts.updated as u64);
    metrics::counter!(CALENDAR_SYNC_EVENTS_TOTAL, "outcome" => "skipped").increment(counts.skipped as u64);
    Ok(counts)
}

/// Sync one source and record the outcome on it.
pub async fn sync_source(
    engine: &Engine,
    fetcher: &dyn CalendarFetcher,
    source: &CalendarSource,
) -> SourceReport {
    let cabin_name = engine.get_cabin(source.cabin_id).await.map(|c| c.name);
    let label = cabin_name.as_deref().unwrap_or("unknown cabin");
    info!("syncing calendar for {label} ({})", source.cabin_id);

    let result = import_feed(engine, fetcher, source.cabin_id, &source.url).await;
    let recorded = match &result {
        Ok(counts) => engine.record_sync(source.cabin_id, Ok(counts.summary())).await,
        Err(message) => engine.record_sync(source.cabin_id, Err(message.clone())).await,
    };
    if let Err(e) = recorded {
        error!("could not record sync result for cabin {}: {e}", source.cabin_id);
    }

    match result {
        Ok(counts) => {
            metrics::counter!(CALENDAR_SYNC_RUNS_TOTAL, "outcome" => "success").increment(1);
            info!(
                "calendar sync for {label}: {} new, {} updated",
                counts.imported, counts.updated
            );
            SourceReport {
                cabin_id: source.cabin_id,
                cabin_name,
                success: true,
                counts,
                error: None,
            }
        }
        Err(message) => {
            metrics::counter!(CALENDAR_SYNC_RUNS_TOTAL, "outcome" => "error").increment(1);
            warn!("calendar sync for {label} failed: {message}");
            SourceReport {
                cabin_id: source.cabin_id,
                cabin_name,
                success: false,
                counts: ImportCounts::default(),
                error: Some(message),
            }
        }
    }
}

/// Sync every enabled source sequentially. A failing source is recorded
/// and does not stop the others.
pub async fn sync_all(engine: &Engine, fetcher: &dyn CalendarFetcher) -> Vec<SourceReport> {
    let sources = engine.list_sources(true);
    info!("found {} calendar sources to sync", sources.len());
    let mut reports = Vec::with_capacity(sources.len());
    for source in &sources {
        reports.push(sync_source(engine, fetcher, source).await);
    }
    reports
}

/// Background task for deployments without an external cron.
pub async fn run_periodic_sync(engine: Arc<Engine>, fetcher: Arc<dyn CalendarFetcher>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // First tick fires immediately; skip it so startup stays quick.
    interval.tick().await;
    loop {
        interval.tick().await;
        let reports = sync_all(&engine, fetcher.as_ref()).await;
        let failed = reports.iter().filter(|r| !r.success).count();
        info!("periodic calendar sync done: {} sources, {failed} failed", reports.len());
    }
}
