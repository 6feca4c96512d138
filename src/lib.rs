pub mod config;
pub mod engine;
pub mod gateway;
pub mod http;
pub mod ical;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod sync;
pub mod wal;
