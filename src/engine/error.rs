use chrono::NaiveDate;
use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    CabinNotFound(Ulid),
    SourceNotFound(Ulid),
    CapacityExceeded { day: NaiveDate, capacity: u32 },
    InvalidStay(&'static str),
    Invalid(&'static str),
    Duplicate(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::CabinNotFound(id) => write!(f, "cabin not found: {id}"),
            EngineError::SourceNotFound(id) => write!(f, "no calendar source for cabin {id}"),
            EngineError::CapacityExceeded { day, capacity } => {
                write!(f, "no availability on {day}: all {capacity} units booked")
            }
            EngineError::InvalidStay(msg) => write!(f, "invalid dates: {msg}"),
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Duplicate(key) => write!(f, "already exists: {key}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
