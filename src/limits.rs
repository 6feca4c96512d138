pub const MAX_CABINS: usize = 1_000;
pub const MAX_BOOKINGS_PER_CABIN: usize = 50_000;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 40;
pub const MAX_NOTES_LEN: usize = 4_000;
pub const MAX_LOCATION_LEN: usize = 64;
pub const MAX_URL_LEN: usize = 2_048;

/// Longest stay a single booking may cover.
pub const MAX_STAY_DAYS: i64 = 366;
/// Widest window an availability query may ask for.
pub const MAX_QUERY_DAYS: i64 = 731;

/// Years accepted in booking dates.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2100;

/// Events accepted from one iCal feed in a single sync.
pub const MAX_FEED_EVENTS: usize = 5_000;
/// Largest iCal body fetched from a source.
pub const MAX_FEED_BYTES: usize = 5 * 1024 * 1024;
