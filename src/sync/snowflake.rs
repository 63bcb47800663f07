//! Discord snowflake conversions.
//!
//! Snowflake ids embed a millisecond timestamp relative to the Discord epoch
//! in their upper 42 bits. Converting a cutoff timestamp to a snowflake lets
//! incremental fetches be expressed as an `after` id parameter.

use chrono::{DateTime, TimeZone, Utc};

/// Discord epoch: 2015-01-01T00:00:00Z in Unix milliseconds.
pub const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

const TIMESTAMP_SHIFT: u64 = 22;

/// The smallest snowflake whose embedded timestamp is at or after `at`.
///
/// Timestamps before the Discord epoch clamp to snowflake zero.
pub fn from_timestamp(at: DateTime<Utc>) -> u64 {
    let ms = at.timestamp_millis();
    if ms <= 0 {
        return 0;
    }
    (ms as u64).saturating_sub(DISCORD_EPOCH_MS) << TIMESTAMP_SHIFT
}

/// The creation timestamp embedded in a snowflake.
pub fn to_timestamp(snowflake: u64) -> DateTime<Utc> {
    let ms = (snowflake >> TIMESTAMP_SHIFT) + DISCORD_EPOCH_MS;
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}
