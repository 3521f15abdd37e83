//! Small helpers shared by the broker crates
//!
//! ## Core Features:
//! - **Duration Conversion**: String-to-Duration parsing supporting multiple time units
//! - **Timestamp Utilities**: Millisecond timestamps and their human-readable form
//! - **Serde Helpers**: Deserializers for duration fields in configuration files
//! - **Text Tables**: [`TextTable`] for diagnostic output in logs
//!
//! ## Usage Examples:
//! ```rust
//! use rpubsub_utils::{to_duration, timestamp_millis, format_timestamp_millis};
//!
//! let duration = to_duration("1m30s");
//! assert_eq!(duration.as_secs(), 90);
//!
//! let now = timestamp_millis();
//! assert!(!format_timestamp_millis(now).is_empty());
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::{de::Deserializer, Deserialize};

mod table;

pub use table::TextTable;

/// Timestamp representation in milliseconds since Unix epoch
pub type TimestampMillis = i64;

/// Operating system process identifier
pub type Pid = u32;

/// Deserialize a duration written as `"10ms"`, `"2s"`, `"1m30s"` and so on.
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Same as [`deserialize_duration`], an empty string yields `None`.
#[inline]
pub fn deserialize_duration_option<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    if v.is_empty() {
        Ok(None)
    } else {
        Ok(Some(to_duration(&v)))
    }
}

/// Convert a compact duration string into a [`Duration`].
///
/// Supported units: `ms`, `s`, `m`, `h`, `d`, `w`. Unknown fragments count as zero.
///
/// # Example:
/// ```
/// let d = rpubsub_utils::to_duration("1h30m15s");
/// assert_eq!(d.as_secs(), 5415);
/// let d = rpubsub_utils::to_duration("250ms");
/// assert_eq!(d.as_millis(), 250);
/// ```
pub fn to_duration(text: &str) -> Duration {
    let text = text.to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().trim().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                'w' => v * 604800000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

/// Get current timestamp in milliseconds
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Milliseconds elapsed since `t`, never negative
#[inline]
pub fn elapsed_millis(t: TimestampMillis) -> i64 {
    (timestamp_millis() - t).max(0)
}

/// Format millisecond timestamp to string, empty for non-positive input
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        "".into()
    } else {
        use chrono::TimeZone;
        if let chrono::LocalResult::Single(t) = chrono::Local.timestamp_millis_opt(t) {
            t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            "".into()
        }
    }
}

/// Short local time, `MM-DD HH:MM:SS`, used where columns are narrow
#[inline]
pub fn format_timestamp_millis_short(t: TimestampMillis) -> String {
    use chrono::TimeZone;
    match chrono::Local.timestamp_millis_opt(t) {
        chrono::LocalResult::Single(t) if t.timestamp_millis() > 0 => t.format("%m-%d %H:%M:%S").to_string(),
        _ => "".into(),
    }
}

#[inline]
pub fn format_timestamp_millis_now() -> String {
    format_timestamp_millis(timestamp_millis())
}

/// Pid of the current process
#[inline]
pub fn process_id() -> Pid {
    std::process::id()
}
