//! Small shared helpers with no better home.

use chrono::Utc;

/// Compact ISO-8601 UTC timestamp (`YYYYMMDDHHMMSS`), used for HL7 `MSH-7`
/// and the file adapter's `%timestamp%` filename token (§6.1).
pub fn timestamp_compact() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}
