use std::time::{Duration, Instant};

const MAX_ERROR_TEXT: usize = 500;

/// Collapse whitespace and cap length so error text stays one readable log line.
pub fn compact_error_text(raw: &str) -> String {
    let compact = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_text(&compact, MAX_ERROR_TEXT)
}

/// Truncate to at most `max` chars (not bytes).
pub fn truncate_text(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

/// Milliseconds elapsed since `started`, saturating at `u64::MAX`.
pub fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Parse a comma-separated list of non-negative millisecond values.
pub fn parse_csv_durations_ms(raw: &str) -> Option<Vec<Duration>> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>().ok().map(Duration::from_millis))
        .collect()
}
