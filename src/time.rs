use chrono::{DateTime, Utc};

/// Single seam for "now" so tests can substitute a fixed clock without
/// reaching into every call site.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
