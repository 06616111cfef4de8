use chrono::{DateTime, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Seconds since the epoch with microsecond resolution, as stored next to
/// every sample for `MostRecent` aggregation.
pub fn unix_seconds(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp_micros() as f64 / 1_000_000.0
}

pub fn now_unix_seconds() -> f64 {
    unix_seconds(&now())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn unix_seconds_keeps_sub_second_precision() {
        let dt = Utc.timestamp_opt(1_700_000_000, 250_000_000).single();
        let seconds = dt.map(|value| unix_seconds(&value));
        assert_eq!(seconds, Some(1_700_000_000.25));
    }
}
