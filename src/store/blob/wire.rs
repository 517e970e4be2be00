//! Wire-format helpers for the blob store's on-disk JSON: ISO-8601
//! duration strings and RFC3339-with-nanoseconds timestamps. `model/plan.rs`
//! reuses `iso8601_duration` for its own `Duration` fields, since the plan
//! tree round-trips through the object blob verbatim. Types that never
//! cross the storage boundary — `retry.rs`'s `RetryPolicy`, most notably —
//! keep a millisecond-integer convention instead.

pub mod iso8601_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// `PT<seconds>[.<fraction>]S`, the subset of ISO-8601 durations this
    /// crate ever produces (whole seconds plus up to millisecond fraction).
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs_f64();
        serializer.serialize_str(&format!("PT{secs}S"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    fn parse(raw: &str) -> Result<Duration, String> {
        let body = raw
            .strip_prefix("PT")
            .ok_or_else(|| format!("not an ISO-8601 duration: {raw}"))?;
        let secs_str = body
            .strip_suffix('S')
            .ok_or_else(|| format!("only second-granularity durations are supported: {raw}"))?;
        let secs: f64 = secs_str
            .parse()
            .map_err(|e| format!("invalid duration seconds {secs_str:?}: {e}"))?;
        Ok(Duration::from_secs_f64(secs))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn round_trips_through_parse() {
            assert_eq!(parse("PT30S").unwrap(), Duration::from_secs(30));
            assert_eq!(parse("PT0.5S").unwrap(), Duration::from_millis(500));
        }
    }
}

pub mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

