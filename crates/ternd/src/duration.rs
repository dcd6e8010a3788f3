//! serde support for `Duration` fields in the configuration file.
//! Strings are parsed by humantime (`"30s"`, `"1h 30m"`); bare numbers
//! are taken to be seconds.
use serde::{Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&humantime::format_duration(*duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;

    impl serde::de::Visitor<'_> for Visitor {
        type Value = Duration;

        fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
            fmt.write_str("a duration such as \"30s\", or a number of seconds")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Duration, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
        where
            E: serde::de::Error,
        {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::invalid_value(serde::de::Unexpected::Signed(v), &self))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
        where
            E: serde::de::Error,
        {
            Duration::try_from_secs_f64(v)
                .map_err(|_| E::invalid_value(serde::de::Unexpected::Float(v), &self))
        }

        fn visit_str<E>(self, v: &str) -> Result<Duration, E>
        where
            E: serde::de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
        }
    }

    deserializer.deserialize_any(Visitor)
}
