//! Serde helpers for `Duration` fields in config structs.
//! Accepts either a humantime string (`"5s"`, `"1h 30m"`) or a bare
//! number of seconds; always serializes to the humantime string form.
//! Use via `#[serde(with = "duration_serde")]`.
use serde::{Deserializer, Serializer};
use std::time::Duration;

struct DurationVisitor;

impl serde::de::Visitor<'_> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str("a duration string or a number of seconds")
    }

    fn visit_str<E>(self, v: &str) -> Result<Duration, E>
    where
        E: serde::de::Error,
    {
        humantime::parse_duration(v)
            .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
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
        let secs: u64 = v.try_into().map_err(|_| {
            E::custom("duration in seconds must not be negative")
        })?;
        Ok(Duration::from_secs(secs))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
    where
        E: serde::de::Error,
    {
        if v < 0.0 {
            return Err(E::custom("duration in seconds must not be negative"));
        }
        Ok(Duration::from_secs_f64(v))
    }
}

pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    d.deserialize_any(DurationVisitor)
}

pub fn serialize<S>(duration: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&humantime::format_duration(*duration).to_string())
}

/// The same conventions, for `Option<Duration>` fields.
pub mod opt {
    use super::DurationVisitor;
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    struct OptVisitor;

    impl<'de> serde::de::Visitor<'de> for OptVisitor {
        type Value = Option<Duration>;

        fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
            fmt.write_str("an optional duration")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(None)
        }

        fn visit_some<D>(self, d: D) -> Result<Self::Value, D::Error>
        where
            D: Deserializer<'de>,
        {
            d.deserialize_any(DurationVisitor).map(Some)
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        d.deserialize_option(OptVisitor)
    }

    pub fn serialize<S>(duration: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => {
                s.serialize_str(&humantime::format_duration(*duration).to_string())
            }
            None => s.serialize_none(),
        }
    }
}
