//! Serde adapter for `Duration` fields that accepts either an integer
//! number of seconds or a humantime string such as "20s" or "5m".

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

pub struct Wrap<T>(T);

pub fn serialize<T, S>(d: &T, s: S) -> Result<S::Ok, S::Error>
where
    for<'a> Wrap<&'a T>: Serialize,
    S: Serializer,
{
    Wrap(d).serialize(s)
}

pub fn deserialize<'a, T, D>(d: D) -> Result<T, D::Error>
where
    Wrap<T>: Deserialize<'a>,
    D: Deserializer<'a>,
{
    Wrap::deserialize(d).map(|w| w.0)
}

impl<'de> Deserialize<'de> for Wrap<Duration> {
    fn deserialize<D>(d: D) -> Result<Wrap<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = Duration;

            fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
                fmt.write_str("a duration")
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
                v.try_into().map(Duration::from_secs).map_err(|_| {
                    E::custom("duration must be a positive number of seconds or a string")
                })
            }

            fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                Ok(Duration::from_secs_f64(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                humantime::parse_duration(v)
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
            }
        }

        d.deserialize_any(V).map(Wrap)
    }
}

impl Serialize for Wrap<&Duration> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*self.0).to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "crate::duration_serde")]
        d: Duration,
    }

    #[test]
    fn accepts_seconds_and_strings() {
        let h: Holder = serde_json::from_str(r#"{"d": 20}"#).unwrap();
        assert_eq!(h.d, Duration::from_secs(20));

        let h: Holder = serde_json::from_str(r#"{"d": "5m"}"#).unwrap();
        assert_eq!(h.d, Duration::from_secs(300));

        let out = serde_json::to_string(&Holder {
            d: Duration::from_secs(90),
        })
        .unwrap();
        assert_eq!(out, r#"{"d":"1m 30s"}"#);
    }
}
