// Serde helper modules for custom serialization/deserialization
//
// This module provides shared serialization utilities used across the crate.

/// Serialize a `std::time::Duration` as whole seconds
/// Use with #[serde(with = "crate::utils::serde_helpers::duration_secs")]
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

/// Serialize a `std::time::Duration` as fractional seconds, so sub-second
/// poll intervals survive a TOML round trip
pub mod duration_secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {}",
                seconds
            )));
        }
        Ok(Duration::from_secs_f64(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct TestStruct {
        #[serde(with = "duration_secs")]
        timeout: Duration,
        #[serde(with = "duration_secs_f64")]
        interval: Duration,
    }

    #[test]
    fn test_duration_serialization() {
        let test = TestStruct {
            timeout: Duration::from_secs(7200),
            interval: Duration::from_millis(500),
        };

        let json = serde_json::to_string(&test).unwrap();
        assert_eq!(json, r#"{"timeout":7200,"interval":0.5}"#);
        let deserialized: TestStruct = serde_json::from_str(&json).unwrap();

        assert_eq!(test, deserialized);
    }

    #[test]
    fn test_negative_interval_rejected() {
        let result: Result<TestStruct, _> =
            serde_json::from_str(r#"{"timeout":1,"interval":-2.0}"#);
        assert!(result.is_err());
    }
}
