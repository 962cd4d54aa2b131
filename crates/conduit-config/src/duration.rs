//! Human-readable duration fields (`"1s"`, `"2m30s"`, `"30d"`)

use std::time::Duration;

use serde::{Deserialize, Deserializer, de};

/// Deserialize a duration string with `duration-str`
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(de::Error::custom)
}

/// Deserialize an optional duration string
pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| parse(&raw).map_err(de::Error::custom))
        .transpose()
}

fn parse(raw: &str) -> Result<Duration, String> {
    duration_str::parse(raw.trim()).map_err(|e| format!("invalid duration '{raw}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Holder {
        #[serde(deserialize_with = "super::deserialize")]
        every: Duration,
    }

    #[test]
    fn parses_compound_durations() {
        let holder: Holder = toml::from_str("every = \"2m30s\"").unwrap();
        assert_eq!(holder.every, Duration::from_secs(150));
    }

    #[test]
    fn zero_is_allowed() {
        let holder: Holder = toml::from_str("every = \"0s\"").unwrap();
        assert_eq!(holder.every, Duration::ZERO);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(toml::from_str::<Holder>("every = \"soon\"").is_err());
    }
}
