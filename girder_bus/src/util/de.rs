use serde::{Deserialize, Deserializer, de::Error};
use std::time::Duration;

/// Deserializes a [`Duration`] from a human-readable string like `"5s"` or
/// `"250ms"`.
pub(crate) fn humantime_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;

    humantime::parse_duration(&text).map_err(Error::custom)
}
