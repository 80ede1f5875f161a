use serde::{Deserialize, Deserializer, de::Error};
use std::time::Duration;

/// Defines a collection of fine-tune parameters for an
/// [exponential backoff](backoff::ExponentialBackoff) mechanism.
///
/// The durations deserialize from human-readable strings (`"3s"`, `"250ms"`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(deserialize_with = "humantime_duration")]
    pub(crate) initial_interval: Duration,
    #[serde(deserialize_with = "humantime_duration")]
    pub(crate) max_interval: Duration,
    pub(crate) randomization_factor: f64,
    pub(crate) multiplier: f64,
    #[serde(deserialize_with = "optional_humantime_duration")]
    pub(crate) max_elapsed_time: Option<Duration>,
}

impl BackoffConfig {
    /// Exposes the initial interval of this exponential backoff definition.
    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    /// Exposes the max interval of this exponential backoff definition.
    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Exposes the randomization factor of this exponential backoff
    /// definition.
    pub fn randomization_factor(&self) -> f64 {
        self.randomization_factor
    }

    /// Exposes the multiplier of this exponential backoff definition.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Exposes the max elapsed time of this exponential backoff definition,
    /// after which the backoff reports being spent.
    pub fn max_elapsed_time(&self) -> Option<Duration> {
        self.max_elapsed_time
    }

    /// Re-creates this config with the given initial interval.
    pub fn with_initial_interval(self, initial_interval: Duration) -> Self {
        Self {
            initial_interval,
            ..self
        }
    }

    /// Re-creates this config with the given max interval.
    pub fn with_max_interval(self, max_interval: Duration) -> Self {
        Self {
            max_interval,
            ..self
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(3),
            max_interval: Duration::from_secs(60),
            randomization_factor: 0.5,
            multiplier: 2.0,
            max_elapsed_time: None,
        }
    }
}

impl AsRef<BackoffConfig> for BackoffConfig {
    fn as_ref(&self) -> &BackoffConfig {
        self
    }
}

fn humantime_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;

    humantime::parse_duration(&text).map_err(Error::custom)
}

fn optional_humantime_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = Option::<String>::deserialize(deserializer)?;

    match text {
        Some(text) => humantime::parse_duration(&text)
            .map(Some)
            .map_err(Error::custom),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserialize_from_empty() {
        // Given
        let input = "{}";
        let expected_output = BackoffConfig::default();

        // When
        let actual_output = serde_yml::from_str::<BackoffConfig>(input).unwrap();

        // Then
        assert_eq!(expected_output, actual_output);
    }

    #[test]
    fn deserialize_from_full() {
        // Given
        let input = r#"
initial_interval: 250ms
max_interval: 30s
randomization_factor: 0.1
multiplier: 1.5
max_elapsed_time: 5m
"#;
        let expected_output = BackoffConfig {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(30),
            randomization_factor: 0.1,
            multiplier: 1.5,
            max_elapsed_time: Some(Duration::from_secs(300)),
        };

        // When
        let actual_output = serde_yml::from_str::<BackoffConfig>(input).unwrap();

        // Then
        assert_eq!(expected_output, actual_output);
    }
}
