use derive_more::{Deref, Display};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Short uppercase token identifying a logical sensor or actuator channel,
/// e.g. `TEMP`, `LOAD` or `SERVO`.
///
/// Keys are normalized to uppercase on creation so lookups are insensitive
/// to how the key was spelled in configuration.
///
/// ```
/// use stm_sensor_link::models::sensor_key::SensorKey;
/// let key = SensorKey::try_from("temp").expect("Failed to create sensor key.");
/// assert_eq!(key.as_str(), "TEMP");
/// ```
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Deref, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct SensorKey(String);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SensorKeyError {
    #[error("Sensor key can't be empty.")]
    Empty,

    #[error("Sensor key contains invalid character '{0}'.")]
    InvalidCharacter(char),
}

impl SensorKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `line` starts with this key, ignoring ASCII case.
    pub fn is_prefix_of(&self, line: &str) -> bool {
        line.len() >= self.0.len()
            && line.is_char_boundary(self.0.len())
            && line[..self.0.len()].eq_ignore_ascii_case(&self.0)
    }
}

impl TryFrom<&str> for SensorKey {
    type Error = SensorKeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value.is_empty() {
            return Err(SensorKeyError::Empty);
        }
        if let Some(c) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(SensorKeyError::InvalidCharacter(c));
        }
        Ok(Self(value.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for SensorKey {
    type Error = SensorKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<SensorKey> for String {
    fn from(value: SensorKey) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_normalized_to_uppercase() {
        let key = SensorKey::try_from(" load ").expect("Failed to create sensor key.");
        assert_eq!(key.as_str(), "LOAD");
        assert_eq!(key.to_string(), "LOAD");
    }

    #[test]
    fn test_invalid_keys_are_rejected() {
        assert_eq!(SensorKey::try_from("   "), Err(SensorKeyError::Empty));
        assert_eq!(
            SensorKey::try_from("TE MP"),
            Err(SensorKeyError::InvalidCharacter(' '))
        );
        assert_eq!(
            SensorKey::try_from("CUR="),
            Err(SensorKeyError::InvalidCharacter('='))
        );
    }

    #[test]
    fn test_prefix_match_ignores_case() {
        let key = SensorKey::try_from("TEMP").expect("Failed to create sensor key.");
        assert!(key.is_prefix_of("temp=21.5"));
        assert!(key.is_prefix_of("TEMP CUR=3"));
        assert!(!key.is_prefix_of("TEM"));
        assert!(!key.is_prefix_of("LOAD TEMP"));
        assert!(!key.is_prefix_of("TEMÜ"));
    }
}
