//! ISO 3166 alpha-2 country codes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A two-letter ISO 3166 alpha-2 country code, stored lowercase.
///
/// The proxy vendor API and the fallback oracle both speak lowercase
/// alpha-2 codes, so that is the canonical form here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountryCode([u8; 2]);

impl CountryCode {
    /// Parse a country code, accepting either case.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidCountryCode`] unless the input is exactly
    /// two ASCII letters.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim();
        let mut chars = trimmed.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(a), Some(b), None) if a.is_ascii_alphabetic() && b.is_ascii_alphabetic() => {
                Ok(Self([
                    a.to_ascii_lowercase() as u8,
                    b.to_ascii_lowercase() as u8,
                ]))
            }
            _ => Err(CoreError::InvalidCountryCode(raw.to_string())),
        }
    }

    /// The lowercase alpha-2 code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Construction guarantees ASCII.
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CountryCode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CountryCode {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CountryCode> for String {
    fn from(value: CountryCode) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lowercases() {
        assert_eq!(CountryCode::parse("US").unwrap().as_str(), "us");
        assert_eq!(CountryCode::parse("nl").unwrap().as_str(), "nl");
    }

    #[test]
    fn test_parse_trims() {
        assert_eq!(CountryCode::parse(" be \n").unwrap().as_str(), "be");
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(CountryCode::parse("usa").is_err());
        assert!(CountryCode::parse("u").is_err());
        assert!(CountryCode::parse("u1").is_err());
        assert!(CountryCode::parse("").is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let c = CountryCode::parse("de").unwrap();
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\"de\"");
        let back: CountryCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
