//! Session identity: user id, E.164 phone number, and the composite key.
//!
//! A session is identified by `(user id, phone number)` across every
//! component: the pool, the coordinator's ownership records, the session
//! store's blob paths, and the external projection.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// An application-level user identifier.
///
/// User ids are used as path segments in storage layouts, so separators
/// and whitespace are rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidUserId`] if the id is empty or contains
    /// `/`, `\`, or whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        if id.is_empty() || id.chars().any(|c| c == '/' || c == '\\' || c.is_whitespace()) {
            return Err(CoreError::InvalidUserId(id));
        }
        Ok(Self(id))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A phone number normalized to E.164 (`+` followed by 7-15 digits).
///
/// Construction strips formatting characters (spaces, dashes, dots,
/// parentheses) and converts an international `00` prefix to `+`. Anything
/// that does not normalize to digits is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Parse and normalize a phone number to E.164.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPhoneNumber`] if the input contains
    /// non-digit characters after formatting is stripped, or if the digit
    /// count is outside 7-15.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let stripped: String = raw
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
            .collect();

        let digits = if let Some(rest) = stripped.strip_prefix('+') {
            rest.to_string()
        } else if let Some(rest) = stripped.strip_prefix("00") {
            rest.to_string()
        } else {
            stripped
        };

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(CoreError::InvalidPhoneNumber(raw.to_string()));
        }
        if !(7..=15).contains(&digits.len()) {
            return Err(CoreError::InvalidPhoneNumber(raw.to_string()));
        }

        Ok(Self(format!("+{digits}")))
    }

    /// The normalized number, including the leading `+`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The digits without the leading `+`, used in storage path segments.
    #[must_use]
    pub fn digits(&self) -> &str {
        self.0.trim_start_matches('+')
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PhoneNumber {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The unique identity of a session: `(user id, phone number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    /// Owning user.
    pub user_id: UserId,
    /// Phone number in E.164.
    pub phone: PhoneNumber,
}

impl SessionKey {
    /// Create a session key.
    #[must_use]
    pub fn new(user_id: UserId, phone: PhoneNumber) -> Self {
        Self { user_id, phone }
    }

    /// Parse a key from raw strings.
    ///
    /// # Errors
    ///
    /// Returns a [`CoreError`] if either part fails validation.
    pub fn parse(user_id: &str, phone: &str) -> Result<Self, CoreError> {
        Ok(Self {
            user_id: UserId::new(user_id)?,
            phone: PhoneNumber::parse(phone)?,
        })
    }

    /// Path segments for storage layouts: `(<user>, <digits>)`.
    #[must_use]
    pub fn path_segments(&self) -> (&str, &str) {
        (self.user_id.as_str(), self.phone.digits())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.phone)
    }
}
