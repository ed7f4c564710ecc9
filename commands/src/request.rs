//! Request shapes accepted at the command boundary.
//!
//! Field names follow the JSON the front end sends (`userID`, `accommodationID`,
//! `joinedAt`, ...). Timestamps arrive as text in
//! [`TIME_LAYOUT`](stayflow_core::activity::TIME_LAYOUT) and are parsed during validation.
//! Every request may carry an `expectedSequence` hint; a negative hint (the default)
//! means "append unconditionally".

use crate::error::{Result, WriteError};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use stayflow_core::activity::{self, UserJoined, UserLeft, UserRated, UserReserved};

/// Hint value meaning "no expectation".
pub const NO_EXPECTATION: i64 = -1;

const fn no_expectation() -> i64 {
    NO_EXPECTATION
}

fn required(field: &'static str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(WriteError::invalid(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn timestamp(field: &'static str, value: &str) -> Result<NaiveDateTime> {
    activity::parse_timestamp(value.trim()).map_err(|error| {
        WriteError::invalid(
            field,
            format!("{value:?} does not match {}: {error}", activity::TIME_LAYOUT),
        )
    })
}

/// A user opened an accommodation page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJoinedRequest {
    /// Who
    #[serde(rename = "userID")]
    pub user_id: String,
    /// Which accommodation
    #[serde(rename = "accommodationID")]
    pub accommodation_id: String,
    /// When, e.g. `2024-01-01 10:00`
    #[serde(rename = "joinedAt")]
    pub joined_at: String,
    /// Session id shared with the matching leave
    #[serde(rename = "customUUID")]
    pub custom_uuid: String,
    /// Expected last sequence of the accommodation's stream
    #[serde(rename = "expectedSequence", default = "no_expectation")]
    pub expected_sequence: i64,
}

impl UserJoinedRequest {
    /// Check the request and build the event it records.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Validation`] for empty ids or a malformed timestamp.
    pub fn validate(&self) -> Result<UserJoined> {
        Ok(UserJoined {
            user_id: required("userID", &self.user_id)?,
            accommodation_id: required("accommodationID", &self.accommodation_id)?,
            correlation_id: required("customUUID", &self.custom_uuid)?,
            joined_at: timestamp("joinedAt", &self.joined_at)?,
        })
    }
}

/// A user left an accommodation page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLeftRequest {
    /// Who
    #[serde(rename = "userID")]
    pub user_id: String,
    /// Which accommodation
    #[serde(rename = "accommodationID")]
    pub accommodation_id: String,
    /// When, e.g. `2024-01-01 10:30`
    #[serde(rename = "leftAt")]
    pub left_at: String,
    /// Session id of the matching join
    #[serde(rename = "customUUID")]
    pub custom_uuid: String,
    /// Expected last sequence of the accommodation's stream
    #[serde(rename = "expectedSequence", default = "no_expectation")]
    pub expected_sequence: i64,
}

impl UserLeftRequest {
    /// Check the request and build the event it records.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Validation`] for empty ids or a malformed timestamp.
    pub fn validate(&self) -> Result<UserLeft> {
        Ok(UserLeft {
            user_id: required("userID", &self.user_id)?,
            accommodation_id: required("accommodationID", &self.accommodation_id)?,
            correlation_id: required("customUUID", &self.custom_uuid)?,
            left_at: timestamp("leftAt", &self.left_at)?,
        })
    }
}

/// A user reserved an accommodation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserReservedRequest {
    /// Who
    #[serde(rename = "userID")]
    pub user_id: String,
    /// Which accommodation
    #[serde(rename = "accommodationID")]
    pub accommodation_id: String,
    /// When
    #[serde(rename = "reservedAt")]
    pub reserved_at: String,
    /// Expected last sequence of the accommodation's stream
    #[serde(rename = "expectedSequence", default = "no_expectation")]
    pub expected_sequence: i64,
}

impl UserReservedRequest {
    /// Check the request and build the event it records.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Validation`] for empty ids or a malformed timestamp.
    pub fn validate(&self) -> Result<UserReserved> {
        Ok(UserReserved {
            user_id: required("userID", &self.user_id)?,
            accommodation_id: required("accommodationID", &self.accommodation_id)?,
            reserved_at: timestamp("reservedAt", &self.reserved_at)?,
        })
    }
}

/// A user rated an accommodation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRatedRequest {
    /// Who
    #[serde(rename = "userID")]
    pub user_id: String,
    /// Which accommodation
    #[serde(rename = "accommodationID")]
    pub accommodation_id: String,
    /// When
    #[serde(rename = "ratedAt")]
    pub rated_at: String,
    /// Expected last sequence of the accommodation's stream
    #[serde(rename = "expectedSequence", default = "no_expectation")]
    pub expected_sequence: i64,
}

impl UserRatedRequest {
    /// Check the request and build the event it records.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Validation`] for empty ids or a malformed timestamp.
    pub fn validate(&self) -> Result<UserRated> {
        Ok(UserRated {
            user_id: required("userID", &self.user_id)?,
            accommodation_id: required("accommodationID", &self.accommodation_id)?,
            rated_at: timestamp("ratedAt", &self.rated_at)?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn joined_request_reads_front_end_json() {
        let request: UserJoinedRequest = serde_json::from_str(
            r#"{"userID":"u1","accommodationID":"A1","joinedAt":"2024-01-01 10:00","customUUID":"S1"}"#,
        )
        .unwrap();

        assert_eq!(request.expected_sequence, NO_EXPECTATION);
        let event = request.validate().unwrap();
        assert_eq!(event.correlation_id, "S1");
        assert_eq!(
            event.joined_at,
            activity::parse_timestamp("2024-01-01 10:00").unwrap()
        );
    }

    #[test]
    fn explicit_hint_is_kept() {
        let request: UserRatedRequest = serde_json::from_str(
            r#"{"userID":"u1","accommodationID":"A1","ratedAt":"2024-01-01 10:00","expectedSequence":4}"#,
        )
        .unwrap();
        assert_eq!(request.expected_sequence, 4);
    }

    #[test]
    fn ids_are_trimmed_and_required() {
        let request = UserReservedRequest {
            user_id: "  u1 ".to_string(),
            accommodation_id: "   ".to_string(),
            reserved_at: "2024-01-01 10:00".to_string(),
            expected_sequence: NO_EXPECTATION,
        };

        let error = request.validate().unwrap_err();
        assert_eq!(
            error,
            WriteError::Validation {
                field: "accommodationID",
                reason: "must not be empty".to_string(),
            }
        );
    }

    #[test]
    fn left_without_session_is_rejected() {
        let request = UserLeftRequest {
            user_id: "u1".to_string(),
            accommodation_id: "A1".to_string(),
            left_at: "2024-01-01 10:30".to_string(),
            custom_uuid: String::new(),
            expected_sequence: NO_EXPECTATION,
        };
        assert!(matches!(
            request.validate(),
            Err(WriteError::Validation { field: "customUUID", .. })
        ));
    }

    #[test]
    fn timestamp_layout_is_enforced() {
        let request = UserRatedRequest {
            user_id: "u1".to_string(),
            accommodation_id: "A1".to_string(),
            rated_at: "2024-01-01T10:00:00Z".to_string(),
            expected_sequence: NO_EXPECTATION,
        };
        let error = request.validate().unwrap_err();
        assert_eq!(error.status_code(), 400);
        assert!(error.to_string().starts_with("Invalid ratedAt"));
    }
}
