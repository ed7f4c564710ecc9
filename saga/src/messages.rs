//! Wire messages of the create-accommodation saga.
//!
//! Commands and replies travel as JSON:
//!
//! ```json
//! {
//!   "type": "CreateAvailability",
//!   "payload": { "accommodationId": "A1", "location": "Novi Sad", "dateRange": [ ... ] },
//!   "correlationId": "9b2c...",
//!   "commandId": "41f0..."
//! }
//! ```
//!
//! `type` is written as the variant name. Readers also accept the numeric codes older
//! peers send (declaration order, starting at 0). Anything unrecognised decodes as
//! [`CommandType::UnknownCommand`] / [`ReplyType::UnknownReply`] instead of failing.

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use stayflow_core::channel::{ChannelError, ChannelMessage};
use std::fmt;

/// Identifies one saga instance across every command and reply it produces.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one command message; redeliveries of the same command share it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    /// Fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discriminant as it may appear on the wire.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireKind {
    Name(String),
    Code(i64),
    Other(IgnoredAny),
}

/// Commands of the create-accommodation saga.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Ask the reservations side to record the accommodation's free dates
    CreateAvailability,
    /// Reject the accommodation outright
    DenyAccommodation,
    /// Availability exists; approve the accommodation
    UpdateAccommodation,
    /// Availability failed or timed out; compensate by denying the accommodation
    RollbackAccommodation,
    /// Anything this build does not know
    UnknownCommand,
}

impl CommandType {
    /// Every known command, in wire-code order.
    pub const ALL: [Self; 5] = [
        Self::CreateAvailability,
        Self::DenyAccommodation,
        Self::UpdateAccommodation,
        Self::RollbackAccommodation,
        Self::UnknownCommand,
    ];

    /// Name written on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateAvailability => "CreateAvailability",
            Self::DenyAccommodation => "DenyAccommodation",
            Self::UpdateAccommodation => "UpdateAccommodation",
            Self::RollbackAccommodation => "RollbackAccommodation",
            Self::UnknownCommand => "UnknownCommand",
        }
    }

    /// Parse a wire name; unknown names map to [`Self::UnknownCommand`].
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .unwrap_or(Self::UnknownCommand)
    }

    /// Parse a numeric wire code; out-of-range codes map to [`Self::UnknownCommand`].
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
            .unwrap_or(Self::UnknownCommand)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CommandType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CommandType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match WireKind::deserialize(deserializer)? {
            WireKind::Name(name) => Self::from_name(&name),
            WireKind::Code(code) => Self::from_code(code),
            WireKind::Other(_) => Self::UnknownCommand,
        })
    }
}

/// Replies of the create-accommodation saga.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplyType {
    /// The participant stored the free dates
    AvailabilityCreated,
    /// The participant could not store the free dates
    AvailabilityNotCreated,
    /// The participant did not understand the command
    UnknownReply,
}

impl ReplyType {
    /// Every known reply, in wire-code order.
    pub const ALL: [Self; 3] = [
        Self::AvailabilityCreated,
        Self::AvailabilityNotCreated,
        Self::UnknownReply,
    ];

    /// Name written on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AvailabilityCreated => "AvailabilityCreated",
            Self::AvailabilityNotCreated => "AvailabilityNotCreated",
            Self::UnknownReply => "UnknownReply",
        }
    }

    /// Parse a wire name; unknown names map to [`Self::UnknownReply`].
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .unwrap_or(Self::UnknownReply)
    }

    /// Parse a numeric wire code; out-of-range codes map to [`Self::UnknownReply`].
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
            .unwrap_or(Self::UnknownReply)
    }
}

impl fmt::Display for ReplyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ReplyType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ReplyType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match WireKind::deserialize(deserializer)? {
            WireKind::Name(name) => Self::from_name(&name),
            WireKind::Code(code) => Self::from_code(code),
            WireKind::Other(_) => Self::UnknownReply,
        })
    }
}

/// One bookable date range of an accommodation and its price.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableDates {
    /// Accommodation the range belongs to
    #[serde(alias = "AccommodationId")]
    pub accommodation_id: String,
    /// Dates of the range, as sent by the client
    #[serde(alias = "DateRange")]
    pub date_range: Vec<String>,
    /// Location of the accommodation
    #[serde(alias = "Location")]
    pub location: String,
    /// Price for the range
    #[serde(alias = "Price")]
    pub price: i64,
}

/// Payload of every saga command and reply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccommodationAvailability {
    /// Accommodation being created
    #[serde(alias = "AccommodationID")]
    pub accommodation_id: String,
    /// Location of the accommodation
    #[serde(alias = "Location")]
    pub location: String,
    /// Bookable ranges with prices
    #[serde(rename = "dateRange", alias = "DateRange", default)]
    pub date_ranges: Vec<AvailableDates>,
}

/// A saga command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// What the receiver should do
    #[serde(rename = "type")]
    pub kind: CommandType,
    /// Accommodation the command is about
    pub payload: AccommodationAvailability,
    /// Saga instance the command belongs to
    pub correlation_id: CorrelationId,
    /// Id of this command; the receiver dedups on it
    pub command_id: CommandId,
}

impl Command {
    /// A new command with a fresh command id.
    #[must_use]
    pub fn new(
        kind: CommandType,
        payload: AccommodationAvailability,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            kind,
            payload,
            correlation_id,
            command_id: CommandId::new(),
        }
    }

    /// Encode for publishing on `subject`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Serialization`] if encoding fails.
    pub fn to_message(&self, subject: &str) -> Result<ChannelMessage, ChannelError> {
        ChannelMessage::json(subject, self)
    }
}

/// A saga reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    /// Outcome reported by the participant
    #[serde(rename = "type")]
    pub kind: ReplyType,
    /// The payload of the command being answered, unchanged
    pub payload: AccommodationAvailability,
    /// Saga instance the reply belongs to
    pub correlation_id: CorrelationId,
    /// Id of the command being answered
    pub command_id: CommandId,
}

impl Reply {
    /// Answer `command` with `kind`, echoing its payload and ids.
    #[must_use]
    pub fn answering(command: &Command, kind: ReplyType) -> Self {
        Self {
            kind,
            payload: command.payload.clone(),
            correlation_id: command.correlation_id.clone(),
            command_id: command.command_id.clone(),
        }
    }

    /// Encode for publishing on `subject`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Serialization`] if encoding fails.
    pub fn to_message(&self, subject: &str) -> Result<ChannelMessage, ChannelError> {
        ChannelMessage::json(subject, self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> AccommodationAvailability {
        AccommodationAvailability {
            accommodation_id: "A1".to_string(),
            location: "Novi Sad".to_string(),
            date_ranges: vec![AvailableDates {
                accommodation_id: "A1".to_string(),
                date_range: vec!["2024-07-01".to_string(), "2024-07-02".to_string()],
                location: "Novi Sad".to_string(),
                price: 120,
            }],
        }
    }

    #[test]
    fn command_wire_shape() {
        let command = Command::new(
            CommandType::CreateAvailability,
            sample_payload(),
            CorrelationId::from("c-1"),
        );

        let value = serde_json::to_value(&command).unwrap();

        assert_eq!(value["type"], "CreateAvailability");
        assert_eq!(value["correlationId"], "c-1");
        assert_eq!(value["commandId"], command.command_id.as_str());
        assert_eq!(value["payload"]["accommodationId"], "A1");
        assert_eq!(value["payload"]["dateRange"][0]["price"], 120);
        assert_eq!(value["payload"]["dateRange"][0]["dateRange"][1], "2024-07-02");
    }

    #[test]
    fn unknown_discriminants_decode_as_unknown() {
        let command: Command = serde_json::from_value(json!({
            "type": "ExplodeAccommodation",
            "payload": { "accommodationId": "A1", "location": "x" },
            "correlationId": "c-1",
            "commandId": "k-1",
        }))
        .unwrap();
        assert_eq!(command.kind, CommandType::UnknownCommand);

        let reply: Reply = serde_json::from_value(json!({
            "type": { "nested": true },
            "payload": { "accommodationId": "A1", "location": "x" },
            "correlationId": "c-1",
            "commandId": "k-1",
        }))
        .unwrap();
        assert_eq!(reply.kind, ReplyType::UnknownReply);
    }

    #[test]
    fn numeric_codes_follow_declaration_order() {
        assert_eq!(CommandType::from_code(0), CommandType::CreateAvailability);
        assert_eq!(CommandType::from_code(3), CommandType::RollbackAccommodation);
        assert_eq!(CommandType::from_code(42), CommandType::UnknownCommand);
        assert_eq!(CommandType::from_code(-1), CommandType::UnknownCommand);
        assert_eq!(ReplyType::from_code(1), ReplyType::AvailabilityNotCreated);

        let reply: Reply = serde_json::from_value(json!({
            "type": 0,
            "payload": { "accommodationId": "A1", "location": "x" },
            "correlationId": "c-1",
            "commandId": "k-1",
        }))
        .unwrap();
        assert_eq!(reply.kind, ReplyType::AvailabilityCreated);
    }

    #[test]
    fn pascal_case_payload_is_accepted() {
        let payload: AccommodationAvailability = serde_json::from_value(json!({
            "AccommodationID": "A7",
            "Location": "Zlatibor",
            "DateRange": [
                { "AccommodationId": "A7", "DateRange": ["2024-01-01"], "Location": "Zlatibor", "Price": 90 }
            ],
        }))
        .unwrap();

        assert_eq!(payload.accommodation_id, "A7");
        assert_eq!(payload.date_ranges[0].price, 90);
    }

    #[test]
    fn reply_echoes_command() {
        let command = Command::new(
            CommandType::CreateAvailability,
            sample_payload(),
            CorrelationId::new(),
        );

        let reply = Reply::answering(&command, ReplyType::AvailabilityNotCreated);

        assert_eq!(reply.payload, command.payload);
        assert_eq!(reply.correlation_id, command.correlation_id);
        assert_eq!(reply.command_id, command.command_id);
    }

    #[test]
    fn message_round_trip_through_channel_message() {
        let command = Command::new(
            CommandType::RollbackAccommodation,
            sample_payload(),
            CorrelationId::new(),
        );

        let message = command.to_message("create-accommodation.command").unwrap();

        assert_eq!(message.subject, "create-accommodation.command");
        assert_eq!(message.decode::<Command>().unwrap(), command);
    }
}
