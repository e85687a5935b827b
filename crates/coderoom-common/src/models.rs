use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sender id used for chat rows written on behalf of the assistant.
pub const AI_SENDER: &str = "AI";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub avatar: String,
}

impl User {
    /// Avatar reference assigned at registration when none is supplied.
    pub fn default_avatar(name: &str) -> String {
        format!("https://ui-avatars.com/api/?name={}&background=random", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub owner_id: String,
}

impl Room {
    pub fn display_name(room_id: &str) -> String {
        format!("Room {}", room_id)
    }
}

/// One roster entry. Derived from membership, user and room rows on every
/// roster-changing event; never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub avatar: String,
    pub is_owner: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActivityAction {
    #[serde(rename = "joined")]
    Joined,
    #[serde(rename = "edited code")]
    EditedCode,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::EditedCode => "edited code",
        }
    }
}

impl FromStr for ActivityAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "joined" => Ok(Self::Joined),
            "edited code" => Ok(Self::EditedCode),
            _ => Err(format!("Invalid activity action: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityRecord {
    pub id: i64,
    pub room_id: String,
    pub user_id: String,
    pub action: ActivityAction,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: i64,
    pub room_id: String,
    pub sender_id: String,
    pub message: String,
    pub timestamp: String,
}

/// A room the user belongs to, as listed on the profile view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomMembership {
    pub room_id: String,
    pub name: String,
    pub joined_at: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("room_id is required")]
    EmptyRoomId,

    #[error("message is required")]
    EmptyMessage,
}

/// Trim a client-supplied room id, rejecting empty and whitespace-only ids.
pub fn validate_room_id(room_id: &str) -> Result<&str, ValidationError> {
    let trimmed = room_id.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyRoomId);
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_action_roundtrip_str() {
        for action in [ActivityAction::Joined, ActivityAction::EditedCode] {
            assert_eq!(ActivityAction::from_str(action.as_str()).unwrap(), action);
        }
        assert!(ActivityAction::from_str("deleted").is_err());
    }

    #[test]
    fn test_activity_action_serializes_as_tag() {
        let json = serde_json::to_string(&ActivityAction::EditedCode).unwrap();
        assert_eq!(json, "\"edited code\"");
    }

    #[test]
    fn test_validate_room_id() {
        assert_eq!(validate_room_id("  abc  "), Ok("abc"));
        assert_eq!(validate_room_id(""), Err(ValidationError::EmptyRoomId));
        assert_eq!(validate_room_id(" \t\n"), Err(ValidationError::EmptyRoomId));
    }

    #[test]
    fn test_room_display_name() {
        assert_eq!(Room::display_name("x1y2"), "Room x1y2");
    }

    #[test]
    fn test_default_avatar_embeds_name() {
        assert!(User::default_avatar("ada").contains("name=ada"));
    }
}
