use serde::{Deserialize, Serialize};

use crate::models::Participant;

// ── Inbound ──────────────────────────────────────────────────────────

/// Events a client sends over its room socket.
///
/// Frames are `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Join {
        room_id: String,
    },
    #[serde(rename = "leave_room_event")]
    LeaveRoom {
        room_id: String,
    },
    TextChange {
        room_id: String,
        /// Editor payload, relayed verbatim.
        content: serde_json::Value,
    },
    RunCode {
        room_id: String,
        code: String,
        #[serde(default)]
        input: String,
    },
    GeneralChatMessage {
        room_id: String,
        message: String,
    },
    ChatbotRequest {
        room_id: String,
        query: String,
        #[serde(default)]
        code: String,
    },
}

impl ClientEvent {
    pub fn room_id(&self) -> &str {
        match self {
            Self::Join { room_id }
            | Self::LeaveRoom { room_id }
            | Self::TextChange { room_id, .. }
            | Self::RunCode { room_id, .. }
            | Self::GeneralChatMessage { room_id, .. }
            | Self::ChatbotRequest { room_id, .. } => room_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::LeaveRoom { .. } => "leave_room_event",
            Self::TextChange { .. } => "text_change",
            Self::RunCode { .. } => "run_code",
            Self::GeneralChatMessage { .. } => "general_chat_message",
            Self::ChatbotRequest { .. } => "chatbot_request",
        }
    }
}

// ── Outbound ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ParticipantsUpdate {
        participants: Vec<Participant>,
        sender: String,
    },
    RemoteChange {
        content: serde_json::Value,
        sender: String,
    },
    CodeOutput {
        output: String,
        sender: String,
    },
    NewGeneralChatMessage {
        sender_name: String,
        message: String,
    },
    ChatbotResponse {
        user_name: String,
        query: String,
        ai_response: String,
    },
    Unauthorized {
        msg: String,
    },
    Error {
        msg: String,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ParticipantsUpdate { .. } => "participants_update",
            Self::RemoteChange { .. } => "remote_change",
            Self::CodeOutput { .. } => "code_output",
            Self::NewGeneralChatMessage { .. } => "new_general_chat_message",
            Self::ChatbotResponse { .. } => "chatbot_response",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_parses_socket_frame() {
        let frame = r#"{"event":"text_change","data":{"room_id":"r1","content":"print(1)"}}"#;
        let event: ClientEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(event.name(), "text_change");
        assert_eq!(event.room_id(), "r1");
        match event {
            ClientEvent::TextChange { content, .. } => assert_eq!(content, "print(1)"),
            _ => panic!("Expected TextChange"),
        }
    }

    #[test]
    fn test_leave_event_uses_legacy_name() {
        let frame = r#"{"event":"leave_room_event","data":{"room_id":"r1"}}"#;
        let event: ClientEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(event, ClientEvent::LeaveRoom { room_id: "r1".into() });
    }

    #[test]
    fn test_run_code_input_defaults_to_empty() {
        let frame = r#"{"event":"run_code","data":{"room_id":"r1","code":"print(2)"}}"#;
        match serde_json::from_str::<ClientEvent>(frame).unwrap() {
            ClientEvent::RunCode { input, .. } => assert!(input.is_empty()),
            _ => panic!("Expected RunCode"),
        }
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let frame = r#"{"event":"drop_tables","data":{}}"#;
        assert!(serde_json::from_str::<ClientEvent>(frame).is_err());
    }

    #[test]
    fn test_server_event_names_match_wire_tag() {
        let events = vec![
            ServerEvent::ParticipantsUpdate { participants: vec![], sender: "u".into() },
            ServerEvent::RemoteChange { content: serde_json::json!("x"), sender: "u".into() },
            ServerEvent::CodeOutput { output: "hi\n".into(), sender: "u".into() },
            ServerEvent::NewGeneralChatMessage { sender_name: "Ada".into(), message: "yo".into() },
            ServerEvent::ChatbotResponse {
                user_name: "AI".into(),
                query: "q".into(),
                ai_response: "a".into(),
            },
            ServerEvent::Unauthorized { msg: "Please login".into() },
            ServerEvent::Error { msg: "room_id is required".into() },
        ];
        for event in events {
            let parsed: serde_json::Value = serde_json::to_value(&event).unwrap();
            assert_eq!(parsed["event"], event.name());
            assert!(parsed["data"].is_object());
        }
    }

    #[test]
    fn test_participants_update_shape() {
        let event = ServerEvent::ParticipantsUpdate {
            participants: vec![Participant {
                id: "u1".into(),
                name: "Ada".into(),
                avatar: "a.png".into(),
                is_owner: true,
            }],
            sender: "u1".into(),
        };
        let parsed = serde_json::to_value(&event).unwrap();
        assert_eq!(parsed["data"]["participants"][0]["is_owner"], true);
        assert_eq!(parsed["data"]["sender"], "u1");
    }
}
