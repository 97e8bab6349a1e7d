use serde::{ Serialize, Deserialize };

use crate::llm::Tier;
use crate::models::action::Action;
use crate::models::chat::{ ChatSession, Message };

/// A file sent along with a chat message, as a `data:` URL.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Attachment {
    pub name: String,
    pub data_url: String,
}

fn default_tier() -> Tier {
    Tier::Standard
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "chat")] Chat {
        content: String,
        #[serde(default = "default_tier")]
        tier: Tier,
        #[serde(default)]
        attachments: Vec<Attachment>,
        /// Specialist mode for this send only, overriding the active one.
        #[serde(default)]
        specialist_mode: Option<String>,
    },
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "list_sessions")] ListSessions {
        tier: Tier,
    },
    #[serde(rename = "new_chat")] NewChat {
        tier: Tier,
    },
    #[serde(rename = "select_session")] SelectSession {
        tier: Tier,
        session_id: Option<String>,
    },
    #[serde(rename = "delete_session")] DeleteSession {
        tier: Tier,
        session_id: String,
    },
    #[serde(rename = "rename_session")] RenameSession {
        tier: Tier,
        session_id: String,
        title: String,
    },
    #[serde(rename = "clear_sessions")] ClearSessions {
        tier: Tier,
    },
    #[serde(rename = "set_specialist_mode")] SetSpecialistMode {
        subject: Option<String>,
    },
    #[serde(rename = "set_api_key")] SetApiKey {
        api_key: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session")] Session {
        tier: Tier,
        session: ChatSession,
    },
    #[serde(rename = "sessions")] Sessions {
        tier: Tier,
        sessions: Vec<ChatSession>,
        active_id: Option<String>,
    },
    #[serde(rename = "message")] Message {
        tier: Tier,
        session_id: String,
        message: Message,
    },
    #[serde(rename = "progress")] Progress {
        steps: Vec<String>,
        percentage: u8,
    },
    #[serde(rename = "progress_cleared")]
    ProgressCleared,
    #[serde(rename = "specialist_mode")] SpecialistMode {
        subject: Option<String>,
    },
    #[serde(rename = "action")] Action {
        action: Action,
    },
    #[serde(rename = "loading")] Loading {
        active: bool,
    },
    #[serde(rename = "credential_required")]
    CredentialRequired,
    #[serde(rename = "rate_limited")] RateLimited {
        message: String,
        reset_time: i64,
    },
    #[serde(rename = "error")] Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_defaults_to_standard_tier() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"chat","content":"hi"}"#).unwrap();
        match msg {
            ClientMessage::Chat { tier, attachments, specialist_mode, .. } => {
                assert_eq!(tier, Tier::Standard);
                assert!(attachments.is_empty());
                assert!(specialist_mode.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn server_messages_are_tagged() {
        let json = serde_json::to_value(ServerMessage::Progress { steps: vec!["a".into()], percentage: 12 }).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["percentage"], 12);
        let json = serde_json::to_value(ServerMessage::CredentialRequired).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "credential_required" }));
    }
}
