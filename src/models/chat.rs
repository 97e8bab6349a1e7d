use serde::{ Serialize, Deserialize };
use uuid::Uuid;
use chrono::Utc;

use crate::models::action::Action;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

/// One piece of message content, serialized in the upstream `{ "text" }` /
/// `{ "inlineData" }` shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn inline(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Part::Inline {
            inline_data: InlineData {
                mime_type: mime_type.into(),
                data: data.into(),
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text.as_str()),
            Part::Inline { .. } => None,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Part::Inline { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Streaming,
    Done,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<WebSource>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_chunks: Option<Vec<GroundingChunk>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_state: Option<StreamState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_files: Option<Vec<String>>,
}

impl Message {
    pub fn user(parts: Vec<Part>, attached_files: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            parts,
            action: None,
            grounding_chunks: None,
            stream_state: None,
            attached_files: if attached_files.is_empty() { None } else { Some(attached_files) },
        }
    }

    /// The placeholder a streamed answer is written into.
    pub fn model_placeholder() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Model,
            parts: vec![Part::text("")],
            action: None,
            grounding_chunks: None,
            stream_state: None,
            attached_files: None,
        }
    }

    pub fn first_text(&self) -> Option<&str> {
        self.parts.first().and_then(Part::as_text)
    }

    /// Moves the stream state forward; a request to go backwards is ignored.
    pub fn advance_stream_state(&mut self, next: StreamState) {
        match self.stream_state {
            Some(current) if current >= next => {}
            _ => {
                self.stream_state = Some(next);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryFact {
    pub key: String,
    pub fact: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub memory: Vec<MemoryFact>,
    #[serde(default)]
    pub last_modified: i64,
}

impl ChatSession {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            messages: Vec::new(),
            memory: Vec::new(),
            last_modified: Utc::now().timestamp_millis(),
        }
    }

    pub fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }
}
