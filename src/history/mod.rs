mod file;
mod memory;
mod redis;
pub mod sessions;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use thiserror::Error;

use crate::cli::Args;
use crate::models::chat::{ ChatSession, Message, Part, Role };

pub use self::file::FileKvStore;
pub use self::memory::MemoryKvStore;
pub use self::redis::RedisKvStore;
pub use self::sessions::{ SessionStore, TierSessions };

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported store type: {0}")]
    Unsupported(String),
}

/// String key-value persistence. Values survive restarts; callers treat a
/// failed or missing read as empty state.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

pub fn create_kv_store(args: &Args) -> Result<Arc<dyn KvStore>, StoreError> {
    match args.store_type.to_lowercase().as_str() {
        "file" => Ok(Arc::new(FileKvStore::new(&args.store_path)?)),
        "redis" => Ok(Arc::new(RedisKvStore::new(&args.store_host, &args.store_redis_prefix)?)),
        "memory" => Ok(Arc::new(MemoryKvStore::default())),
        other => Err(StoreError::Unsupported(other.to_string())),
    }
}

pub fn initialize_kv_store(args: &Args) -> Result<Arc<dyn KvStore>, StoreError> {
    let location = match args.store_type.to_lowercase().as_str() {
        "redis" => args.store_host.as_str(),
        "memory" => "process memory",
        _ => args.store_path.as_str(),
    };
    info!("Chat history will be stored in: {} at {}", args.store_type, location);
    create_kv_store(args)
}

/// Long-term facts of a session, one `key: fact` per line.
pub fn format_memory_digest(session: &ChatSession) -> String {
    session.memory
        .iter()
        .map(|m| format!("{}: {}", m.key, m.fact))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Short transcript of `messages`, one `Label: text` line per message.
/// Attachments are shown as `attachment_label`.
pub fn format_recent_digest(
    messages: &[Message],
    user_label: &str,
    model_label: &str,
    attachment_label: &str
) -> String {
    messages
        .iter()
        .map(|msg| {
            let role_display = match msg.role {
                Role::User => user_label,
                Role::Model => model_label,
            };
            let content = msg.parts
                .iter()
                .map(|p| match p {
                    Part::Text { text } if !text.is_empty() => text.as_str(),
                    _ => attachment_label,
                })
                .collect::<Vec<_>>()
                .join(" ");
            format!("{}: {}", role_display, content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::MemoryFact;

    #[test]
    fn memory_digest_lists_facts() {
        let mut session = ChatSession::new("t");
        session.memory = vec![
            MemoryFact { key: "name".into(), fact: "Sam".into() },
            MemoryFact { key: "city".into(), fact: "Cairo".into() }
        ];
        assert_eq!(format_memory_digest(&session), "name: Sam\ncity: Cairo");
    }

    #[test]
    fn recent_digest_labels_roles_and_attachments() {
        let user = Message::user(vec![Part::text("look"), Part::inline("image/png", "AAAA")], vec![]);
        let mut model = Message::model_placeholder();
        model.parts = vec![Part::text("nice")];
        let digest = format_recent_digest(&[user, model], "You", "Nexora", "[attachment]");
        assert_eq!(digest, "You: look [attachment]\nNexora: nice");
    }
}
