use chrono::Utc;
use log::{ error, info, warn };
use std::collections::HashMap;

use super::{ KvStore, StoreError };
use crate::llm::Tier;
use crate::models::chat::{ ChatSession, Message };

const SESSIONS_KEY_PREFIX: &str = "nexora-sessions-";
const ACTIVE_KEY_PREFIX: &str = "nexora-active-session-";
const LEGACY_SESSIONS_KEY: &str = "nexora-sessions";
const LEGACY_ACTIVE_KEY: &str = "nexora-active-session";

pub fn sessions_key(tier: Tier) -> String {
    format!("{}{}", SESSIONS_KEY_PREFIX, tier)
}

pub fn active_key(tier: Tier) -> String {
    format!("{}{}", ACTIVE_KEY_PREFIX, tier)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Sessions of one tier, newest first, plus the active pointer.
#[derive(Clone, Debug, Default)]
pub struct TierSessions {
    pub sessions: Vec<ChatSession>,
    pub active_id: Option<String>,
}

impl TierSessions {
    pub fn create(&mut self, session: ChatSession) -> &mut ChatSession {
        self.active_id = Some(session.id.clone());
        self.sessions.insert(0, session);
        &mut self.sessions[0]
    }

    pub fn get(&self, session_id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.id == session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut ChatSession> {
        self.sessions.iter_mut().find(|s| s.id == session_id)
    }

    pub fn active(&self) -> Option<&ChatSession> {
        self.active_id.as_deref().and_then(|id| self.get(id))
    }

    pub fn active_mut(&mut self) -> Option<&mut ChatSession> {
        let id = self.active_id.clone()?;
        self.get_mut(&id)
    }

    /// Appends to the active session. Returns `false` when none is active.
    pub fn append_message(&mut self, message: Message) -> bool {
        match self.active_mut() {
            Some(session) => {
                session.messages.push(message);
                session.last_modified = session.last_modified.max(now_ms());
                true
            }
            None => false,
        }
    }

    /// Mutates one message in place, located by session and message id.
    pub fn update_message<F>(&mut self, session_id: &str, message_id: &str, f: F) -> Option<Message>
        where F: FnOnce(&mut Message)
    {
        let message = self.get_mut(session_id)?.message_mut(message_id)?;
        f(message);
        Some(message.clone())
    }

    /// Removes a session. When it was the active one, the most recently
    /// modified survivor becomes active, or nothing if none is left.
    pub fn delete(&mut self, session_id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != session_id);
        if self.sessions.len() == before {
            return false;
        }
        if self.active_id.as_deref() == Some(session_id) {
            self.active_id = self.sessions
                .iter()
                .max_by_key(|s| s.last_modified)
                .map(|s| s.id.clone());
        }
        true
    }

    pub fn rename(&mut self, session_id: &str, title: &str) -> bool {
        match self.get_mut(session_id) {
            Some(session) => {
                session.title = title.to_string();
                session.last_modified = session.last_modified.max(now_ms());
                true
            }
            None => false,
        }
    }

    pub fn select(&mut self, session_id: Option<&str>) -> bool {
        match session_id {
            Some(id) if self.get(id).is_none() => false,
            _ => {
                self.active_id = session_id.map(str::to_string);
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.active_id = None;
    }

    /// Copy suitable for storage: inline attachments are dropped.
    fn for_storage(&self) -> Vec<ChatSession> {
        self.sessions
            .iter()
            .cloned()
            .map(|mut session| {
                for message in &mut session.messages {
                    message.parts.retain(|p| !p.is_inline());
                }
                session
            })
            .collect()
    }
}

/// Independent histories for every tier.
#[derive(Clone, Debug, Default)]
pub struct SessionStore {
    tiers: HashMap<Tier, TierSessions>,
}

impl SessionStore {
    pub fn tier(&self, tier: Tier) -> &TierSessions {
        static EMPTY: TierSessions = TierSessions { sessions: Vec::new(), active_id: None };
        self.tiers.get(&tier).unwrap_or(&EMPTY)
    }

    pub fn tier_mut(&mut self, tier: Tier) -> &mut TierSessions {
        self.tiers.entry(tier).or_default()
    }

    /// Reads every tier back. Nothing is read when history is disabled; any
    /// unreadable entry yields an empty tier.
    pub async fn load(kv: &dyn KvStore, save_history: bool) -> Self {
        let mut store = SessionStore::default();
        if !save_history {
            return store;
        }

        if let Err(e) = migrate_legacy_keys(kv).await {
            warn!("Legacy session migration failed: {}", e);
        }

        for tier in Tier::ALL {
            match load_tier(kv, tier).await {
                Ok(loaded) => {
                    info!("Loaded {} {} session(s)", loaded.sessions.len(), tier);
                    *store.tier_mut(tier) = loaded;
                }
                Err(e) => {
                    error!("Failed to load {} sessions, starting empty: {}", tier, e);
                }
            }
        }
        store
    }

    /// Writes every tier. With history disabled the keys are removed instead.
    pub async fn save(&self, kv: &dyn KvStore, save_history: bool) -> Result<(), StoreError> {
        for tier in Tier::ALL {
            let sessions = self.tier(tier);
            if !save_history {
                kv.remove(&sessions_key(tier)).await?;
                kv.remove(&active_key(tier)).await?;
                continue;
            }

            if sessions.sessions.is_empty() {
                kv.remove(&sessions_key(tier)).await?;
            } else {
                let json = serde_json::to_string(&sessions.for_storage())?;
                kv.set(&sessions_key(tier), &json).await?;
            }
            match &sessions.active_id {
                Some(id) => kv.set(&active_key(tier), id).await?,
                None => kv.remove(&active_key(tier)).await?,
            }
        }
        Ok(())
    }
}

async fn load_tier(kv: &dyn KvStore, tier: Tier) -> Result<TierSessions, StoreError> {
    let Some(raw) = kv.get(&sessions_key(tier)).await? else {
        return Ok(TierSessions::default());
    };
    let sessions: Vec<ChatSession> = serde_json::from_str(&raw)?;
    let active_id = kv
        .get(&active_key(tier)).await?
        .filter(|id| sessions.iter().any(|s| &s.id == id));
    Ok(TierSessions { sessions, active_id })
}

/// Histories written before tiers existed belong to the standard tier.
async fn migrate_legacy_keys(kv: &dyn KvStore) -> Result<(), StoreError> {
    let Some(old_sessions) = kv.get(LEGACY_SESSIONS_KEY).await? else {
        return Ok(());
    };
    info!("Migrating legacy session history into the standard tier");
    kv.set(&sessions_key(Tier::Standard), &old_sessions).await?;
    kv.remove(LEGACY_SESSIONS_KEY).await?;
    if let Some(old_active) = kv.get(LEGACY_ACTIVE_KEY).await? {
        kv.set(&active_key(Tier::Standard), &old_active).await?;
        kv.remove(LEGACY_ACTIVE_KEY).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryKvStore;
    use crate::models::chat::Part;

    fn session(title: &str, last_modified: i64) -> ChatSession {
        let mut s = ChatSession::new(title);
        s.last_modified = last_modified;
        s
    }

    #[test]
    fn create_prepends_and_activates() {
        let mut tier = TierSessions::default();
        let first = tier.create(session("a", 1)).id.clone();
        let second = tier.create(session("b", 2)).id.clone();
        assert_eq!(tier.sessions[0].id, second);
        assert_eq!(tier.sessions[1].id, first);
        assert_eq!(tier.active_id.as_deref(), Some(second.as_str()));
    }

    #[test]
    fn deleting_active_picks_most_recent_survivor() {
        let mut tier = TierSessions::default();
        let old = tier.create(session("old", 10)).id.clone();
        let newest = tier.create(session("newest", 30)).id.clone();
        let middle = tier.create(session("middle", 20)).id.clone();
        let active = tier.create(session("active", 5)).id.clone();

        assert!(tier.delete(&active));
        assert_eq!(tier.active_id.as_deref(), Some(newest.as_str()));

        assert!(tier.delete(&old));
        assert_eq!(tier.active_id.as_deref(), Some(newest.as_str()));
        assert!(tier.delete(&newest));
        assert_eq!(tier.active_id.as_deref(), Some(middle.as_str()));
        assert!(tier.delete(&middle));
        assert_eq!(tier.active_id, None);
        assert!(!tier.delete(&middle));
    }

    #[test]
    fn append_and_rename_bump_last_modified() {
        let mut tier = TierSessions::default();
        let id = tier.create(session("s", 0)).id.clone();
        assert!(tier.append_message(Message::user(vec![Part::text("hi")], vec![])));
        assert!(tier.get(&id).unwrap().last_modified > 0);

        tier.get_mut(&id).unwrap().last_modified = 0;
        assert!(tier.rename(&id, "renamed"));
        let s = tier.get(&id).unwrap();
        assert_eq!(s.title, "renamed");
        assert!(s.last_modified > 0);
        assert!(!tier.rename("missing", "x"));
    }

    #[test]
    fn append_without_active_session_fails() {
        let mut tier = TierSessions::default();
        assert!(!tier.append_message(Message::model_placeholder()));
    }

    #[tokio::test]
    async fn persistence_round_trip_strips_inline_data() {
        let kv = MemoryKvStore::default();
        let mut store = SessionStore::default();
        let id = store.tier_mut(Tier::Pro).create(session("p", 1)).id.clone();
        store
            .tier_mut(Tier::Pro)
            .append_message(
                Message::user(vec![Part::text("see"), Part::inline("image/png", "AAAA")], vec![])
            );
        store.save(&kv, true).await.unwrap();

        let loaded = SessionStore::load(&kv, true).await;
        let pro = loaded.tier(Tier::Pro);
        assert_eq!(pro.active_id.as_deref(), Some(id.as_str()));
        assert_eq!(pro.sessions[0].messages[0].parts, vec![Part::text("see")]);
        assert!(loaded.tier(Tier::Standard).sessions.is_empty());
    }

    #[tokio::test]
    async fn corrupt_or_dangling_state_loads_empty() {
        let kv = MemoryKvStore::default();
        kv.set(&sessions_key(Tier::Standard), "{not json").await.unwrap();
        kv.set(&sessions_key(Tier::Pro), "[]").await.unwrap();
        kv.set(&active_key(Tier::Pro), "gone").await.unwrap();

        let loaded = SessionStore::load(&kv, true).await;
        assert!(loaded.tier(Tier::Standard).sessions.is_empty());
        assert_eq!(loaded.tier(Tier::Pro).active_id, None);
    }

    #[tokio::test]
    async fn legacy_keys_move_to_standard_tier() {
        let kv = MemoryKvStore::default();
        let legacy = session("legacy", 1);
        let json = serde_json::to_string(&vec![legacy.clone()]).unwrap();
        kv.set(LEGACY_SESSIONS_KEY, &json).await.unwrap();
        kv.set(LEGACY_ACTIVE_KEY, &legacy.id).await.unwrap();

        let loaded = SessionStore::load(&kv, true).await;
        let standard = loaded.tier(Tier::Standard);
        assert_eq!(standard.sessions.len(), 1);
        assert_eq!(standard.active_id.as_deref(), Some(legacy.id.as_str()));
        assert_eq!(kv.get(LEGACY_SESSIONS_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn disabled_history_removes_keys_and_skips_load() {
        let kv = MemoryKvStore::default();
        let mut store = SessionStore::default();
        store.tier_mut(Tier::Standard).create(session("s", 1));
        store.save(&kv, true).await.unwrap();
        assert!(SessionStore::load(&kv, false).await.tier(Tier::Standard).sessions.is_empty());

        store.save(&kv, false).await.unwrap();
        assert!(kv.snapshot().await.is_empty());
    }
}
