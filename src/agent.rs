use crate::cli::Args;
use crate::config::prompt::{ self, InstructionContext, PromptConfig, PromptError };
use crate::history::{
    format_memory_digest,
    format_recent_digest,
    initialize_kv_store,
    KvStore,
    SessionStore,
    StoreError,
    TierSessions,
};
use crate::llm::{ LlmConfig, LlmError, Tier };
use crate::llm::chat::{ ChatClient, ChatRequest, Turn, new_client as new_chat_client };
use crate::llm::image::{ decode_data_url, ImageClient, new_client as new_image_client };
use crate::models::action::Action;
use crate::models::chat::{ ChatSession, Message, Part, StreamState };
use crate::models::settings::ChatSettings;
use crate::models::websocket::Attachment;
use crate::rate_limit::{ RateDecision, RateLimitPolicy, RateLimitState };
use crate::reconciler::{ StreamReconciler, ThinkingProgress };
use crate::reconciler::finalize::{ apply_failure, apply_finalization, generate_image_part };

use chrono::{ DateTime, Local, Utc };
use futures::StreamExt;
use log::{ debug, error, info, warn };
use serde::Serialize;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{ mpsc, Mutex, RwLock };

pub const USAGE_KEY: &str = "nexora-pro-usage";
const TITLE_MAX_CHARS: usize = 40;
const RECENT_DIGEST_MESSAGES: usize = 6;
const PROGRESS_CLEAR_DELAY: Duration = Duration::from_millis(500);
const ATTACHMENT_FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("an API key is required before sending messages")]
    CredentialRequired,
    #[error("a response is already being generated")]
    Busy,
    #[error("{message}")] RateLimited {
        message: String,
        reset_time: i64,
    },
    #[error("session '{0}' not found")] UnknownSession(String),
    #[error(transparent)] Llm(#[from] LlmError),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Prompt(#[from] PromptError),
}

/// State changes pushed to whoever drives the agent while a send runs.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    SessionActivated {
        tier: Tier,
        session: ChatSession,
    },
    MessageUpdated {
        tier: Tier,
        session_id: String,
        message: Message,
    },
    Progress(ThinkingProgress),
    ProgressCleared,
    SpecialistModeChanged(Option<String>),
    Action(Action),
    Loading(bool),
    CredentialRequired,
}

#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Specialist mode for this send only. Ignored on the pro tier.
    pub specialist_mode: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub count: u32,
    pub limit: u32,
    pub reset_time: i64,
}

#[derive(Clone)]
struct ModelClients {
    chat: Arc<dyn ChatClient>,
    image: Arc<dyn ImageClient>,
}

/// Everything an agent is assembled from. `chat_client` and `image_client`
/// are both `None` until a credential is known.
pub struct AgentComponents {
    pub chat_client: Option<Arc<dyn ChatClient>>,
    pub image_client: Option<Arc<dyn ImageClient>>,
    pub kv: Arc<dyn KvStore>,
    pub prompts: Arc<PromptConfig>,
    pub prompts_path: String,
    pub settings: ChatSettings,
    pub policy: RateLimitPolicy,
    pub llm_config: LlmConfig,
}

/// Identifies the model message a running send writes into.
struct Exchange {
    tier: Tier,
    session_id: String,
    message_id: String,
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ChatAgent {
    clients: RwLock<Option<ModelClients>>,
    sessions: Mutex<SessionStore>,
    /// Held from snapshot to the end of the write so saves land in order.
    persist_lock: Mutex<()>,
    usage: Mutex<RateLimitState>,
    specialist_mode: Mutex<Option<String>>,
    prompts: RwLock<Arc<PromptConfig>>,
    kv: Arc<dyn KvStore>,
    policy: RateLimitPolicy,
    settings: ChatSettings,
    llm_config: LlmConfig,
    prompts_path: String,
    in_flight: AtomicBool,
    generating: AtomicBool,
    loading: AtomicBool,
    api_ready: AtomicBool,
}

impl ChatAgent {
    fn initialize_model_clients(
        config: &LlmConfig
    ) -> Result<Option<ModelClients>, Box<dyn Error + Send + Sync>> {
        if config.api_key.is_none() {
            warn!("No API key configured. Sends are refused until one is provided.");
            return Ok(None);
        }
        let chat = new_chat_client(config)?;
        let image = new_image_client(config)?;
        info!(
            "Model clients configured: Standard={}, Pro={}, Image={}, BaseURL={}",
            chat.get_model(Tier::Standard),
            chat.get_model(Tier::Pro),
            config.image_model,
            config.base_url
        );
        Ok(Some(ModelClients { chat, image }))
    }

    pub async fn new(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let llm_config = args.llm_config();
        let clients = Self::initialize_model_clients(&llm_config)?;
        let kv = initialize_kv_store(args)?;
        let prompts = prompt::load_prompts_or_default(&args.prompts_path)?;

        let components = AgentComponents {
            chat_client: clients.as_ref().map(|c| Arc::clone(&c.chat)),
            image_client: clients.map(|c| c.image),
            kv,
            prompts,
            prompts_path: args.prompts_path.clone(),
            settings: args.chat_settings(),
            policy: args.rate_limit_policy(),
            llm_config,
        };
        Ok(Self::from_components(components).await)
    }

    /// Restores sessions and pro usage from `components.kv`.
    pub async fn from_components(components: AgentComponents) -> Self {
        let clients = match (components.chat_client, components.image_client) {
            (Some(chat), Some(image)) => Some(ModelClients { chat, image }),
            _ => None,
        };
        let sessions = SessionStore::load(
            components.kv.as_ref(),
            components.settings.save_history
        ).await;
        let usage = load_usage(components.kv.as_ref(), &components.policy).await;

        Self {
            api_ready: AtomicBool::new(clients.is_some()),
            clients: RwLock::new(clients),
            sessions: Mutex::new(sessions),
            persist_lock: Mutex::new(()),
            usage: Mutex::new(usage),
            specialist_mode: Mutex::new(None),
            prompts: RwLock::new(components.prompts),
            kv: components.kv,
            policy: components.policy,
            settings: components.settings,
            llm_config: components.llm_config,
            prompts_path: components.prompts_path,
            in_flight: AtomicBool::new(false),
            generating: AtomicBool::new(false),
            loading: AtomicBool::new(false),
        }
    }

    pub fn is_api_ready(&self) -> bool {
        self.api_ready.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    /// Sends one user turn and streams the answer into a new model message.
    ///
    /// Returns once the message is final. Intermediate state is reported
    /// through `events`; a closed receiver does not stop the exchange.
    pub async fn send(
        &self,
        tier: Tier,
        text: &str,
        attachments: Vec<Attachment>,
        options: SendOptions,
        events: &mpsc::Sender<AgentEvent>
    ) -> Result<(), AgentError> {
        if !self.is_api_ready() {
            emit(events, AgentEvent::CredentialRequired).await;
            return Err(AgentError::CredentialRequired);
        }
        if self.in_flight.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(AgentError::Busy);
        }
        let _in_flight = FlagGuard(&self.in_flight);

        if tier.is_elevated() {
            self.consume_pro_quota().await?;
        }

        if text.trim().is_empty() && attachments.is_empty() {
            return Ok(());
        }

        let prompts = self.prompts.read().await.clone();
        let specialist_mode = if tier.is_elevated() {
            None
        } else {
            match options.specialist_mode {
                Some(mode) => Some(mode),
                None => self.specialist_mode.lock().await.clone(),
            }
        };

        let title = session_title(text, &attachments, &prompts.messages.new_session_title);
        let user_message = build_user_message(text, &attachments);
        let user_parts = user_message.parts.clone();
        let model_message = Message::model_placeholder();

        let (exchange, created, history, memory_digest, recent_digest) = {
            let mut store = self.sessions.lock().await;
            let sessions = store.tier_mut(tier);
            let created = sessions.active().is_none();
            if created {
                let session = sessions.create(ChatSession::new(title));
                info!("Created {} session {}", tier, session.id);
            }
            sessions.append_message(user_message.clone());
            sessions.append_message(model_message.clone());

            let Some(session) = sessions.active() else {
                return Err(AgentError::UnknownSession(String::new()));
            };
            let split = session.messages.len().saturating_sub(2);
            let prior = &session.messages[..split];
            let history: Vec<Turn> = prior
                .iter()
                .map(|m| Turn { role: m.role, parts: m.parts.clone() })
                .collect();
            let recent = &prior[prior.len().saturating_sub(RECENT_DIGEST_MESSAGES)..];
            let recent_digest = format_recent_digest(
                recent,
                &prompts.messages.user_label,
                &prompts.messages.model_label,
                &prompts.messages.attachment_label
            );
            let exchange = Exchange {
                tier,
                session_id: session.id.clone(),
                message_id: model_message.id.clone(),
            };
            let created = created.then(|| session.clone());
            (exchange, created, history, format_memory_digest(session), recent_digest)
        };

        self.generating.store(true, Ordering::SeqCst);
        self.loading.store(true, Ordering::SeqCst);
        emit(events, AgentEvent::Loading(true)).await;

        let mut reconciler = StreamReconciler::new(tier, specialist_mode.is_some());
        if tier.is_elevated() {
            let progress = reconciler.progress_start(&prompts.messages.thinking_started);
            emit(events, AgentEvent::Progress(progress)).await;
        }
        if let Some(session) = created {
            emit(events, AgentEvent::SessionActivated { tier, session }).await;
        }
        for message in [user_message, model_message] {
            emit(events, AgentEvent::MessageUpdated {
                tier,
                session_id: exchange.session_id.clone(),
                message,
            }).await;
        }
        self.persist_sessions().await;

        let instruction = prompts.system_instruction(
            &(InstructionContext {
                tier,
                specialist_mode: specialist_mode.as_deref(),
                memory_digest: &memory_digest,
                recent_digest: &recent_digest,
                settings: &self.settings,
            })
        );
        let outcome = match instruction {
            Ok(system_instruction) => {
                let request = ChatRequest {
                    tier,
                    history,
                    user_parts,
                    system_instruction,
                    settings: self.settings.clone(),
                };
                self.stream_exchange(&exchange, request, &mut reconciler, &prompts, events).await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = outcome {
            let invalid_credential = e
                .downcast_ref::<LlmError>()
                .map_or(false, LlmError::is_invalid_credential);
            error!("Exchange in {} session {} failed: {}", tier, exchange.session_id, e);
            let error_text = if invalid_credential {
                self.api_ready.store(false, Ordering::SeqCst);
                emit(events, AgentEvent::CredentialRequired).await;
                prompts.messages.invalid_key_error.clone()
            } else {
                prompts.messages.generic_error.clone()
            };
            self.update_message(&exchange, |m| apply_failure(m, &error_text), events).await;
        }
        self.persist_sessions().await;

        self.generating.store(false, Ordering::SeqCst);
        self.loading.store(false, Ordering::SeqCst);
        emit(events, AgentEvent::Loading(false)).await;

        if reconciler.auto_specialist().is_some() {
            *self.specialist_mode.lock().await = None;
            emit(events, AgentEvent::SpecialistModeChanged(None)).await;
        }

        if tier.is_elevated() {
            let events = events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(PROGRESS_CLEAR_DELAY).await;
                emit(&events, AgentEvent::ProgressCleared).await;
            });
        }

        Ok(())
    }

    async fn stream_exchange(
        &self,
        exchange: &Exchange,
        request: ChatRequest,
        reconciler: &mut StreamReconciler,
        prompts: &PromptConfig,
        events: &mpsc::Sender<AgentEvent>
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let clients = self.clients.read().await.clone().ok_or(LlmError::InvalidCredential)?;
        let mut stream = clients.chat.stream_chat(request).await?;
        self.update_message(exchange, |m| m.advance_stream_state(StreamState::Streaming), events).await;

        let mut grounding_chunks = Vec::new();
        while let Some(item) = stream.next().await {
            if !self.is_generating() {
                info!("Generation stopped in session {}", exchange.session_id);
                break;
            }
            let chunk = item?;
            if !chunk.grounding_chunks.is_empty() {
                grounding_chunks = chunk.grounding_chunks;
            }

            let update = reconciler.push(&chunk.text);
            if let Some(subject) = update.specialist {
                info!("Auto specialist mode activated: {}", subject);
                *self.specialist_mode.lock().await = Some(subject.clone());
                emit(events, AgentEvent::SpecialistModeChanged(Some(subject))).await;
            }
            if let Some(progress) = update.progress {
                emit(events, AgentEvent::Progress(progress)).await;
            }
            if let Some(text) = update.visible_text {
                self.update_message(exchange, |m| { m.parts = vec![Part::text(text)] }, events).await;
            }
        }
        drop(stream);

        if exchange.tier.is_elevated() {
            let progress = reconciler.progress_complete(&prompts.messages.thinking_final);
            emit(events, AgentEvent::Progress(progress)).await;
        }

        let finalization = reconciler.finish();
        let image = match &finalization.image_prompt {
            Some(prompt) => {
                generate_image_part(clients.image.as_ref(), prompt, self.llm_config.image_timeout).await
            }
            None => None,
        };
        let action = finalization.action.clone();
        self.update_message(
            exchange,
            |m| apply_finalization(m, finalization, image, grounding_chunks),
            events
        ).await;
        if let Some(action) = action {
            emit(events, AgentEvent::Action(action)).await;
        }
        Ok(())
    }

    async fn update_message<F>(&self, exchange: &Exchange, f: F, events: &mpsc::Sender<AgentEvent>)
        where F: FnOnce(&mut Message)
    {
        let updated = self.sessions
            .lock().await
            .tier_mut(exchange.tier)
            .update_message(&exchange.session_id, &exchange.message_id, f);
        match updated {
            Some(message) =>
                emit(events, AgentEvent::MessageUpdated {
                    tier: exchange.tier,
                    session_id: exchange.session_id.clone(),
                    message,
                }).await,
            None =>
                debug!(
                    "Message {} is gone from session {}, dropping update",
                    exchange.message_id,
                    exchange.session_id
                ),
        }
    }

    async fn consume_pro_quota(&self) -> Result<(), AgentError> {
        let now = Utc::now().timestamp_millis();
        let mut usage = self.usage.lock().await;
        let (decision, next) = self.policy.check(now, &usage);
        if let RateDecision::Denied { reset_time } = decision {
            info!("Pro quota exhausted until {}", reset_time);
            let template = self.prompts.read().await.messages.rate_limited.clone();
            return Err(AgentError::RateLimited {
                message: template.replace("{reset}", &format_reset_time(reset_time)),
                reset_time,
            });
        }
        *usage = next;
        persist_usage(self.kv.as_ref(), &next).await;
        Ok(())
    }

    async fn persist_sessions(&self) {
        let _persisting = self.persist_lock.lock().await;
        let snapshot = self.sessions.lock().await.clone();
        if let Err(e) = snapshot.save(self.kv.as_ref(), self.settings.save_history).await {
            error!("Failed to persist chat sessions: {}", e);
        }
    }

    /// Clears the generation flag; the running send stops at its next chunk.
    pub fn stop_generation(&self) {
        if self.generating.swap(false, Ordering::SeqCst) {
            info!("Stop requested");
        }
        self.loading.store(false, Ordering::SeqCst);
    }

    /// Deactivates the tier's session so the next send starts a fresh one.
    pub async fn new_chat(&self, tier: Tier) {
        self.sessions.lock().await.tier_mut(tier).select(None);
        *self.specialist_mode.lock().await = None;
        self.persist_sessions().await;
    }

    pub async fn select_session(
        &self,
        tier: Tier,
        session_id: Option<&str>
    ) -> Result<Option<ChatSession>, AgentError> {
        let selected = {
            let mut store = self.sessions.lock().await;
            let sessions = store.tier_mut(tier);
            if !sessions.select(session_id) {
                return Err(AgentError::UnknownSession(session_id.unwrap_or_default().to_string()));
            }
            sessions.active().cloned()
        };
        self.persist_sessions().await;
        Ok(selected)
    }

    /// Returns the id of the session that is active afterwards.
    pub async fn delete_session(&self, tier: Tier, session_id: &str) -> Result<Option<String>, AgentError> {
        let active = {
            let mut store = self.sessions.lock().await;
            let sessions = store.tier_mut(tier);
            if !sessions.delete(session_id) {
                return Err(AgentError::UnknownSession(session_id.to_string()));
            }
            sessions.active_id.clone()
        };
        info!("Deleted {} session {}", tier, session_id);
        self.persist_sessions().await;
        Ok(active)
    }

    pub async fn rename_session(&self, tier: Tier, session_id: &str, title: &str) -> Result<(), AgentError> {
        if !self.sessions.lock().await.tier_mut(tier).rename(session_id, title.trim()) {
            return Err(AgentError::UnknownSession(session_id.to_string()));
        }
        self.persist_sessions().await;
        Ok(())
    }

    pub async fn clear_sessions(&self, tier: Tier) {
        self.sessions.lock().await.tier_mut(tier).clear();
        info!("Cleared all {} sessions", tier);
        self.persist_sessions().await;
    }

    pub async fn sessions(&self, tier: Tier) -> TierSessions {
        self.sessions.lock().await.tier(tier).clone()
    }

    pub async fn usage(&self) -> UsageSnapshot {
        let usage = *self.usage.lock().await;
        UsageSnapshot {
            count: usage.count,
            limit: self.policy.cap,
            reset_time: usage.reset_time,
        }
    }

    pub async fn specialist_mode(&self) -> Option<String> {
        self.specialist_mode.lock().await.clone()
    }

    pub async fn set_specialist_mode(&self, subject: Option<String>) {
        *self.specialist_mode.lock().await = subject.filter(|s| !s.trim().is_empty());
    }

    /// Rebuilds the model clients around `api_key` and marks the agent ready.
    pub async fn update_credential(&self, api_key: &str) -> Result<(), AgentError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(AgentError::CredentialRequired);
        }
        let config = LlmConfig {
            api_key: Some(api_key.to_string()),
            ..self.llm_config.clone()
        };
        let clients = ModelClients {
            chat: new_chat_client(&config)?,
            image: new_image_client(&config)?,
        };
        *self.clients.write().await = Some(clients);
        self.api_ready.store(true, Ordering::SeqCst);
        info!("API key updated");
        Ok(())
    }

    /// Returns `true` when a changed prompts file was picked up.
    pub async fn reload_prompts(&self) -> Result<bool, AgentError> {
        let mut prompts = self.prompts.write().await;
        match prompt::reload_prompts_if_changed(&self.prompts_path, &prompts)? {
            Some(new_config) => {
                *prompts = new_config;
                info!("Prompts successfully reloaded");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

async fn emit(events: &mpsc::Sender<AgentEvent>, event: AgentEvent) {
    if events.send(event).await.is_err() {
        debug!("Event receiver closed, dropping event");
    }
}

fn session_title(text: &str, attachments: &[Attachment], fallback: &str) -> String {
    if !text.is_empty() {
        return text.chars().take(TITLE_MAX_CHARS).collect();
    }
    attachments
        .first()
        .map(|a| a.name.clone())
        .unwrap_or_else(|| fallback.to_string())
}

/// Text first, then one inline part per readable attachment. Non-image
/// attachments are also listed by name.
fn build_user_message(text: &str, attachments: &[Attachment]) -> Message {
    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(Part::text(text));
    }
    let mut attached_files = Vec::new();
    for attachment in attachments {
        match decode_data_url(&attachment.data_url, ATTACHMENT_FALLBACK_MIME) {
            Ok(inline_data) => {
                if !inline_data.mime_type.starts_with("image/") {
                    attached_files.push(attachment.name.clone());
                }
                parts.push(Part::Inline { inline_data });
            }
            Err(e) => warn!("Skipping unreadable attachment '{}': {}", attachment.name, e),
        }
    }
    Message::user(parts, attached_files)
}

fn format_reset_time(reset_time: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(reset_time)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| reset_time.to_string())
}

async fn load_usage(kv: &dyn KvStore, policy: &RateLimitPolicy) -> RateLimitState {
    let stored = match kv.get(USAGE_KEY).await {
        Ok(Some(raw)) =>
            match serde_json::from_str::<RateLimitState>(&raw) {
                Ok(state) => state,
                Err(e) => {
                    warn!("Ignoring unreadable pro usage state: {}", e);
                    RateLimitState::default()
                }
            }
        Ok(None) => {
            return RateLimitState::default();
        }
        Err(e) => {
            warn!("Failed to read pro usage state: {}", e);
            return RateLimitState::default();
        }
    };
    let state = policy.on_load(Utc::now().timestamp_millis(), stored);
    if state != stored {
        info!("Pro usage window expired, resetting");
        persist_usage(kv, &state).await;
    }
    state
}

async fn persist_usage(kv: &dyn KvStore, state: &RateLimitState) {
    let result = match serde_json::to_string(state) {
        Ok(json) => kv.set(USAGE_KEY, &json).await,
        Err(e) => Err(StoreError::from(e)),
    };
    if let Err(e) = result {
        error!("Failed to persist pro usage: {}", e);
    }
}
