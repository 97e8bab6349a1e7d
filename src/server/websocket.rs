use crate::agent::{ AgentError, AgentEvent, ChatAgent, SendOptions };
use crate::cli::Args;
use crate::llm::Tier;
use crate::models::websocket::{ ClientMessage, ServerMessage };

use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::net::TcpListener;
use tokio::io::{ AsyncRead, AsyncWrite };

use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ Request, Response, ErrorResponse };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_rustls::TlsAcceptor;

use rustls::ServerConfig;
use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls_pemfile::{ certs, pkcs8_private_keys };

use governor::{ DefaultDirectRateLimiter, Quota, RateLimiter };

use hmac::{ Hmac, Mac };
use sha2::Sha256;
use chrono::Utc;
use url::form_urlencoded;

use log::{ info, warn, error };
use futures::{ SinkExt, StreamExt };

type HmacSha256 = Hmac<Sha256>;

/// Attachments travel inline as data URLs.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
const MAX_CLOCK_SKEW_SECS: i64 = 300;
const CHANNEL_CAPACITY: usize = 64;

fn connection_limiter(per_second: u32) -> DefaultDirectRateLimiter {
    let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(rate))
}

fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let key = match pkcs8_private_keys(&mut BufReader::new(key_file)).next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

/// Checks the `ts`/`sig` query pair: `sig` must be the hex HMAC-SHA256 of
/// `ts` under `secret`, and `ts` (unix seconds) within five minutes of `now`.
pub fn verify_signature(
    secret: &str,
    params: &HashMap<String, String>,
    now: i64
) -> Result<(), &'static str> {
    let ts = params.get("ts").or_else(|| params.get("X-Api-Ts"));
    let sig = params.get("sig").or_else(|| params.get("X-Api-Sign"));
    let (Some(ts), Some(sig)) = (ts, sig) else {
        return Err("missing ts/sig");
    };

    let ts_i: i64 = ts.parse().map_err(|_| "timestamp out of range")?;
    if now.abs_diff(ts_i) > MAX_CLOCK_SKEW_SECS.unsigned_abs() {
        return Err("timestamp out of range");
    }

    let signature = hex::decode(sig).map_err(|_| "bad signature")?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "bad signature")?;
    mac.update(ts.as_bytes());
    mac.verify_slice(&signature).map_err(|_| "bad signature")
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(reason.to_string()));
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    res
}

pub async fn start_ws_server(
    addr: &str,
    agent: Arc<ChatAgent>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    let tls_acceptor = if args.enable_tls {
        match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path,
                    key_path
                );
                Some(TlsAcceptor::from(load_tls_config(cert_path, key_path)?))
            }
            (Some(_), None) | (None, Some(_)) => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
            (None, None) => {
                error!("--enable-tls was set but no certificate/key paths provided.");
                return Err("TLS enabled without cert/key".into());
            }
        }
    } else {
        None
    };
    let protocol = if tls_acceptor.is_some() { "WSS" } else { "WS" };
    info!("{} server listening on: {}", protocol, addr);

    let limiter = connection_limiter(args.connections_per_second);
    let api_key = args.server_api_key.clone().filter(|k| !k.is_empty());

    loop {
        let (stream, peer) = listener.accept().await?;

        if limiter.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let agent_clone = Arc::clone(&agent);
        let required_api_key = api_key.clone();
        let tls_acceptor_clone = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor_clone {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        process_connection(peer, tls_stream, agent_clone, required_api_key).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, agent_clone, required_api_key).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    agent: Arc<ChatAgent>,
    required_api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let Some(secret) = &required_api_key else {
            return Ok(response);
        };
        let qs = req.uri().query().unwrap_or("");
        let params: HashMap<String, String> = form_urlencoded
            ::parse(qs.as_bytes())
            .into_owned()
            .collect();

        match verify_signature(secret, &params, Utc::now().timestamp()) {
            Ok(()) => Ok(response),
            Err(reason) => {
                warn!("Rejected handshake from {}: {}", peer, reason);
                Err(unauthorized(reason))
            }
        }
    };

    match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => {
            handle_connection(peer, ws, agent).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

pub async fn handle_connection<S>(peer: SocketAddr, websocket: WebSocketStream<S>, agent: Arc<ChatAgent>)
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    info!("New WebSocket connection: {}", peer);

    let (mut sink, mut source) = websocket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(CHANNEL_CAPACITY);
    let (event_tx, mut event_rx) = mpsc::channel::<AgentEvent>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize message for {}: {}", peer, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(json)).await {
                warn!("Error sending to {}: {}", peer, e);
                break;
            }
        }
    });

    let relay_tx = out_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if relay_tx.send(event.into()).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if text.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds size limit ({} > {})",
                        peer,
                        text.len(),
                        MAX_MESSAGE_SIZE
                    );
                    reply(&out_tx, ServerMessage::Error { message: "Message too large".into() }).await;
                    break;
                }
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        handle_client_message(client_msg, &agent, &out_tx, &event_tx).await;
                    }
                    Err(e) => {
                        warn!("Unreadable message from {}: {}", peer, e);
                        reply(&out_tx, ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        }).await;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error from {}: {}", peer, e);
                break;
            }
        }
    }

    info!("Connection closed: {}", peer);
}

async fn handle_client_message(
    msg: ClientMessage,
    agent: &Arc<ChatAgent>,
    out: &mpsc::Sender<ServerMessage>,
    events: &mpsc::Sender<AgentEvent>
) {
    match msg {
        ClientMessage::Chat { content, tier, attachments, specialist_mode } => {
            let agent = Arc::clone(agent);
            let out = out.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let options = SendOptions { specialist_mode };
                if let Err(e) = agent.send(tier, &content, attachments, options, &events).await {
                    if let Some(msg) = refusal_message(e) {
                        reply(&out, msg).await;
                    }
                }
            });
        }
        ClientMessage::Stop => {
            agent.stop_generation();
            reply(out, ServerMessage::Loading { active: false }).await;
        }
        ClientMessage::ListSessions { tier } => {
            reply(out, sessions_message(agent, tier).await).await;
        }
        ClientMessage::NewChat { tier } => {
            agent.new_chat(tier).await;
            reply(out, ServerMessage::SpecialistMode { subject: None }).await;
            reply(out, sessions_message(agent, tier).await).await;
        }
        ClientMessage::SelectSession { tier, session_id } => {
            match agent.select_session(tier, session_id.as_deref()).await {
                Ok(Some(session)) => reply(out, ServerMessage::Session { tier, session }).await,
                Ok(None) => reply(out, sessions_message(agent, tier).await).await,
                Err(e) => reply(out, ServerMessage::Error { message: e.to_string() }).await,
            }
        }
        ClientMessage::DeleteSession { tier, session_id } => {
            if let Err(e) = agent.delete_session(tier, &session_id).await {
                reply(out, ServerMessage::Error { message: e.to_string() }).await;
            }
            reply(out, sessions_message(agent, tier).await).await;
        }
        ClientMessage::RenameSession { tier, session_id, title } => {
            if let Err(e) = agent.rename_session(tier, &session_id, &title).await {
                reply(out, ServerMessage::Error { message: e.to_string() }).await;
            }
            reply(out, sessions_message(agent, tier).await).await;
        }
        ClientMessage::ClearSessions { tier } => {
            agent.clear_sessions(tier).await;
            reply(out, sessions_message(agent, tier).await).await;
        }
        ClientMessage::SetSpecialistMode { subject } => {
            agent.set_specialist_mode(subject).await;
            reply(out, ServerMessage::SpecialistMode { subject: agent.specialist_mode().await }).await;
        }
        ClientMessage::SetApiKey { api_key } => {
            if let Err(e) = agent.update_credential(&api_key).await {
                warn!("Rejected API key update: {}", e);
                reply(out, ServerMessage::Error { message: e.to_string() }).await;
                reply(out, ServerMessage::CredentialRequired).await;
            }
        }
    }
}

/// What the client is told when a send is refused. The credential prompt was
/// already pushed as an event.
fn refusal_message(e: AgentError) -> Option<ServerMessage> {
    match e {
        AgentError::CredentialRequired => None,
        AgentError::RateLimited { message, reset_time } => {
            Some(ServerMessage::RateLimited { message, reset_time })
        }
        other => Some(ServerMessage::Error { message: other.to_string() }),
    }
}

async fn sessions_message(agent: &ChatAgent, tier: Tier) -> ServerMessage {
    let sessions = agent.sessions(tier).await;
    ServerMessage::Sessions {
        tier,
        sessions: sessions.sessions,
        active_id: sessions.active_id,
    }
}

async fn reply(out: &mpsc::Sender<ServerMessage>, msg: ServerMessage) {
    if out.send(msg).await.is_err() {
        warn!("Connection writer closed, dropping reply");
    }
}

impl From<AgentEvent> for ServerMessage {
    fn from(event: AgentEvent) -> Self {
        match event {
            AgentEvent::SessionActivated { tier, session } => ServerMessage::Session { tier, session },
            AgentEvent::MessageUpdated { tier, session_id, message } => {
                ServerMessage::Message { tier, session_id, message }
            }
            AgentEvent::Progress(progress) => {
                ServerMessage::Progress { steps: progress.steps, percentage: progress.percentage }
            }
            AgentEvent::ProgressCleared => ServerMessage::ProgressCleared,
            AgentEvent::SpecialistModeChanged(subject) => ServerMessage::SpecialistMode { subject },
            AgentEvent::Action(action) => ServerMessage::Action { action },
            AgentEvent::Loading(active) => ServerMessage::Loading { active },
            AgentEvent::CredentialRequired => ServerMessage::CredentialRequired,
        }
    }
}
