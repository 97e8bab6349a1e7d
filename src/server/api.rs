use crate::agent::{ AgentError, ChatAgent, UsageSnapshot };
use crate::cli::Args;
use crate::llm::Tier;
use crate::models::chat::ChatSession;
use crate::server::websocket::verify_signature;
use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::{ get, patch, post, put },
    Router,
    Json,
    extract::{ Path, Request, State },
    middleware::{ self, Next },
    response::{ IntoResponse, Response },
    http::StatusCode,
};
use chrono::Utc;
use serde::{ Deserialize, Serialize };
use tower_http::cors::{ Any, CorsLayer };
use url::form_urlencoded;
use log::{ info, warn, error };

const SIGNATURE_HEADERS: [&str; 2] = ["X-Api-Ts", "X-Api-Sign"];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectRequest {
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub title: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionsResponse {
    sessions: Vec<ChatSession>,
    active_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    api_ready: bool,
    loading: bool,
    specialist_mode: Option<String>,
    usage: UsageSnapshot,
}

#[derive(Serialize)]
struct ReloadResponse {
    success: bool,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = match &self {
            AgentError::UnknownSession(_) => StatusCode::NOT_FOUND,
            AgentError::CredentialRequired => StatusCode::UNAUTHORIZED,
            AgentError::Busy => StatusCode::CONFLICT,
            AgentError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AgentError::Prompt(_) => StatusCode::BAD_REQUEST,
            AgentError::Llm(_) | AgentError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    agent: Arc<ChatAgent>,
    api_key: Option<String>,
}

/// With `api_key` set, every route requires the same `ts`/`sig` pair the
/// WebSocket handshake does, as query parameters or `X-Api-Ts`/`X-Api-Sign`
/// headers.
pub fn router(agent: Arc<ChatAgent>, api_key: Option<String>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let state = AppState { agent, api_key: api_key.filter(|k| !k.is_empty()) };

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/usage", get(usage_handler))
        .route("/api/sessions/{tier}", get(list_sessions_handler).delete(clear_sessions_handler))
        .route("/api/sessions/{tier}/active", put(select_session_handler))
        .route(
            "/api/sessions/{tier}/{session_id}",
            patch(rename_session_handler).delete(delete_session_handler)
        )
        .route("/api/reload-prompts", post(reload_prompts_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_signature))
        .layer(cors)
        .with_state(state)
}

async fn require_signature(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(secret) = state.api_key.as_deref() else {
        return next.run(req).await;
    };

    let qs = req.uri().query().unwrap_or("");
    let mut params: HashMap<String, String> = form_urlencoded
        ::parse(qs.as_bytes())
        .into_owned()
        .collect();
    for name in SIGNATURE_HEADERS {
        if let Some(value) = req.headers().get(name).and_then(|v| v.to_str().ok()) {
            params.entry(name.to_string()).or_insert_with(|| value.to_string());
        }
    }

    match verify_signature(secret, &params, Utc::now().timestamp()) {
        Ok(()) => next.run(req).await,
        Err(reason) => {
            warn!("Rejected {} {}: {}", req.method(), req.uri().path(), reason);
            (StatusCode::UNAUTHORIZED, Json(ErrorBody { error: reason.to_string() })).into_response()
        }
    }
}

pub async fn start_http_server(
    http_port: u16,
    agent: Arc<ChatAgent>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    let app = router(agent, args.server_api_key.clone());

    match (args.enable_tls, &args.tls_cert_path, &args.tls_key_path) {
        (true, Some(cert_path), Some(key_path)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;

            tokio::spawn(async move {
                let result = axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await;
                if let Err(e) = result {
                    error!("HTTPS server error: {}", e);
                }
            });
            info!("HTTPS API server started on: https://{}", addr);
        }
        _ => {
            tokio::spawn(async move {
                match tokio::net::TcpListener::bind(addr).await {
                    Ok(listener) => {
                        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                            error!("HTTP server error: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                    }
                }
            });
            info!("HTTP API server started on: http://{}", addr);
        }
    }

    Ok(())
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let agent = &state.agent;
    Json(StatusResponse {
        api_ready: agent.is_api_ready(),
        loading: agent.is_loading(),
        specialist_mode: agent.specialist_mode().await,
        usage: agent.usage().await,
    })
}

async fn usage_handler(State(state): State<AppState>) -> Json<UsageSnapshot> {
    Json(state.agent.usage().await)
}

async fn sessions_response(agent: &ChatAgent, tier: Tier) -> Json<SessionsResponse> {
    let sessions = agent.sessions(tier).await;
    Json(SessionsResponse {
        sessions: sessions.sessions,
        active_id: sessions.active_id,
    })
}

async fn list_sessions_handler(
    State(state): State<AppState>,
    Path(tier): Path<Tier>
) -> Json<SessionsResponse> {
    sessions_response(&state.agent, tier).await
}

async fn clear_sessions_handler(
    State(state): State<AppState>,
    Path(tier): Path<Tier>
) -> Json<SessionsResponse> {
    state.agent.clear_sessions(tier).await;
    sessions_response(&state.agent, tier).await
}

async fn select_session_handler(
    State(state): State<AppState>,
    Path(tier): Path<Tier>,
    Json(req): Json<SelectRequest>
) -> Result<Json<SessionsResponse>, AgentError> {
    state.agent.select_session(tier, req.session_id.as_deref()).await?;
    Ok(sessions_response(&state.agent, tier).await)
}

async fn rename_session_handler(
    State(state): State<AppState>,
    Path((tier, session_id)): Path<(Tier, String)>,
    Json(req): Json<RenameRequest>
) -> Result<Json<SessionsResponse>, AgentError> {
    state.agent.rename_session(tier, &session_id, &req.title).await?;
    Ok(sessions_response(&state.agent, tier).await)
}

async fn delete_session_handler(
    State(state): State<AppState>,
    Path((tier, session_id)): Path<(Tier, String)>
) -> Result<Json<SessionsResponse>, AgentError> {
    state.agent.delete_session(tier, &session_id).await?;
    Ok(sessions_response(&state.agent, tier).await)
}

async fn reload_prompts_handler(State(state): State<AppState>) -> Result<Json<ReloadResponse>, AgentError> {
    let reloaded = state.agent.reload_prompts().await?;
    Ok(
        Json(ReloadResponse {
            success: true,
            message: if reloaded { "Prompts reloaded".into() } else { "Prompts unchanged".into() },
        })
    )
}
