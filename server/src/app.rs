use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::columns::resolve_by_titles;
use crate::config::{AppConfig, StoreBackend};
use crate::contacts::{from_conversations, from_manual_list};
use crate::conversations::{reconcile_from_contacts, record_inbound};
use crate::dispatch::{MessageDispatcher, SendResult};
use crate::error::{AppError, AppResult};
use crate::identity::IdentityResolver;
use crate::logging::init_logging;
use crate::registry::{ChannelSession, SessionRegistry};
use crate::store::{LeadStore, MemoryStore, PgStore};
use crate::types::{
    now_iso, AppState, ColumnWithLeads, ImportContactsBody, InboundEvent,
    RegisterConnectionBody, SendMessageBody, SyncColumnsBody,
};
use crate::webhook::{extract_message_events, is_instagram_payload, verify_signature, verify_subscription};

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Parses a JSON body; an empty body reads as `{}`.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> AppResult<T> {
    let raw: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        &b"{}"[..]
    } else {
        &body[..]
    };
    Ok(serde_json::from_slice(raw)?)
}

fn log_aborted<'a>(user_id: &'a str, operation: &'static str) -> impl FnOnce(&AppError) + 'a {
    move |err| tracing::error!(user_id, operation, error = %err, "batch aborted")
}

/// Applies inbound events one at a time, in arrival order.
pub fn spawn_inbound_worker(
    store: Arc<dyn LeadStore>,
    mut rx: mpsc::UnboundedReceiver<InboundEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(InboundEvent { user_id, event }) = rx.recv().await {
            match record_inbound(store.as_ref(), &user_id, &event).await {
                Ok(outcome) => tracing::info!(
                    user_id = %user_id,
                    sender = %event.sender_ref,
                    message_id = event.message_id.as_deref().unwrap_or(""),
                    outcome = ?outcome,
                    "inbound message recorded"
                ),
                Err(err) => tracing::warn!(
                    user_id = %user_id,
                    sender = %event.sender_ref,
                    error = %err,
                    "inbound message not recorded"
                ),
            }
        }
        tracing::debug!("inbound worker stopped");
    })
}

/// Wires the shared state and starts the inbound worker. Must run inside a tokio runtime.
pub fn build_state(config: AppConfig, store: Arc<dyn LeadStore>) -> AppResult<Arc<AppState>> {
    let dispatcher = MessageDispatcher::new(config.graph_api_root())?;
    let identity = IdentityResolver::new(config.jwt_secret.clone());
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    spawn_inbound_worker(store.clone(), inbound_rx);

    Ok(Arc::new(AppState {
        store,
        sessions: SessionRegistry::new(),
        dispatcher,
        identity,
        config,
        inbound_tx,
    }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/db/health", get(db_health))
        .route("/api/leads/sync_columns", post(sync_columns))
        .route("/api/leads/sync_whatsapp_leads", post(sync_whatsapp_leads))
        .route("/api/leads/import_contacts", post(import_contacts))
        .route("/api/leads/columns_with_leads", get(columns_with_leads))
        .route(
            "/api/whatsapp/ensure_conversations_for_leads",
            post(ensure_conversations_for_leads),
        )
        .route(
            "/webhook/meta",
            get(meta_webhook_verify).post(meta_webhook_event),
        )
        .route(
            "/api/meta/connection",
            get(connection_status)
                .put(register_connection)
                .delete(remove_connection),
        )
        .route("/api/meta/send", post(send_message))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn db_health(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({
            "success": true,
            "message": "Database connection OK",
            "timestamp": now_iso(),
        }))
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "database health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "message": "Database connection failed",
                    "error": err.to_string(),
                    "timestamp": now_iso(),
                })),
            )
                .into_response()
        }
    }
}

async fn sync_columns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let user_id = state.identity.require(&headers)?;
    let payload = parse_body::<SyncColumnsBody>(&body)?;
    let columns = payload
        .columns
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::bad_request("columns array is required"))?;
    if columns.iter().any(|c| c.title.trim().is_empty()) {
        return Err(AppError::bad_request("every column needs a non-empty title"));
    }

    let resolved = resolve_by_titles(state.store.as_ref(), &user_id, &columns)
        .await
        .inspect_err(log_aborted(&user_id, "sync_columns"))?;
    tracing::info!(user_id = %user_id, columns = resolved.len(), "columns synced");
    Ok(Json(json!({ "success": true, "columns": resolved })))
}

async fn sync_whatsapp_leads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = state.identity.require(&headers)?;
    let summary = from_conversations(state.store.as_ref(), &user_id)
        .await
        .inspect_err(log_aborted(&user_id, "sync_whatsapp_leads"))?;
    Ok(Json(json!({
        "success": true,
        "created": summary.created,
        "skipped": summary.skipped,
        "fail": summary.fail,
    })))
}

async fn import_contacts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let user_id = state.identity.require(&headers)?;
    let mut payload = parse_body::<ImportContactsBody>(&body)?;
    let contacts = payload
        .contacts
        .take()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::bad_request("contacts array is required"))?;
    let target_column = payload.target_column()?;

    let (summary, column_id) =
        from_manual_list(state.store.as_ref(), &user_id, &contacts, target_column)
            .await
            .inspect_err(|err| {
                if !matches!(err, AppError::BadRequest(_)) {
                    log_aborted(&user_id, "import_contacts")(err);
                }
            })?;
    Ok(Json(json!({
        "success": true,
        "created": summary.created,
        "skipped": summary.skipped,
        "fail": summary.fail,
        "columnId": column_id,
    })))
}

async fn ensure_conversations_for_leads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = state.identity.require(&headers)?;
    let summary = reconcile_from_contacts(
        state.store.as_ref(),
        &user_id,
        &state.config.default_country_code,
    )
    .await
    .inspect_err(log_aborted(&user_id, "ensure_conversations_for_leads"))?;
    Ok(Json(json!({
        "success": true,
        "created": summary.created,
        "updated": summary.updated,
        "fail": summary.fail,
    })))
}

async fn columns_with_leads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = state.identity.require(&headers)?;
    let columns = state.store.list_columns(&user_id).await?;
    let mut leads = state.store.list_lead_contacts(&user_id).await?;
    leads.sort_by(|a, b| b.id.cmp(&a.id));

    let board = columns
        .into_iter()
        .map(|column| {
            let leads = leads
                .iter()
                .filter(|l| l.column_id == column.id)
                .cloned()
                .collect();
            ColumnWithLeads { column, leads }
        })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "success": true, "columns": board })))
}

async fn meta_webhook_verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let verify_token = params.get("hub.verify_token").map(String::as_str).unwrap_or("");
    let challenge = params.get("hub.challenge").map(String::as_str).unwrap_or("");

    match verify_subscription(mode, verify_token, challenge, &state.config.meta_verify_token) {
        Some(challenge) => (StatusCode::OK, challenge.to_string()).into_response(),
        None => {
            tracing::warn!(mode, "meta webhook verification rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

async fn meta_webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if state.config.verify_meta_signature {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty());
        let rejection = match signature {
            None => Some("missing webhook signature"),
            Some(_) if state.config.meta_app_secret.is_empty() => {
                tracing::warn!("VERIFY_META_SIGNATURE is true but META_APP_SECRET is not set");
                None
            }
            Some(_) if !verify_signature(&state.config.meta_app_secret, signature, &body) => {
                Some("invalid webhook signature")
            }
            Some(_) => None,
        };
        if let Some(message) = rejection {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "success": false, "message": message })),
            )
                .into_response();
        }
    }

    let payload = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "meta webhook body is not valid json");
            return Json(json!({ "received": true, "forwarded": 0 })).into_response();
        }
    };
    if !is_instagram_payload(&payload) {
        tracing::debug!(object = ?payload.get("object"), "ignoring non-instagram webhook");
    }

    let mut forwarded = 0usize;
    for event in extract_message_events(&payload) {
        let Some(session) = state.sessions.find_by_business_id(&event.channel_user_ref).await else {
            tracing::debug!(
                channel_user_ref = %event.channel_user_ref,
                "no channel session for webhook event"
            );
            continue;
        };
        let inbound = InboundEvent {
            user_id: session.user_id,
            event,
        };
        if state.inbound_tx.send(inbound).is_err() {
            tracing::error!("inbound worker is gone, dropping webhook events");
            break;
        }
        forwarded += 1;
    }

    Json(json!({ "received": true, "forwarded": forwarded })).into_response()
}

async fn register_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let user_id = state.identity.require(&headers)?;
    let payload = parse_body::<RegisterConnectionBody>(&body)?;
    let ig_business_id = payload.ig_business_id.trim().to_string();
    let access_token = payload.access_token.trim().to_string();
    if ig_business_id.is_empty() || access_token.is_empty() {
        return Err(AppError::bad_request("igBusinessId and accessToken are required"));
    }

    let replaced = state
        .sessions
        .register(ChannelSession {
            user_id,
            ig_business_id: ig_business_id.clone(),
            access_token,
            auto_reply: payload.auto_reply,
        })
        .await
        .is_some();
    Ok(Json(json!({
        "success": true,
        "igBusinessId": ig_business_id,
        "autoReply": payload.auto_reply,
        "replaced": replaced,
    })))
}

async fn connection_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = state.identity.require(&headers)?;
    let body = match state.sessions.get(&user_id).await {
        Some(session) => json!({
            "success": true,
            "connected": true,
            "igBusinessId": session.ig_business_id,
            "autoReply": session.auto_reply,
        }),
        None => json!({ "success": true, "connected": false }),
    };
    Ok(Json(body))
}

async fn remove_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = state.identity.require(&headers)?;
    let removed = state.sessions.remove(&user_id).await.is_some();
    Ok(Json(json!({ "success": true, "removed": removed })))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<SendResult>> {
    let user_id = state.identity.require(&headers)?;
    let payload = parse_body::<SendMessageBody>(&body)?;
    let session = state
        .sessions
        .get(&user_id)
        .await
        .ok_or_else(|| AppError::bad_request("no instagram connection registered"))?;

    let result = state
        .dispatcher
        .send(&session.access_token, payload.recipient_id.trim(), &payload.text)
        .await;
    Ok(Json(result))
}

pub async fn run() -> AppResult<()> {
    let _ = dotenvy::dotenv();

    let config = AppConfig::from_env()?;
    init_logging(config.log_format)?;

    let store: Arc<dyn LeadStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let db = PgPoolOptions::new()
                .max_connections(config.db_max_connections)
                .connect(&config.database_url)
                .await?;
            let store = PgStore::new(db);
            store.migrate().await?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("STORE_BACKEND=memory, data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let port = config.port;
    let app = build_router(build_state(config, store)?);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::Config(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(%addr, "lead sync server listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.map_err(|e| AppError::Config(format!("server error: {e}")))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }
    Ok(())
}
