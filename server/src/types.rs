use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::dispatch::MessageDispatcher;
use crate::error::{AppError, AppResult};
use crate::identity::IdentityResolver;
use crate::registry::SessionRegistry;
use crate::store::LeadStore;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// A pipeline stage. `id` order is creation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: i64,
    pub user_id: String,
    pub title: String,
    pub color: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadContact {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub message: String,
    pub avatar_url: Option<String>,
    pub column_id: i64,
    pub conversation_ref: Option<String>,
    pub phone: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewLeadContact {
    pub user_id: String,
    pub name: String,
    pub message: String,
    pub avatar_url: Option<String>,
    pub column_id: i64,
    pub conversation_ref: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub user_id: String,
    pub external_address: String,
    pub contact_name: Option<String>,
    pub contact_photo_url: Option<String>,
    pub tenant_channel: String,
    pub started_at: String,
    pub updated_at: String,
    pub ai_active: bool,
    pub platform_user_ref: Option<String>,
}

/// Fields written by a conversation upsert. `None` keeps the stored value on update.
#[derive(Debug, Clone)]
pub struct ConversationUpsert {
    pub user_id: String,
    pub external_address: String,
    pub contact_name: Option<String>,
    pub contact_photo_url: Option<String>,
    pub tenant_channel: String,
    pub platform_user_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Canonical inbound message produced by the webhook extractor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub channel_user_ref: String,
    pub sender_ref: String,
    pub message_id: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<Value>,
}

/// An extracted event paired with the user whose channel session received it.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub user_id: String,
    pub event: MessageEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedColumn {
    pub title: String,
    pub color: String,
    pub id: String,
}

/// One entry of a manual import. Accepts any JSON value so a malformed entry
/// only affects itself: numbers become text, anything else reads as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Value")]
pub struct ManualContact {
    pub name: Option<String>,
    pub phone: Option<String>,
}

fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl From<Value> for ManualContact {
    fn from(entry: Value) -> Self {
        Self {
            name: scalar_text(entry.get("name")),
            phone: scalar_text(entry.get("phone")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub created: u32,
    pub skipped: u32,
    pub fail: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkSummary {
    pub created: u32,
    pub updated: u32,
    pub fail: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnWithLeads {
    #[serde(flatten)]
    pub column: Column,
    pub leads: Vec<LeadContact>,
}

#[derive(Debug, Deserialize)]
pub struct SyncColumnsBody {
    #[serde(default)]
    pub columns: Option<Vec<ColumnRequest>>,
}

#[derive(Debug, Deserialize)]
pub struct ImportContactsBody {
    #[serde(default)]
    pub contacts: Option<Vec<ManualContact>>,
    #[serde(default, rename = "columnId", alias = "column_id")]
    pub column_id: Option<Value>,
}

impl ImportContactsBody {
    /// Requested target column. Ids arrive as numbers or as the strings `sync_columns` returns.
    pub fn target_column(&self) -> AppResult<Option<i64>> {
        let parsed = match &self.column_id {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
            Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
            Some(_) => None,
        };
        parsed
            .map(Some)
            .ok_or_else(|| AppError::bad_request("columnId must be a column id"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterConnectionBody {
    #[serde(default)]
    pub ig_business_id: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub auto_reply: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    #[serde(default)]
    pub recipient_id: String,
    #[serde(default)]
    pub text: String,
}

pub struct AppState {
    pub store: Arc<dyn LeadStore>,
    pub sessions: SessionRegistry,
    pub dispatcher: MessageDispatcher,
    pub identity: IdentityResolver,
    pub config: AppConfig,
    pub inbound_tx: mpsc::UnboundedSender<InboundEvent>,
}
