use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};

use super::LeadStore;
use crate::error::AppResult;
use crate::types::{
    now_iso, Column, Conversation, ConversationUpsert, LeadContact, NewLeadContact,
    UpsertOutcome,
};

const COLUMN_FIELDS: &str = "id, user_id, title, color, created_at, updated_at";
const LEAD_FIELDS: &str = "id, user_id, name, message, avatar_url, column_id, conversation_ref, phone, created_at, updated_at";
const CONVERSATION_FIELDS: &str = "user_id, external_address, contact_name, contact_photo_url, tenant_channel, started_at, updated_at, ai_active, platform_user_ref";

fn parse_column_row(row: &PgRow) -> Result<Column, sqlx::Error> {
    Ok(Column {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        color: row.try_get("color")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_lead_row(row: &PgRow) -> Result<LeadContact, sqlx::Error> {
    Ok(LeadContact {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        message: row.try_get("message")?,
        avatar_url: row.try_get("avatar_url")?,
        column_id: row.try_get("column_id")?,
        conversation_ref: row.try_get("conversation_ref")?,
        phone: row.try_get("phone")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_conversation_row(row: &PgRow) -> Result<Conversation, sqlx::Error> {
    Ok(Conversation {
        user_id: row.try_get("user_id")?,
        external_address: row.try_get("external_address")?,
        contact_name: row.try_get("contact_name")?,
        contact_photo_url: row.try_get("contact_photo_url")?,
        tenant_channel: row.try_get("tenant_channel")?,
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
        ai_active: row.try_get("ai_active")?,
        platform_user_ref: row.try_get("platform_user_ref")?,
    })
}

pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        Ok(())
    }
}

#[async_trait]
impl LeadStore for PgStore {
    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }

    async fn list_columns(&self, user_id: &str) -> AppResult<Vec<Column>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMN_FIELDS} FROM pipeline_columns WHERE user_id = $1 ORDER BY id ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .iter()
            .map(parse_column_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn first_column(&self, user_id: &str) -> AppResult<Option<Column>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMN_FIELDS} FROM pipeline_columns WHERE user_id = $1 ORDER BY id ASC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(parse_column_row).transpose()?)
    }

    async fn insert_column_if_absent(
        &self,
        user_id: &str,
        title: &str,
        color: &str,
    ) -> AppResult<Column> {
        let now = now_iso();
        let inserted = sqlx::query(&format!(
            "INSERT INTO pipeline_columns (user_id, title, color, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $4) \
             ON CONFLICT DO NOTHING \
             RETURNING {COLUMN_FIELDS}"
        ))
        .bind(user_id)
        .bind(title)
        .bind(color)
        .bind(&now)
        .fetch_optional(&self.db)
        .await?;
        if let Some(row) = inserted {
            return Ok(parse_column_row(&row)?);
        }

        let existing = sqlx::query(&format!(
            "SELECT {COLUMN_FIELDS} FROM pipeline_columns \
             WHERE user_id = $1 AND lower(title) = lower($2) \
             ORDER BY id ASC LIMIT 1"
        ))
        .bind(user_id)
        .bind(title)
        .fetch_one(&self.db)
        .await?;
        Ok(parse_column_row(&existing)?)
    }

    async fn lead_exists_by_phone(&self, user_id: &str, phone: &str) -> AppResult<bool> {
        let found = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM lead_contacts WHERE user_id = $1 AND phone = $2 LIMIT 1",
        )
        .bind(user_id)
        .bind(phone)
        .fetch_optional(&self.db)
        .await?;
        Ok(found.is_some())
    }

    async fn lead_exists_by_conversation(
        &self,
        user_id: &str,
        conversation_ref: &str,
    ) -> AppResult<bool> {
        let found = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM lead_contacts WHERE user_id = $1 AND conversation_ref = $2 LIMIT 1",
        )
        .bind(user_id)
        .bind(conversation_ref)
        .fetch_optional(&self.db)
        .await?;
        Ok(found.is_some())
    }

    async fn insert_lead_contact(&self, lead: NewLeadContact) -> AppResult<Option<LeadContact>> {
        let now = now_iso();
        let row = sqlx::query(&format!(
            "INSERT INTO lead_contacts \
             (user_id, name, message, avatar_url, column_id, conversation_ref, phone, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) \
             ON CONFLICT DO NOTHING \
             RETURNING {LEAD_FIELDS}"
        ))
        .bind(&lead.user_id)
        .bind(&lead.name)
        .bind(&lead.message)
        .bind(&lead.avatar_url)
        .bind(lead.column_id)
        .bind(&lead.conversation_ref)
        .bind(&lead.phone)
        .bind(&now)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(parse_lead_row).transpose()?)
    }

    async fn list_lead_contacts(&self, user_id: &str) -> AppResult<Vec<LeadContact>> {
        let rows = sqlx::query(&format!(
            "SELECT {LEAD_FIELDS} FROM lead_contacts WHERE user_id = $1 ORDER BY id ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(parse_lead_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn leads_missing_conversation(&self, user_id: &str) -> AppResult<Vec<LeadContact>> {
        let rows = sqlx::query(&format!(
            "SELECT {LEAD_FIELDS} FROM lead_contacts \
             WHERE user_id = $1 AND conversation_ref IS NULL AND phone IS NOT NULL \
             ORDER BY id ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(parse_lead_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn link_lead_conversation(
        &self,
        user_id: &str,
        lead_id: i64,
        conversation_ref: &str,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE lead_contacts SET conversation_ref = $1, updated_at = $2 \
             WHERE id = $3 AND user_id = $4",
        )
        .bind(conversation_ref)
        .bind(now_iso())
        .bind(lead_id)
        .bind(user_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_conversations(&self, user_id: &str) -> AppResult<Vec<Conversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_FIELDS} FROM conversations \
             WHERE user_id = $1 ORDER BY started_at ASC, external_address ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .iter()
            .map(parse_conversation_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn upsert_conversation(&self, upsert: ConversationUpsert) -> AppResult<UpsertOutcome> {
        let now = now_iso();
        // xmax is 0 only for a freshly inserted tuple
        let inserted = sqlx::query_scalar::<_, bool>(
            "INSERT INTO conversations \
             (user_id, external_address, contact_name, contact_photo_url, tenant_channel, started_at, updated_at, ai_active, platform_user_ref) \
             VALUES ($1, $2, $3, $4, $5, $6, $6, false, $7) \
             ON CONFLICT (user_id, external_address) DO UPDATE SET \
               contact_name = COALESCE(EXCLUDED.contact_name, conversations.contact_name), \
               contact_photo_url = COALESCE(EXCLUDED.contact_photo_url, conversations.contact_photo_url), \
               platform_user_ref = COALESCE(EXCLUDED.platform_user_ref, conversations.platform_user_ref), \
               tenant_channel = EXCLUDED.tenant_channel, \
               updated_at = EXCLUDED.updated_at \
             RETURNING (xmax = 0)",
        )
        .bind(&upsert.user_id)
        .bind(&upsert.external_address)
        .bind(&upsert.contact_name)
        .bind(&upsert.contact_photo_url)
        .bind(&upsert.tenant_channel)
        .bind(&now)
        .bind(&upsert.platform_user_ref)
        .fetch_one(&self.db)
        .await?;
        Ok(if inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }
}
