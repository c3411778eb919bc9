use async_trait::async_trait;
use tokio::sync::Mutex;

use super::LeadStore;
use crate::error::{AppError, AppResult};
use crate::types::{
    now_iso, Column, Conversation, ConversationUpsert, LeadContact, NewLeadContact,
    UpsertOutcome,
};

#[derive(Default)]
struct Tables {
    columns: Vec<Column>,
    leads: Vec<LeadContact>,
    conversations: Vec<Conversation>,
    next_column_id: i64,
    next_lead_id: i64,
}

/// Process-local store. One lock guards all tables, so each call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn list_columns(&self, user_id: &str) -> AppResult<Vec<Column>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .columns
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn first_column(&self, user_id: &str) -> AppResult<Option<Column>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .columns
            .iter()
            .filter(|c| c.user_id == user_id)
            .min_by_key(|c| c.id)
            .cloned())
    }

    async fn insert_column_if_absent(
        &self,
        user_id: &str,
        title: &str,
        color: &str,
    ) -> AppResult<Column> {
        let mut tables = self.tables.lock().await;
        let wanted = title.to_lowercase();
        if let Some(existing) = tables
            .columns
            .iter()
            .find(|c| c.user_id == user_id && c.title.to_lowercase() == wanted)
        {
            return Ok(existing.clone());
        }
        tables.next_column_id += 1;
        let now = now_iso();
        let column = Column {
            id: tables.next_column_id,
            user_id: user_id.to_string(),
            title: title.to_string(),
            color: color.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };
        tables.columns.push(column.clone());
        Ok(column)
    }

    async fn lead_exists_by_phone(&self, user_id: &str, phone: &str) -> AppResult<bool> {
        let tables = self.tables.lock().await;
        Ok(tables
            .leads
            .iter()
            .any(|l| l.user_id == user_id && l.phone.as_deref() == Some(phone)))
    }

    async fn lead_exists_by_conversation(
        &self,
        user_id: &str,
        conversation_ref: &str,
    ) -> AppResult<bool> {
        let tables = self.tables.lock().await;
        Ok(tables.leads.iter().any(|l| {
            l.user_id == user_id && l.conversation_ref.as_deref() == Some(conversation_ref)
        }))
    }

    async fn insert_lead_contact(&self, lead: NewLeadContact) -> AppResult<Option<LeadContact>> {
        let mut tables = self.tables.lock().await;
        let column_owned = tables
            .columns
            .iter()
            .any(|c| c.id == lead.column_id && c.user_id == lead.user_id);
        if !column_owned {
            return Err(AppError::Persistence(format!(
                "column {} does not belong to user {}",
                lead.column_id, lead.user_id
            )));
        }
        let clashes = tables.leads.iter().any(|l| {
            l.user_id == lead.user_id
                && ((lead.phone.is_some() && l.phone == lead.phone)
                    || (lead.conversation_ref.is_some()
                        && l.conversation_ref == lead.conversation_ref))
        });
        if clashes {
            return Ok(None);
        }

        tables.next_lead_id += 1;
        let now = now_iso();
        let row = LeadContact {
            id: tables.next_lead_id,
            user_id: lead.user_id,
            name: lead.name,
            message: lead.message,
            avatar_url: lead.avatar_url,
            column_id: lead.column_id,
            conversation_ref: lead.conversation_ref,
            phone: lead.phone,
            created_at: now.clone(),
            updated_at: now,
        };
        tables.leads.push(row.clone());
        Ok(Some(row))
    }

    async fn list_lead_contacts(&self, user_id: &str) -> AppResult<Vec<LeadContact>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .leads
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn leads_missing_conversation(&self, user_id: &str) -> AppResult<Vec<LeadContact>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .leads
            .iter()
            .filter(|l| l.user_id == user_id && l.conversation_ref.is_none() && l.phone.is_some())
            .cloned()
            .collect())
    }

    async fn link_lead_conversation(
        &self,
        user_id: &str,
        lead_id: i64,
        conversation_ref: &str,
    ) -> AppResult<bool> {
        let mut tables = self.tables.lock().await;
        let taken = tables.leads.iter().any(|l| {
            l.user_id == user_id
                && l.id != lead_id
                && l.conversation_ref.as_deref() == Some(conversation_ref)
        });
        if taken {
            return Err(AppError::Persistence(format!(
                "conversation {conversation_ref} is already linked to another lead"
            )));
        }
        let Some(lead) = tables
            .leads
            .iter_mut()
            .find(|l| l.user_id == user_id && l.id == lead_id)
        else {
            return Ok(false);
        };
        lead.conversation_ref = Some(conversation_ref.to_string());
        lead.updated_at = now_iso();
        Ok(true)
    }

    async fn list_conversations(&self, user_id: &str) -> AppResult<Vec<Conversation>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .conversations
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn upsert_conversation(&self, upsert: ConversationUpsert) -> AppResult<UpsertOutcome> {
        let mut tables = self.tables.lock().await;
        let now = now_iso();
        if let Some(existing) = tables.conversations.iter_mut().find(|c| {
            c.user_id == upsert.user_id && c.external_address == upsert.external_address
        }) {
            if upsert.contact_name.is_some() {
                existing.contact_name = upsert.contact_name;
            }
            if upsert.contact_photo_url.is_some() {
                existing.contact_photo_url = upsert.contact_photo_url;
            }
            if upsert.platform_user_ref.is_some() {
                existing.platform_user_ref = upsert.platform_user_ref;
            }
            existing.tenant_channel = upsert.tenant_channel;
            existing.updated_at = now;
            return Ok(UpsertOutcome::Updated);
        }
        tables.conversations.push(Conversation {
            user_id: upsert.user_id,
            external_address: upsert.external_address,
            contact_name: upsert.contact_name,
            contact_photo_url: upsert.contact_photo_url,
            tenant_channel: upsert.tenant_channel,
            started_at: now.clone(),
            updated_at: now,
            ai_active: false,
            platform_user_ref: upsert.platform_user_ref,
        });
        Ok(UpsertOutcome::Created)
    }
}
