//! Persistence boundary for columns, lead contacts and conversations.
//!
//! Every operation is scoped by `user_id`; implementations never read across users.
//! Natural keys (see the schema in `migrations/`) are enforced by the store itself,
//! so the `*_if_absent` and upsert operations stay correct under concurrent requests.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::types::{
    Column, Conversation, ConversationUpsert, LeadContact, NewLeadContact, UpsertOutcome,
};

#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Cheap round trip used by the health endpoint.
    async fn ping(&self) -> AppResult<()>;

    /// Columns of `user_id` in creation order.
    async fn list_columns(&self, user_id: &str) -> AppResult<Vec<Column>>;

    async fn first_column(&self, user_id: &str) -> AppResult<Option<Column>>;

    /// Inserts a column unless one with the same case-insensitive title exists,
    /// and returns whichever row holds that title afterwards.
    async fn insert_column_if_absent(
        &self,
        user_id: &str,
        title: &str,
        color: &str,
    ) -> AppResult<Column>;

    async fn lead_exists_by_phone(&self, user_id: &str, phone: &str) -> AppResult<bool>;

    async fn lead_exists_by_conversation(
        &self,
        user_id: &str,
        conversation_ref: &str,
    ) -> AppResult<bool>;

    /// Returns `None` when the row would violate a natural key (phone or conversation_ref).
    async fn insert_lead_contact(&self, lead: NewLeadContact) -> AppResult<Option<LeadContact>>;

    /// All lead contacts of `user_id`, ascending id.
    async fn list_lead_contacts(&self, user_id: &str) -> AppResult<Vec<LeadContact>>;

    /// Lead contacts with a phone and no conversation_ref yet, ascending id.
    async fn leads_missing_conversation(&self, user_id: &str) -> AppResult<Vec<LeadContact>>;

    /// Sets `conversation_ref` on one lead. Returns whether a row was updated.
    async fn link_lead_conversation(
        &self,
        user_id: &str,
        lead_id: i64,
        conversation_ref: &str,
    ) -> AppResult<bool>;

    async fn list_conversations(&self, user_id: &str) -> AppResult<Vec<Conversation>>;

    async fn upsert_conversation(&self, upsert: ConversationUpsert) -> AppResult<UpsertOutcome>;
}
