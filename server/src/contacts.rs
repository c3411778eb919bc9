use crate::address::{address_local_part, is_group_address};
use crate::columns::{resolve_or_create_first, resolve_target};
use crate::conversations::WHATSAPP_CHANNEL;
use crate::error::AppResult;
use crate::store::LeadStore;
use crate::types::{ManualContact, NewLeadContact, ReconcileSummary};

pub const IMPORTED_CONTACT_MESSAGE: &str = "Imported contact";
pub const WHATSAPP_CONTACT_MESSAGE: &str = "WhatsApp contact";

/// Inserts one lead and folds the outcome into `summary`.
///
/// A natural-key conflict means another request created the lead first, so it
/// counts as skipped. Other store failures are tallied and do not stop the batch.
async fn insert_counted(
    store: &dyn LeadStore,
    lead: NewLeadContact,
    summary: &mut ReconcileSummary,
) {
    let user_id = lead.user_id.clone();
    match store.insert_lead_contact(lead).await {
        Ok(Some(_)) => summary.created += 1,
        Ok(None) => summary.skipped += 1,
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "lead insert failed");
            summary.fail += 1;
        }
    }
}

/// Creates leads from a manually supplied `{name, phone}` list, deduplicating on phone.
///
/// New leads go to `target_column` when given (it must belong to the user),
/// otherwise to the first column. Returns the summary together with the id of
/// the column new leads were placed in.
pub async fn from_manual_list(
    store: &dyn LeadStore,
    user_id: &str,
    entries: &[ManualContact],
    target_column: Option<i64>,
) -> AppResult<(ReconcileSummary, i64)> {
    let column = resolve_target(store, user_id, target_column).await?;
    let mut summary = ReconcileSummary::default();

    for entry in entries {
        let name = entry.name.as_deref().unwrap_or("").trim();
        let phone = entry.phone.as_deref().unwrap_or("").trim();
        if phone.is_empty() {
            summary.skipped += 1;
            continue;
        }
        if store.lead_exists_by_phone(user_id, phone).await? {
            summary.skipped += 1;
            continue;
        }

        let display_name = if name.is_empty() { phone } else { name };
        let lead = NewLeadContact {
            user_id: user_id.to_string(),
            name: display_name.to_string(),
            message: IMPORTED_CONTACT_MESSAGE.to_string(),
            avatar_url: None,
            column_id: column.id,
            conversation_ref: None,
            phone: Some(phone.to_string()),
        };
        insert_counted(store, lead, &mut summary).await;
    }

    tracing::info!(
        user_id,
        column_id = column.id,
        created = summary.created,
        skipped = summary.skipped,
        fail = summary.fail,
        "manual contact import finished"
    );
    Ok((summary, column.id))
}

/// Creates one lead per existing one-to-one WhatsApp conversation of the user.
///
/// Group conversations and other channels (Instagram) are never turned into leads. The lead is keyed by the
/// conversation address; its phone stays unknown.
pub async fn from_conversations(
    store: &dyn LeadStore,
    user_id: &str,
) -> AppResult<ReconcileSummary> {
    let conversations = store.list_conversations(user_id).await?;
    let column = resolve_or_create_first(store, user_id).await?;
    let mut summary = ReconcileSummary::default();

    for conversation in conversations
        .into_iter()
        .filter(|c| c.tenant_channel == WHATSAPP_CHANNEL && !is_group_address(&c.external_address))
    {
        let address = conversation.external_address;
        if store.lead_exists_by_conversation(user_id, &address).await? {
            summary.skipped += 1;
            continue;
        }

        let name = conversation
            .contact_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| address_local_part(&address))
            .to_string();
        let lead = NewLeadContact {
            user_id: user_id.to_string(),
            name,
            message: WHATSAPP_CONTACT_MESSAGE.to_string(),
            avatar_url: conversation.contact_photo_url,
            column_id: column.id,
            conversation_ref: Some(address),
            phone: None,
        };
        insert_counted(store, lead, &mut summary).await;
    }

    tracing::info!(
        user_id,
        created = summary.created,
        skipped = summary.skipped,
        fail = summary.fail,
        "conversation lead sync finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::store::MemoryStore;
    use crate::types::{
        Column, Conversation, ConversationUpsert, LeadContact, UpsertOutcome,
    };
    use async_trait::async_trait;
    use std::collections::HashSet;

    fn contact(name: &str, phone: &str) -> ManualContact {
        ManualContact {
            name: Some(name.to_string()),
            phone: Some(phone.to_string()),
        }
    }

    async fn add_conversation(store: &MemoryStore, user: &str, address: &str, name: Option<&str>) {
        add_channel_conversation(store, user, address, name, WHATSAPP_CHANNEL).await;
    }

    async fn add_channel_conversation(
        store: &MemoryStore,
        user: &str,
        address: &str,
        name: Option<&str>,
        channel: &str,
    ) {
        store
            .upsert_conversation(ConversationUpsert {
                user_id: user.to_string(),
                external_address: address.to_string(),
                contact_name: name.map(str::to_string),
                contact_photo_url: None,
                tenant_channel: channel.to_string(),
                platform_user_ref: None,
            })
            .await
            .unwrap();
    }

    fn assert_unique_keys(leads: &[LeadContact]) {
        let mut phones = HashSet::new();
        let mut refs = HashSet::new();
        for lead in leads {
            if let Some(phone) = &lead.phone {
                assert!(phones.insert(phone.clone()), "duplicate phone {phone}");
            }
            if let Some(conv) = &lead.conversation_ref {
                assert!(refs.insert(conv.clone()), "duplicate conversation {conv}");
            }
        }
    }

    #[tokio::test]
    async fn empty_phone_is_skipped_without_affecting_neighbours() {
        let store = MemoryStore::new();
        let entries = vec![
            contact("Ana", "600111222"),
            contact("Nobody", "   "),
            contact("", "600333444"),
        ];

        let (summary, column_id) = from_manual_list(&store, "u1", &entries, None).await.unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.fail, 0);

        let leads = store.list_lead_contacts("u1").await.unwrap();
        assert_eq!(leads.len(), 2);
        assert_eq!(leads[0].name, "Ana");
        assert_eq!(leads[1].name, "600333444");
        assert!(leads.iter().all(|l| l.column_id == column_id));
        assert!(leads.iter().all(|l| l.message == IMPORTED_CONTACT_MESSAGE));
    }

    #[tokio::test]
    async fn repeated_import_does_not_duplicate_phones() {
        let store = MemoryStore::new();
        let entries = vec![contact("Ana", "600111222"), contact("Ana again", "600111222")];

        let (first, _) = from_manual_list(&store, "u1", &entries, None).await.unwrap();
        assert_eq!((first.created, first.skipped), (1, 1));
        let (second, _) = from_manual_list(&store, "u1", &entries, None).await.unwrap();
        assert_eq!((second.created, second.skipped), (0, 2));

        // same phone under another user is independent
        let (other, _) = from_manual_list(&store, "u2", &entries, None).await.unwrap();
        assert_eq!(other.created, 1);

        assert_unique_keys(&store.list_lead_contacts("u1").await.unwrap());
    }

    #[tokio::test]
    async fn conversation_sync_is_idempotent() {
        let store = MemoryStore::new();
        add_conversation(&store, "u1", "34600111222@s.whatsapp.net", Some("Ana")).await;
        add_conversation(&store, "u1", "34600333444@s.whatsapp.net", None).await;

        let first = from_conversations(&store, "u1").await.unwrap();
        assert_eq!(first.created, 2);
        let second = from_conversations(&store, "u1").await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 2);

        let leads = store.list_lead_contacts("u1").await.unwrap();
        assert_unique_keys(&leads);
        let unnamed = leads
            .iter()
            .find(|l| l.conversation_ref.as_deref() == Some("34600333444@s.whatsapp.net"))
            .unwrap();
        assert_eq!(unnamed.name, "34600333444");
        assert_eq!(unnamed.phone, None);
    }

    #[tokio::test]
    async fn group_conversations_never_become_leads() {
        let store = MemoryStore::new();
        add_conversation(&store, "u1", "120363041234567890@g.us", Some("Family")).await;

        let summary = from_conversations(&store, "u1").await.unwrap();
        assert_eq!(summary, ReconcileSummary::default());
        assert!(store.list_lead_contacts("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn instagram_conversations_never_become_whatsapp_leads() {
        let store = MemoryStore::new();
        add_channel_conversation(&store, "u1", "555", None, "instagram").await;
        add_conversation(&store, "u1", "34600111222@s.whatsapp.net", Some("Ana")).await;

        let summary = from_conversations(&store, "u1").await.unwrap();
        assert_eq!(summary, ReconcileSummary { created: 1, skipped: 0, fail: 0 });
        let leads = store.list_lead_contacts("u1").await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].name, "Ana");
    }

    #[tokio::test]
    async fn numeric_phones_import_alongside_text_ones() {
        let store = MemoryStore::new();
        let entries: Vec<ManualContact> = serde_json::from_value(serde_json::json!([
            { "name": "Ana", "phone": "600111222" },
            { "name": "Num", "phone": 600333444 },
            { "name": "Broken", "phone": ["600"] },
            { "name": "Luis", "phone": "600555666" }
        ]))
        .unwrap();

        let (summary, _) = from_manual_list(&store, "u1", &entries, None).await.unwrap();
        assert_eq!(summary, ReconcileSummary { created: 3, skipped: 1, fail: 0 });
        let phones = store
            .list_lead_contacts("u1")
            .await
            .unwrap()
            .into_iter()
            .filter_map(|l| l.phone)
            .collect::<Vec<_>>();
        assert_eq!(phones, vec!["600111222", "600333444", "600555666"]);
    }

    #[tokio::test]
    async fn manual_import_into_requested_column() {
        let store = MemoryStore::new();
        store.insert_column_if_absent("u1", "Inbox", "blue").await.unwrap();
        let hot = store.insert_column_if_absent("u1", "Hot", "red").await.unwrap();
        let foreign = store.insert_column_if_absent("u2", "Hot", "red").await.unwrap();
        let entries = vec![contact("Ana", "600111222")];

        let (summary, column_id) = from_manual_list(&store, "u1", &entries, Some(hot.id))
            .await
            .unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(column_id, hot.id);
        assert_eq!(store.list_lead_contacts("u1").await.unwrap()[0].column_id, hot.id);

        let result = from_manual_list(&store, "u1", &entries, Some(foreign.id)).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    /// Delegates to a memory store but fails inserts for one phone number.
    struct FailingInsertStore {
        inner: MemoryStore,
        poisoned_phone: &'static str,
    }

    #[async_trait]
    impl LeadStore for FailingInsertStore {
        async fn ping(&self) -> AppResult<()> {
            self.inner.ping().await
        }
        async fn list_columns(&self, user_id: &str) -> AppResult<Vec<Column>> {
            self.inner.list_columns(user_id).await
        }
        async fn first_column(&self, user_id: &str) -> AppResult<Option<Column>> {
            self.inner.first_column(user_id).await
        }
        async fn insert_column_if_absent(
            &self,
            user_id: &str,
            title: &str,
            color: &str,
        ) -> AppResult<Column> {
            self.inner.insert_column_if_absent(user_id, title, color).await
        }
        async fn lead_exists_by_phone(&self, user_id: &str, phone: &str) -> AppResult<bool> {
            self.inner.lead_exists_by_phone(user_id, phone).await
        }
        async fn lead_exists_by_conversation(
            &self,
            user_id: &str,
            conversation_ref: &str,
        ) -> AppResult<bool> {
            self.inner.lead_exists_by_conversation(user_id, conversation_ref).await
        }
        async fn insert_lead_contact(
            &self,
            lead: NewLeadContact,
        ) -> AppResult<Option<LeadContact>> {
            if lead.phone.as_deref() == Some(self.poisoned_phone) {
                return Err(AppError::Persistence("connection reset".into()));
            }
            self.inner.insert_lead_contact(lead).await
        }
        async fn list_lead_contacts(&self, user_id: &str) -> AppResult<Vec<LeadContact>> {
            self.inner.list_lead_contacts(user_id).await
        }
        async fn leads_missing_conversation(&self, user_id: &str) -> AppResult<Vec<LeadContact>> {
            self.inner.leads_missing_conversation(user_id).await
        }
        async fn link_lead_conversation(
            &self,
            user_id: &str,
            lead_id: i64,
            conversation_ref: &str,
        ) -> AppResult<bool> {
            self.inner
                .link_lead_conversation(user_id, lead_id, conversation_ref)
                .await
        }
        async fn list_conversations(&self, user_id: &str) -> AppResult<Vec<Conversation>> {
            self.inner.list_conversations(user_id).await
        }
        async fn upsert_conversation(
            &self,
            upsert: ConversationUpsert,
        ) -> AppResult<UpsertOutcome> {
            self.inner.upsert_conversation(upsert).await
        }
    }

    #[tokio::test]
    async fn insert_failure_is_counted_and_batch_continues() {
        let store = FailingInsertStore {
            inner: MemoryStore::new(),
            poisoned_phone: "600000002",
        };
        let entries = vec![
            contact("One", "600000001"),
            contact("Two", "600000002"),
            contact("Three", "600000003"),
        ];

        let (summary, _) = from_manual_list(&store, "u1", &entries, None).await.unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(summary.fail, 1);
        let phones = store
            .list_lead_contacts("u1")
            .await
            .unwrap()
            .into_iter()
            .filter_map(|l| l.phone)
            .collect::<Vec<_>>();
        assert_eq!(phones, vec!["600000001", "600000003"]);
    }
}
