use crate::address::normalize_address;
use crate::error::AppResult;
use crate::store::LeadStore;
use crate::types::{ConversationUpsert, LeadContact, LinkSummary, MessageEvent, UpsertOutcome};

pub const WHATSAPP_CHANNEL: &str = "whatsapp";
pub const INSTAGRAM_CHANNEL: &str = "instagram";

enum LinkOutcome {
    Linked { conversation_created: bool },
    /// Another lead already owns the address, e.g. the same number spelled differently.
    AddressTaken,
    LeadGone,
}

async fn link_one(
    store: &dyn LeadStore,
    user_id: &str,
    lead: &LeadContact,
    default_country: &str,
) -> AppResult<LinkOutcome> {
    let phone = lead.phone.as_deref().unwrap_or_default();
    let address = normalize_address(phone, default_country)?;
    if store.lead_exists_by_conversation(user_id, &address).await? {
        return Ok(LinkOutcome::AddressTaken);
    }
    let contact_name = if lead.name.trim().is_empty() {
        phone.to_string()
    } else {
        lead.name.clone()
    };

    let outcome = store
        .upsert_conversation(ConversationUpsert {
            user_id: user_id.to_string(),
            external_address: address.clone(),
            contact_name: Some(contact_name),
            contact_photo_url: None,
            tenant_channel: WHATSAPP_CHANNEL.to_string(),
            platform_user_ref: None,
        })
        .await?;

    if !store.link_lead_conversation(user_id, lead.id, &address).await? {
        return Ok(LinkOutcome::LeadGone);
    }
    Ok(LinkOutcome::Linked {
        conversation_created: outcome == UpsertOutcome::Created,
    })
}

/// Gives every phone-only lead of the user a WhatsApp conversation and links it back.
///
/// `created` counts conversations that did not exist before, `updated` counts
/// leads that were linked. A lead whose phone cannot be normalized, whose address
/// already belongs to another lead, or whose writes fail is counted in `fail`
/// without touching the conversation, and the rest of the batch proceeds.
pub async fn reconcile_from_contacts(
    store: &dyn LeadStore,
    user_id: &str,
    default_country: &str,
) -> AppResult<LinkSummary> {
    let pending = store.leads_missing_conversation(user_id).await?;
    let mut summary = LinkSummary::default();

    for lead in &pending {
        match link_one(store, user_id, lead, default_country).await {
            Ok(LinkOutcome::Linked {
                conversation_created,
            }) => {
                if conversation_created {
                    summary.created += 1;
                }
                summary.updated += 1;
            }
            Ok(LinkOutcome::AddressTaken) => {
                tracing::warn!(user_id, lead_id = lead.id, "address already linked to another lead");
                summary.fail += 1;
            }
            Ok(LinkOutcome::LeadGone) => {
                tracing::warn!(user_id, lead_id = lead.id, "lead disappeared before linking");
                summary.fail += 1;
            }
            Err(err) => {
                tracing::warn!(user_id, lead_id = lead.id, error = %err, "lead link failed");
                summary.fail += 1;
            }
        }
    }

    tracing::info!(
        user_id,
        pending = pending.len(),
        created = summary.created,
        updated = summary.updated,
        fail = summary.fail,
        "conversation link pass finished"
    );
    Ok(summary)
}

/// Records an inbound Instagram message on the sender's conversation.
pub async fn record_inbound(
    store: &dyn LeadStore,
    user_id: &str,
    event: &MessageEvent,
) -> AppResult<UpsertOutcome> {
    store
        .upsert_conversation(ConversationUpsert {
            user_id: user_id.to_string(),
            external_address: event.sender_ref.clone(),
            contact_name: None,
            contact_photo_url: None,
            tenant_channel: INSTAGRAM_CHANNEL.to_string(),
            platform_user_ref: Some(event.sender_ref.clone()),
        })
        .await
}
