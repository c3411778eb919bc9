use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::types::MessageEvent;

pub const INSTAGRAM_OBJECT: &str = "instagram";

/// Reads an id that Meta may send either as a string or as a number.
fn id_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn message_text(message: &Value) -> Option<String> {
    let text = match message.get("text")? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn event_from_messaging(entry_id: Option<&str>, ev: &Value) -> Option<MessageEvent> {
    let message = ev.get("message").filter(|m| m.is_object())?;
    let text = message_text(message);
    let attachments = message
        .get("attachments")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if text.is_none() && attachments.is_empty() {
        return None;
    }

    let sender_ref = id_text(ev.get("sender").and_then(|s| s.get("id")))?;
    let channel_user_ref = id_text(ev.get("recipient").and_then(|r| r.get("id")))
        .or_else(|| entry_id.map(str::to_string))?;

    Some(MessageEvent {
        channel_user_ref,
        sender_ref,
        message_id: id_text(message.get("mid")),
        text,
        attachments,
    })
}

/// Flattens an Instagram webhook delivery into canonical message events.
///
/// The sequence is lazy and borrows `payload`. Anything that is not a text or
/// attachment message (deliveries, reads, reactions, handovers) is skipped, as is
/// any event without a sender or a receiving account.
pub fn extract_message_events(payload: &Value) -> impl Iterator<Item = MessageEvent> + '_ {
    let entries = if payload.get("object").and_then(Value::as_str) == Some(INSTAGRAM_OBJECT) {
        payload.get("entry").and_then(Value::as_array)
    } else {
        None
    };

    entries.into_iter().flatten().flat_map(|entry| {
        let entry_id = id_text(entry.get("id"));
        entry
            .get("messaging")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(move |ev| event_from_messaging(entry_id.as_deref(), ev))
    })
}

pub fn is_instagram_payload(payload: &Value) -> bool {
    payload.get("object").and_then(Value::as_str) == Some(INSTAGRAM_OBJECT)
        && payload.get("entry").is_some_and(Value::is_array)
}

/// Checks an `X-Hub-Signature-256` header against the raw request body.
pub fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Meta subscription handshake. Returns the challenge to echo back when accepted.
pub fn verify_subscription<'a>(
    mode: &str,
    verify_token: &str,
    challenge: &'a str,
    expected_token: &str,
) -> Option<&'a str> {
    if mode == "subscribe"
        && !challenge.is_empty()
        && !expected_token.is_empty()
        && verify_token == expected_token
    {
        Some(challenge)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_event(sender: &str, recipient: &str, mid: &str, text: &str) -> Value {
        json!({
            "sender": { "id": sender },
            "recipient": { "id": recipient },
            "timestamp": 1_700_000_000_000u64,
            "message": { "mid": mid, "text": text }
        })
    }

    #[test]
    fn delivery_receipts_are_dropped() {
        let payload = json!({
            "object": "instagram",
            "entry": [{
                "id": "17841400000000000",
                "time": 1_700_000_000_000u64,
                "messaging": [
                    {
                        "sender": { "id": "111" },
                        "recipient": { "id": "17841400000000000" },
                        "delivery": { "mids": ["m_0"], "watermark": 1 }
                    },
                    text_event("111", "17841400000000000", "m_1", "  hola  ")
                ]
            }]
        });

        let events = extract_message_events(&payload).collect::<Vec<_>>();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text.as_deref(), Some("hola"));
        assert_eq!(events[0].message_id.as_deref(), Some("m_1"));
        assert_eq!(events[0].sender_ref, "111");
        assert_eq!(events[0].channel_user_ref, "17841400000000000");
    }

    #[test]
    fn other_objects_yield_nothing() {
        let payload = json!({
            "object": "page",
            "entry": [{ "id": "1", "messaging": [text_event("1", "2", "m", "hi")] }]
        });
        assert_eq!(extract_message_events(&payload).count(), 0);
        assert!(!is_instagram_payload(&payload));

        let not_array = json!({ "object": "instagram", "entry": { "id": "1" } });
        assert_eq!(extract_message_events(&not_array).count(), 0);
        assert!(!is_instagram_payload(&not_array));
    }

    #[test]
    fn attachment_only_messages_are_kept() {
        let payload = json!({
            "object": "instagram",
            "entry": [{
                "id": "999",
                "messaging": [{
                    "sender": { "id": 42 },
                    "message": {
                        "mid": "m_att",
                        "attachments": [{ "type": "image", "payload": { "url": "https://x/y.jpg" } }]
                    }
                }]
            }]
        });
        let events = extract_message_events(&payload).collect::<Vec<_>>();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, None);
        assert_eq!(events[0].attachments.len(), 1);
        assert_eq!(events[0].sender_ref, "42");
        // no recipient on the event, so the entry id is used
        assert_eq!(events[0].channel_user_ref, "999");
    }

    #[test]
    fn malformed_events_do_not_stop_the_batch() {
        let payload = json!({
            "object": "instagram",
            "entry": [
                "garbage",
                { "id": "1", "messaging": "nope" },
                {
                    "id": "2",
                    "messaging": [
                        { "message": { "text": "no sender" } },
                        { "sender": { "id": "5" }, "message": { "text": "   " } },
                        { "sender": { "id": "5" }, "reaction": { "reaction": "love" } },
                        { "sender": { "id": "5" }, "message": "not an object" },
                        text_event("6", "2", "m_ok", "still here")
                    ]
                }
            ]
        });
        let events = extract_message_events(&payload).collect::<Vec<_>>();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sender_ref, "6");
    }

    #[test]
    fn missing_channel_reference_drops_event() {
        let payload = json!({
            "object": "instagram",
            "entry": [{ "messaging": [{ "sender": { "id": "5" }, "message": { "text": "hi" } }] }]
        });
        assert_eq!(extract_message_events(&payload).count(), 0);
    }

    #[test]
    fn signature_round_trip() {
        let body = br#"{"object":"instagram","entry":[]}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(b"app-secret").unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        assert!(verify_signature("app-secret", Some(&format!("sha256={sig}")), body));
        assert!(verify_signature("app-secret", Some(&sig), body));
        assert!(!verify_signature("other-secret", Some(&sig), body));
        assert!(!verify_signature("app-secret", None, body));
        assert!(!verify_signature("app-secret", Some("sha256=zz"), body));
    }

    #[test]
    fn subscription_requires_matching_token() {
        assert_eq!(verify_subscription("subscribe", "tok", "123", "tok"), Some("123"));
        assert_eq!(verify_subscription("subscribe", "bad", "123", "tok"), None);
        assert_eq!(verify_subscription("unsubscribe", "tok", "123", "tok"), None);
        assert_eq!(verify_subscription("subscribe", "", "123", ""), None);
    }
}
