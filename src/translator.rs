//! Payload Translator (C3): a pure function from an inbound chat request
//! plus a resolved model descriptor to an evaluation payload the agent
//! understands, plus any attachments extracted from inline data URLs.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::model_registry::{Modality, ModelDescriptor};
use crate::openai::{ChatCompletionRequest, Content, Part};

#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub base64_data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub experimental_attachments: Vec<Attachment>,
    #[serde(rename = "parentMessageIds")]
    pub parent_message_ids: Vec<String>,
    #[serde(rename = "participantPosition")]
    pub participant_position: &'static str,
    #[serde(rename = "modelId")]
    pub model_id: Option<String>,
    #[serde(rename = "evaluationSessionId")]
    pub evaluation_session_id: String,
    pub status: &'static str,
    #[serde(rename = "failureReason")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationPayload {
    pub id: String,
    pub mode: &'static str,
    #[serde(rename = "modelAId")]
    pub model_a_id: String,
    #[serde(rename = "userMessageId")]
    pub user_message_id: String,
    #[serde(rename = "modelAMessageId")]
    pub model_a_message_id: String,
    pub messages: Vec<EvaluationMessage>,
    pub modality: &'static str,
}

pub struct TranslatedRequest {
    pub payload: EvaluationPayload,
    pub attachments: Vec<Attachment>,
}

fn data_url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"data:(image/\w+);base64,([A-Za-z0-9+/=]+)").expect("valid regex")
    })
}

struct DraftMessage {
    role: String,
    content: String,
}

/// Translates a chat request into the wire shape the agent expects. Pure:
/// the only nondeterminism is uuid generation for message/session ids.
pub fn translate(request: &ChatCompletionRequest, model: &ModelDescriptor) -> TranslatedRequest {
    let mut attachments = Vec::new();
    let mut drafts: Vec<DraftMessage> = Vec::with_capacity(request.messages.len());

    for msg in &request.messages {
        let role = coerce_role(&msg.role);
        let text = match &msg.content {
            Some(Content::Text(s)) => extract_inline_data_urls(s, &mut attachments),
            Some(Content::Parts(parts)) => flatten_parts(parts, &mut attachments),
            None => String::new(),
        };
        drafts.push(DraftMessage { role, content: text });
    }

    if model.model_type == Modality::Chat {
        if let Some(last_user_idx) = drafts.iter().rposition(|d| d.role == "user") {
            drafts.insert(
                last_user_idx + 1,
                DraftMessage {
                    role: "user".to_string(),
                    content: " ".to_string(),
                },
            );
        }
    }

    let session_id = Uuid::new_v4().to_string();
    let mut messages = Vec::with_capacity(drafts.len() + 1);
    let mut prev_id: Option<String> = None;
    let mut last_message_id = String::new();

    for draft in &drafts {
        let id = Uuid::new_v4().to_string();
        let parent_ids = match &prev_id {
            Some(p) => vec![p.clone()],
            None => Vec::new(),
        };
        let model_id = if draft.role == "assistant" {
            Some(model.id.clone())
        } else {
            None
        };
        messages.push(EvaluationMessage {
            id: id.clone(),
            role: draft.role.clone(),
            content: draft.content.clone(),
            experimental_attachments: Vec::new(),
            parent_message_ids: parent_ids,
            participant_position: "a",
            model_id,
            evaluation_session_id: session_id.clone(),
            status: "pending",
            failure_reason: None,
        });
        last_message_id = id.clone();
        prev_id = Some(id);
    }

    // The user-message slot is the id of whichever message happens to be
    // last before the assistant placeholder is appended, not necessarily a
    // `user`-role message.
    let user_message_id = if last_message_id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        last_message_id
    };

    let assistant_id = Uuid::new_v4().to_string();
    messages.push(EvaluationMessage {
        id: assistant_id.clone(),
        role: "assistant".to_string(),
        content: String::new(),
        experimental_attachments: Vec::new(),
        parent_message_ids: prev_id.map(|p| vec![p]).unwrap_or_default(),
        participant_position: "a",
        model_id: Some(model.id.clone()),
        evaluation_session_id: session_id.clone(),
        status: "pending",
        failure_reason: None,
    });

    let payload = EvaluationPayload {
        id: session_id,
        mode: "direct",
        model_a_id: model.id.clone(),
        user_message_id,
        model_a_message_id: assistant_id,
        messages,
        modality: model.model_type.as_str(),
    };

    TranslatedRequest {
        payload,
        attachments,
    }
}

fn coerce_role(role: &str) -> String {
    match role {
        "user" | "assistant" | "data" => role.to_string(),
        _ => "user".to_string(),
    }
}

fn flatten_parts(parts: &[Part], attachments: &mut Vec<Attachment>) -> String {
    let mut text_segments = Vec::new();
    for part in parts {
        match part {
            Part::Text { text } => text_segments.push(text.clone()),
            Part::ImageUrl { image_url } => {
                if let Some(att) = extract_data_url_attachment(&image_url.url) {
                    attachments.push(att);
                }
            }
        }
    }
    text_segments.join("\n")
}

fn extract_inline_data_urls(text: &str, attachments: &mut Vec<Attachment>) -> String {
    let re = data_url_pattern();
    let mut result = String::with_capacity(text.len());
    let mut last_end = 0;
    for caps in re.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        result.push_str(&text[last_end..whole.start()]);
        let content_type = caps.get(1).unwrap().as_str().to_string();
        let base64_data = caps.get(2).unwrap().as_str().to_string();
        let ext = content_type.split('/').nth(1).unwrap_or("bin");
        attachments.push(Attachment {
            file_name: format!("upload-{}.{}", Uuid::new_v4(), ext),
            content_type,
            base64_data,
        });
        last_end = whole.end();
    }
    result.push_str(&text[last_end..]);
    result
}

fn extract_data_url_attachment(url: &str) -> Option<Attachment> {
    let re = data_url_pattern();
    let caps = re.captures(url)?;
    let content_type = caps.get(1)?.as_str().to_string();
    let base64_data = caps.get(2)?.as_str().to_string();
    let ext = content_type.split('/').nth(1).unwrap_or("bin");
    Some(Attachment {
        file_name: format!("upload-{}.{}", Uuid::new_v4(), ext),
        content_type,
        base64_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::ChatMessageIn;

    fn model(modality: Modality) -> ModelDescriptor {
        ModelDescriptor {
            id: "model-id".into(),
            model_type: modality,
        }
    }

    fn request(messages: Vec<ChatMessageIn>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "m".into(),
            messages,
            stream: Some(true),
            temperature: None,
        }
    }

    fn text_message(role: &str, text: &str) -> ChatMessageIn {
        ChatMessageIn {
            role: role.to_string(),
            content: Some(Content::Text(text.to_string())),
        }
    }

    #[test]
    fn chat_modality_inserts_synthetic_empty_user_message_after_last_user() {
        let req = request(vec![text_message("user", "hello")]);
        let translated = translate(&req, &model(Modality::Chat));
        let roles: Vec<_> = translated
            .payload
            .messages
            .iter()
            .map(|m| (m.role.as_str(), m.content.as_str()))
            .collect();
        assert_eq!(
            roles,
            vec![("user", "hello"), ("user", " "), ("assistant", "")]
        );
    }

    #[test]
    fn image_modality_skips_synthetic_message() {
        let req = request(vec![text_message("user", "hello")]);
        let translated = translate(&req, &model(Modality::Image));
        let roles: Vec<_> = translated
            .payload
            .messages
            .iter()
            .map(|m| m.role.as_str())
            .collect();
        assert_eq!(roles, vec!["user", "assistant"]);
    }

    #[test]
    fn unknown_roles_are_coerced_to_user() {
        let req = request(vec![text_message("system", "be nice")]);
        let translated = translate(&req, &model(Modality::Image));
        assert_eq!(translated.payload.messages[0].role, "user");
    }

    #[test]
    fn message_chain_is_strictly_linear() {
        let req = request(vec![
            text_message("user", "one"),
            text_message("assistant", "two"),
            text_message("user", "three"),
        ]);
        let translated = translate(&req, &model(Modality::Image));
        let msgs = &translated.payload.messages;
        assert!(msgs[0].parent_message_ids.is_empty());
        for i in 1..msgs.len() {
            assert_eq!(msgs[i].parent_message_ids, vec![msgs[i - 1].id.clone()]);
        }
    }

    #[test]
    fn extracts_inline_data_url_from_plain_text() {
        let req = request(vec![text_message(
            "user",
            "look: data:image/png;base64,QUJD end",
        )]);
        let translated = translate(&req, &model(Modality::Image));
        let attachments = &translated.attachments;
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].content_type, "image/png");
        assert_eq!(attachments[0].base64_data, "QUJD");
        assert_eq!(translated.payload.messages[0].content, "look:  end");
    }

    #[test]
    fn extracts_data_url_from_image_part() {
        let req = request(vec![ChatMessageIn {
            role: "user".into(),
            content: Some(Content::Parts(vec![
                Part::Text {
                    text: "caption".into(),
                },
                Part::ImageUrl {
                    image_url: crate::openai::ImageUrl {
                        url: "data:image/jpeg;base64,ZZZ".into(),
                    },
                },
            ])),
        }]);
        let translated = translate(&req, &model(Modality::Image));
        let attachments = &translated.attachments;
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].content_type, "image/jpeg");
        assert_eq!(translated.payload.messages[0].content, "caption");
    }

    #[test]
    fn is_pure_given_fixed_uuid_surface() {
        // message text/role/chain shape must be identical across two runs;
        // only ids (uuid-derived) are allowed to differ.
        let req = request(vec![text_message("user", "same input")]);
        let a = translate(&req, &model(Modality::Chat));
        let b = translate(&req, &model(Modality::Chat));
        let shape = |t: &TranslatedRequest| -> Vec<(String, String)> {
            t.payload
                .messages
                .iter()
                .map(|m| (m.role.clone(), m.content.clone()))
                .collect()
        };
        assert_eq!(shape(&a), shape(&b));
    }
}
