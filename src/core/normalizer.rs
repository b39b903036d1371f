//! Builds the upstream request body from caller messages and attachments.
//!
//! Normalization is pure: it enforces the server-controlled system prompt and
//! folds attachments into the user messages as `data:` URI image parts.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::api::{ChatMessage, ContentPart, ImageUrl, MessageContent, Role, UpstreamRequest};
use crate::core::error::ChatError;
use crate::core::request::Attachment;

/// Parses the JSON-encoded `messages` form field.
pub fn parse_messages(raw: &str) -> Result<Vec<ChatMessage>, ChatError> {
    serde_json::from_str(raw).map_err(|err| {
        ChatError::Validation(format!("messages is not a valid message list: {err}"))
    })
}

/// Runs the full normalization and wraps the result in a streaming body.
pub fn build_upstream_request(
    model: impl Into<String>,
    messages: Vec<ChatMessage>,
    attachments: Vec<Attachment>,
    system_prompt: &str,
) -> Result<UpstreamRequest, ChatError> {
    let model = model.into();
    if model.trim().is_empty() {
        return Err(ChatError::Validation("model must not be empty".to_string()));
    }
    Ok(UpstreamRequest::streaming(
        model,
        normalize(messages, attachments, system_prompt),
    ))
}

pub fn normalize(
    messages: Vec<ChatMessage>,
    attachments: Vec<Attachment>,
    system_prompt: &str,
) -> Vec<ChatMessage> {
    attach_images(enforce_system_prompt(messages, system_prompt), attachments)
}

/// Guarantees exactly one system message carrying `system_prompt`.
///
/// The first caller system message keeps its position with its content
/// replaced; further system messages are dropped. Without one, the prompt is
/// prepended.
pub fn enforce_system_prompt(messages: Vec<ChatMessage>, system_prompt: &str) -> Vec<ChatMessage> {
    let mut seen_system = false;
    let mut normalized = Vec::with_capacity(messages.len() + 1);

    for message in messages {
        if message.role != Role::System {
            normalized.push(message);
        } else if !seen_system {
            seen_system = true;
            normalized.push(ChatMessage::system(system_prompt));
        }
    }

    if !seen_system {
        normalized.insert(0, ChatMessage::system(system_prompt));
    }
    normalized
}

/// Rewrites every user message into text + image parts. Attachments are
/// consumed here and not retained afterwards.
pub fn attach_images(messages: Vec<ChatMessage>, attachments: Vec<Attachment>) -> Vec<ChatMessage> {
    if attachments.is_empty() {
        return messages;
    }

    let images: Vec<ContentPart> = attachments.into_iter().map(image_part).collect();

    messages
        .into_iter()
        .map(|message| {
            if message.role != Role::User {
                return message;
            }
            let mut parts = message.content.into_parts();
            parts.extend(images.iter().cloned());
            ChatMessage {
                role: Role::User,
                content: MessageContent::Parts(parts),
            }
        })
        .collect()
}

fn image_part(attachment: Attachment) -> ContentPart {
    ContentPart::ImageUrl {
        image_url: ImageUrl {
            url: data_uri(&attachment.mime_type, &attachment.bytes),
        },
    }
}

pub fn data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}
