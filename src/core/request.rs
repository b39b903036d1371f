use bytes::Bytes;

use crate::api::ChatMessage;

/// A binary attachment (an image, in practice) owned by one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: String,
    pub bytes: Bytes,
}

impl Attachment {
    pub fn new(mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Guesses an image MIME type from a file extension.
    pub fn mime_for_extension(extension: &str) -> &'static str {
        match extension.to_ascii_lowercase().as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            _ => "application/octet-stream",
        }
    }
}

/// A caller's chat request before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub model: String,
    /// Logical route name, used when requests go through a gateway.
    pub endpoint: String,
    pub messages: Vec<ChatMessage>,
    pub attachments: Vec<Attachment>,
    /// Caller-supplied credential; overrides the relay's default key.
    pub key: Option<String>,
}

impl ChatRequest {
    pub fn new(
        model: impl Into<String>,
        endpoint: impl Into<String>,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            model: model.into(),
            endpoint: endpoint.into(),
            messages,
            attachments: Vec::new(),
            key: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}
