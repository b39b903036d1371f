//! Stable request identity used as the dedup and cache key.

use std::fmt;

use crate::api::ChatMessage;
use crate::core::request::{Attachment, ChatRequest};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hashes model, endpoint, messages and attachments.
    ///
    /// Attachments are hashed by MIME type and raw bytes, which identifies the
    /// same content as their `data:` URIs after normalization. The caller key is
    /// left out: two callers asking the same thing share one key.
    pub fn of(request: &ChatRequest) -> Self {
        Self::from_parts(
            &request.model,
            &request.endpoint,
            &request.messages,
            &request.attachments,
        )
    }

    pub fn from_parts(
        model: &str,
        endpoint: &str,
        messages: &[ChatMessage],
        attachments: &[Attachment],
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        update_field(&mut hasher, model.as_bytes());
        update_field(&mut hasher, endpoint.as_bytes());

        // Serializing a plain data tree cannot fail; fall back to Debug anyway.
        let encoded = serde_json::to_vec(messages)
            .unwrap_or_else(|_| format!("{messages:?}").into_bytes());
        update_field(&mut hasher, &encoded);

        for attachment in attachments {
            update_field(&mut hasher, attachment.mime_type.as_bytes());
            update_field(&mut hasher, &attachment.bytes);
        }

        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Length-prefix every field so ("ab", "c") and ("a", "bc") never collide.
fn update_field(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}
