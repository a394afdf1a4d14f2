//! Prompt content blocks.
//!
//! The WS boundary parses prompt content into these tagged variants once;
//! nothing downstream touches free-form maps. Capability gating happens
//! here too — a block the agent cannot accept is rejected before it is
//! ever forwarded.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    ResourceLink {
        uri: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Resource {
        resource: EmbeddedResource,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EmbeddedResource {
    Text {
        text: String,
        #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        uri: Option<String>,
    },
    Blob {
        blob: String,
        #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        uri: String,
    },
}

/// The agent's declared prompt capabilities, from its initialize response.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptCapabilities {
    pub image: bool,
    pub audio: bool,
    pub embedded_context: bool,
}

impl PromptCapabilities {
    /// Read `agentCapabilities.promptCapabilities` out of an initialize
    /// result; absent flags mean "text only".
    pub fn from_init(init: &Value) -> Self {
        let caps = &init["agentCapabilities"]["promptCapabilities"];
        Self {
            image: caps["image"].as_bool().unwrap_or(false),
            audio: caps["audio"].as_bool().unwrap_or(false),
            embedded_context: caps["embeddedContext"].as_bool().unwrap_or(false),
        }
    }
}

/// Parse and gate a prompt's content blocks.
pub fn validate_prompt(
    raw: &Value,
    caps: PromptCapabilities,
) -> Result<Vec<ContentBlock>, ServiceError> {
    let items = raw
        .as_array()
        .ok_or_else(|| ServiceError::Malformed("prompt must be an array of blocks".into()))?;
    if items.is_empty() {
        return Err(ServiceError::Malformed("prompt must not be empty".into()));
    }

    let mut blocks = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let block: ContentBlock = serde_json::from_value(item.clone())
            .map_err(|e| ServiceError::Malformed(format!("content block {i}: {e}")))?;

        match &block {
            ContentBlock::Text { .. } | ContentBlock::ResourceLink { .. } => {}
            ContentBlock::Image { data, .. } => {
                require_capability(caps.image, "image")?;
                require_base64(data, i)?;
            }
            ContentBlock::Audio { data, .. } => {
                require_capability(caps.audio, "audio")?;
                require_base64(data, i)?;
            }
            ContentBlock::Resource { resource } => {
                require_capability(caps.embedded_context, "embeddedContext")?;
                if let EmbeddedResource::Blob { blob, .. } = resource {
                    require_base64(blob, i)?;
                }
            }
        }
        blocks.push(block);
    }
    Ok(blocks)
}

fn require_capability(enabled: bool, name: &str) -> Result<(), ServiceError> {
    if enabled {
        Ok(())
    } else {
        Err(ServiceError::Refused(format!(
            "agent does not support {name} content"
        )))
    }
}

fn require_base64(data: &str, index: usize) -> Result<(), ServiceError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map(|_| ())
        .map_err(|_| ServiceError::Malformed(format!("content block {index}: invalid base64")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL: PromptCapabilities =
        PromptCapabilities { image: true, audio: true, embedded_context: true };

    #[test]
    fn text_block_always_passes() {
        let blocks =
            validate_prompt(&json!([{ "type": "text", "text": "hi" }]), PromptCapabilities::default())
                .unwrap();
        assert_eq!(blocks, vec![ContentBlock::Text { text: "hi".into() }]);
    }

    #[test]
    fn image_gated_by_capability() {
        let prompt = json!([{ "type": "image", "data": "aGVsbG8=", "mimeType": "image/png" }]);
        assert!(validate_prompt(&prompt, PromptCapabilities::default()).is_err());
        assert!(validate_prompt(&prompt, ALL).is_ok());
    }

    #[test]
    fn bad_base64_is_malformed() {
        let prompt = json!([{ "type": "image", "data": "not-base64!!!", "mimeType": "image/png" }]);
        let err = validate_prompt(&prompt, ALL).unwrap_err();
        assert!(matches!(err, ServiceError::Malformed(_)));
    }

    #[test]
    fn resource_variants_parse() {
        let text_res = json!([{ "type": "resource", "resource": { "text": "fn main(){}", "uri": "file:///m.rs" } }]);
        let blocks = validate_prompt(&text_res, ALL).unwrap();
        assert!(matches!(
            &blocks[0],
            ContentBlock::Resource { resource: EmbeddedResource::Text { .. } }
        ));

        let blob_res = json!([{ "type": "resource", "resource": { "blob": "aGVsbG8=", "uri": "file:///b.bin" } }]);
        let blocks = validate_prompt(&blob_res, ALL).unwrap();
        assert!(matches!(
            &blocks[0],
            ContentBlock::Resource { resource: EmbeddedResource::Blob { .. } }
        ));
    }

    #[test]
    fn resource_link_passes_without_capability() {
        let prompt = json!([{ "type": "resource_link", "uri": "file:///src/lib.rs" }]);
        assert!(validate_prompt(&prompt, PromptCapabilities::default()).is_ok());
    }

    #[test]
    fn unknown_block_type_is_malformed() {
        let prompt = json!([{ "type": "video", "data": "x" }]);
        assert!(validate_prompt(&prompt, ALL).is_err());
    }

    #[test]
    fn empty_prompt_is_malformed() {
        assert!(validate_prompt(&json!([]), ALL).is_err());
        assert!(validate_prompt(&json!({}), ALL).is_err());
    }

    #[test]
    fn caps_parse_from_init() {
        let init = json!({
            "agentCapabilities": { "promptCapabilities": { "image": true, "embeddedContext": true } }
        });
        let caps = PromptCapabilities::from_init(&init);
        assert!(caps.image);
        assert!(!caps.audio);
        assert!(caps.embedded_context);
    }
}
