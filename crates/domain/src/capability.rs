use serde::{Deserialize, Serialize};

/// What a provider adapter can accept. The conversation builder consults it
/// before attaching images; the orchestrator before offering tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub supports_vision: bool,
    /// Image MIME types the vendor accepts as inline image blocks. An
    /// `image/*` entry accepts every image type.
    #[serde(default)]
    pub image_types: Vec<String>,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            supports_tools: false,
            supports_streaming: false,
            supports_vision: false,
            image_types: Vec::new(),
        }
    }
}

/// Image types accepted by the OpenAI and Anthropic vision endpoints.
pub const COMMON_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

impl ModelCapabilities {
    pub fn accepts_image(&self, mime_type: &str) -> bool {
        self.supports_vision
            && self
                .image_types
                .iter()
                .any(|t| {
                    (t == "image/*" && mime_type.starts_with("image/"))
                        || t.eq_ignore_ascii_case(mime_type)
                })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_needs_vision_and_listed_type() {
        let mut caps = ModelCapabilities {
            supports_vision: true,
            image_types: COMMON_IMAGE_TYPES.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        assert!(caps.accepts_image("image/png"));
        assert!(!caps.accepts_image("image/tiff"));
        caps.supports_vision = false;
        assert!(!caps.accepts_image("image/png"));
    }

    #[test]
    fn wildcard_accepts_any_image() {
        let caps = ModelCapabilities {
            supports_vision: true,
            image_types: vec!["image/*".into()],
            ..Default::default()
        };
        assert!(caps.accepts_image("image/tiff"));
        assert!(!caps.accepts_image("text/plain"));
    }
}
