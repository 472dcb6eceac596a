//! Ollama providers.
//!
//! Selectable in configuration so zones can name them, but Ollama offers
//! neither image scoring nor image editing here; every call fails with
//! [`ClientError::Unsupported`].

use std::path::Path;

use async_trait::async_trait;

use dsum_models::FrameAssessment;

use crate::error::{ClientError, ClientResult};
use crate::providers::{FrameScorer, GeneratedImage, IllustrationGenerator};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

pub struct OllamaScorer {
    base_url: String,
}

impl OllamaScorer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl FrameScorer for OllamaScorer {
    async fn score(&self, _image_path: &Path) -> ClientResult<FrameAssessment> {
        Err(ClientError::unsupported(format!(
            "image scoring is not supported by the Ollama provider at {}",
            self.base_url
        )))
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

pub struct OllamaImageEditor {
    base_url: String,
}

impl OllamaImageEditor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl IllustrationGenerator for OllamaImageEditor {
    async fn generate(&self, _input: &Path, _output: &Path) -> ClientResult<GeneratedImage> {
        Err(ClientError::unsupported(format!(
            "image generation is not supported by the Ollama provider at {}",
            self.base_url
        )))
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}
