//! Provider selection by name.

use std::sync::Arc;

use crate::error::ClientResult;
use crate::image_gen::{ImageEditConfig, OpenAiImageEditor};
use crate::ollama::{OllamaImageEditor, OllamaScorer};
use crate::providers::{FrameScorer, IllustrationGenerator, ProviderName};
use crate::vision::{OpenAiVisionScorer, VisionScorerConfig};

/// Build the frame scorer for `provider`.
pub fn build_scorer(provider: ProviderName, config: VisionScorerConfig) -> ClientResult<Arc<dyn FrameScorer>> {
    match provider {
        ProviderName::OpenAi => Ok(Arc::new(OpenAiVisionScorer::new(config)?)),
        ProviderName::Ollama => Ok(Arc::new(OllamaScorer::new(config.base_url))),
    }
}

/// Build the illustration generator for `provider`.
pub fn build_generator(
    provider: ProviderName,
    config: ImageEditConfig,
) -> ClientResult<Arc<dyn IllustrationGenerator>> {
    match provider {
        ProviderName::OpenAi => Ok(Arc::new(OpenAiImageEditor::new(config)?)),
        ProviderName::Ollama => Ok(Arc::new(OllamaImageEditor::new(config.base_url))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_by_name() {
        let scorer = build_scorer(
            ProviderName::Ollama,
            VisionScorerConfig {
                base_url: ProviderName::Ollama.default_base_url().to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(scorer.name(), "ollama");

        let scorer = build_scorer(
            ProviderName::OpenAi,
            VisionScorerConfig {
                api_key: "k".to_string(),
                instructions: "score it".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(scorer.name(), "openai");

        let generator = build_generator(ProviderName::OpenAi, ImageEditConfig::default());
        assert!(generator.is_err());
    }
}
