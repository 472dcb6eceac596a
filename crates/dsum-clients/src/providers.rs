//! Provider traits for the external collaborators.
//!
//! These traits give the pipeline a uniform interface over the concrete
//! HTTP clients, so the selection engine and publisher can be driven by
//! fakes in tests.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use dsum_models::FrameAssessment;

use crate::error::{ClientError, ClientResult};

/// Vision scorer: image in, face/person scores out.
#[async_trait]
pub trait FrameScorer: Send + Sync {
    /// Score the image at `image_path`.
    async fn score(&self, image_path: &Path) -> ClientResult<FrameAssessment>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

/// Output of one illustration generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    /// Where the generated image was written
    pub output_path: PathBuf,
    pub model: String,
    pub elapsed_s: f64,
    /// Short textual summary, when the generator produces one
    pub summary: Option<String>,
    pub revised_prompt: Option<String>,
}

/// Illustration generator: chosen frame in, generated image out.
#[async_trait]
pub trait IllustrationGenerator: Send + Sync {
    /// Generate an illustration from `input` and write it to `output`.
    async fn generate(&self, input: &Path, output: &Path) -> ClientResult<GeneratedImage>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

/// Camera side of the home-automation platform.
#[async_trait]
pub trait CameraPlatform: Send + Sync {
    /// Capture a snapshot of `camera_entity_id` into `destination` (platform path).
    async fn snapshot(&self, camera_entity_id: &str, destination: &str) -> ClientResult<()>;

    /// Point a file-backed camera entity at `file_path` (platform path).
    async fn point_camera(&self, camera_entity_id: &str, file_path: &str) -> ClientResult<()>;
}

/// Known external AI providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderName {
    OpenAi,
    Ollama,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::OpenAi => "openai",
            ProviderName::Ollama => "ollama",
        }
    }

    /// Endpoint used when a zone does not configure one.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderName::OpenAi => "https://api.openai.com",
            ProviderName::Ollama => crate::ollama::DEFAULT_OLLAMA_URL,
        }
    }
}

impl FromStr for ProviderName {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderName::OpenAi),
            "ollama" => Ok(ProviderName::Ollama),
            other => Err(ClientError::unsupported(format!("provider {:?}", other))),
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse() {
        assert_eq!(" OpenAI ".parse::<ProviderName>().unwrap(), ProviderName::OpenAi);
        assert_eq!("ollama".parse::<ProviderName>().unwrap(), ProviderName::Ollama);
        tokio_test::assert_err!("gemini".parse::<ProviderName>());
    }
}
