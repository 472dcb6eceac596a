//! OpenAI image-edit illustration generator.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::providers::{GeneratedImage, IllustrationGenerator};
use crate::types::{ImageEditRequest, ImageEditResponse, ImageInput};
use crate::vision::file_to_data_url;

/// Configuration for the image-edit generator.
#[derive(Debug, Clone)]
pub struct ImageEditConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// e.g. "1024x1024" or "auto"
    pub size: String,
    /// low | medium | high | auto
    pub quality: String,
    /// png | jpeg | webp
    pub output_format: String,
    pub moderation: String,
    pub timeout: Duration,
    /// Edit prompt applied to the chosen frame
    pub prompt: String,
    pub user: Option<String>,
}

impl Default for ImageEditConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-image-1.5".to_string(),
            size: "1024x1024".to_string(),
            quality: "medium".to_string(),
            output_format: "png".to_string(),
            moderation: "auto".to_string(),
            timeout: Duration::from_secs(90),
            prompt: String::new(),
            user: None,
        }
    }
}

/// Illustration generator backed by `/v1/images/edits`.
pub struct OpenAiImageEditor {
    http: Client,
    config: ImageEditConfig,
}

impl OpenAiImageEditor {
    pub fn new(config: ImageEditConfig) -> ClientResult<Self> {
        if config.api_key.trim().is_empty() {
            return Err(ClientError::invalid_input("OpenAI API key is required"));
        }
        if config.prompt.trim().is_empty() {
            return Err(ClientError::invalid_input("image prompt is required"));
        }

        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ClientError::Network)?;

        Ok(Self { http, config })
    }
}

#[async_trait]
impl IllustrationGenerator for OpenAiImageEditor {
    async fn generate(&self, input: &Path, output: &Path) -> ClientResult<GeneratedImage> {
        let data_url = file_to_data_url(input).await?;
        let url = format!("{}/v1/images/edits", self.config.base_url.trim_end_matches('/'));

        let request = ImageEditRequest {
            images: vec![ImageInput { image_url: data_url }],
            prompt: self.config.prompt.clone(),
            model: self.config.model.clone(),
            size: self.config.size.clone(),
            quality: self.config.quality.clone(),
            output_format: self.config.output_format.clone(),
            moderation: self.config.moderation.clone(),
            n: 1,
            user: self.config.user.clone(),
        };

        let started = Instant::now();
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClientError::Timeout(self.config.timeout.as_secs())
                } else {
                    ClientError::Network(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(ClientError::ServiceUnavailable(format!("OpenAI returned {}: {}", status, body)));
            }
            return Err(ClientError::request_failed(format!("OpenAI returned {}: {}", status, body)));
        }

        let payload: ImageEditResponse = response.json().await?;
        let first = payload
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::invalid_response("response missing data"))?;
        let b64 = first
            .b64_json
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ClientError::invalid_response("response missing b64_json"))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64.as_bytes())
            .map_err(|e| ClientError::invalid_response(format!("failed to decode image: {}", e)))?;

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, &bytes).await?;

        let elapsed_s = started.elapsed().as_secs_f64();
        debug!(
            model = %self.config.model,
            output = %output.display(),
            bytes = bytes.len(),
            elapsed_s,
            "Illustration written"
        );

        Ok(GeneratedImage {
            output_path: output.to_path_buf(),
            model: self.config.model.clone(),
            elapsed_s,
            summary: None,
            revised_prompt: first.revised_prompt,
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
