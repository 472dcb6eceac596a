//! OpenAI vision scorer.
//!
//! Sends one frame to the chat completions endpoint with a JSON-object
//! response format and maps the returned object onto a [`FrameAssessment`].

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::debug;

use dsum_models::FrameAssessment;

use crate::error::{ClientError, ClientResult};
use crate::providers::FrameScorer;
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, ContentPart, ImageUrl, MessageContent, ResponseFormat,
};

const SYSTEM_PROMPT: &str = "You are a careful assistant. Output ONLY valid JSON, with no extra text.";

/// Keys read from the scorer's JSON object.
#[derive(Debug, Clone)]
pub struct ScoreFieldNames {
    pub person_score: String,
    pub face_score: String,
    pub frame_score: String,
    pub pose: String,
    pub summary: String,
}

impl Default for ScoreFieldNames {
    fn default() -> Self {
        Self {
            person_score: "person_score".to_string(),
            face_score: "face_score".to_string(),
            frame_score: "frame_score".to_string(),
            pose: "pose".to_string(),
            summary: "summary".to_string(),
        }
    }
}

impl ScoreFieldNames {
    /// Map a scorer object onto an assessment.
    ///
    /// A missing person score falls back to the legacy `score` key, a
    /// missing frame score to the person score.
    pub fn assess(&self, obj: Map<String, Value>) -> FrameAssessment {
        let person_score = number_field(&obj, &self.person_score)
            .or_else(|| number_field(&obj, "score"))
            .unwrap_or(0.0);
        let face_score = number_field(&obj, &self.face_score).unwrap_or(0.0);
        let frame_score = number_field(&obj, &self.frame_score).unwrap_or(person_score);
        let pose = text_field(&obj, &self.pose).to_lowercase();
        let mut summary = text_field(&obj, &self.summary);
        if summary.is_empty() {
            summary = text_field(&obj, "summary");
        }

        FrameAssessment {
            face_score,
            person_score,
            frame_score,
            pose,
            summary,
            raw: Value::Object(obj),
        }
    }
}

/// Configuration for the vision scorer.
#[derive(Debug, Clone)]
pub struct VisionScorerConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub max_output_tokens: u32,
    /// low | high | auto
    pub image_detail: String,
    /// Scoring prompt
    pub instructions: String,
    /// Top-level keys the prompt asks for
    pub expected_keys: Vec<String>,
    pub fields: ScoreFieldNames,
    pub user: Option<String>,
}

impl Default for VisionScorerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-5.2".to_string(),
            timeout: Duration::from_secs(60),
            max_output_tokens: 300,
            image_detail: "low".to_string(),
            instructions: String::new(),
            expected_keys: Vec::new(),
            fields: ScoreFieldNames::default(),
            user: None,
        }
    }
}

/// Frame scorer backed by OpenAI chat completions with image input.
pub struct OpenAiVisionScorer {
    http: Client,
    config: VisionScorerConfig,
}

impl OpenAiVisionScorer {
    pub fn new(config: VisionScorerConfig) -> ClientResult<Self> {
        if config.api_key.trim().is_empty() {
            return Err(ClientError::invalid_input("OpenAI API key is required"));
        }
        if config.instructions.trim().is_empty() {
            return Err(ClientError::invalid_input("scoring instructions are required"));
        }

        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ClientError::Network)?;

        Ok(Self { http, config })
    }

    fn prompt(&self) -> String {
        let mut prompt = self.config.instructions.trim().to_string();
        if !self.config.expected_keys.is_empty() {
            prompt.push_str("\n\nReturn ONLY a JSON object with these top-level keys:\n- ");
            prompt.push_str(&self.config.expected_keys.join("\n- "));
        }
        prompt
    }

    fn build_request(&self, data_url: String) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: MessageContent::Text(SYSTEM_PROMPT.to_string()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: MessageContent::Parts(vec![
                        ContentPart::Text {
                            text: self.prompt(),
                        },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: data_url,
                                detail: self.config.image_detail.clone(),
                            },
                        },
                    ]),
                },
            ],
            response_format: ResponseFormat::json_object(),
            max_completion_tokens: self.config.max_output_tokens,
            user: self.config.user.clone(),
        }
    }
}

#[async_trait]
impl FrameScorer for OpenAiVisionScorer {
    async fn score(&self, image_path: &Path) -> ClientResult<FrameAssessment> {
        let data_url = file_to_data_url(image_path).await?;
        let url = format!("{}/v1/chat/completions", self.config.base_url.trim_end_matches('/'));
        let request = self.build_request(data_url);

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

        let payload: ChatResponse = response.json().await?;
        let content = payload
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ClientError::invalid_response("response has no message content"))?;

        let mut obj = parse_json_object(&content)?;
        for key in &self.config.expected_keys {
            obj.entry(key.clone()).or_insert(Value::Null);
        }

        debug!(
            model = %self.config.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            keys = obj.len(),
            "Vision scorer responded"
        );

        Ok(self.config.fields.assess(obj))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Parse a JSON object from model output, tolerating prose or code fences
/// around it.
pub fn parse_json_object(text: &str) -> ClientResult<Map<String, Value>> {
    let s = text.trim();
    if s.is_empty() {
        return Err(ClientError::invalid_response("model returned empty content"));
    }
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(s) {
        return Ok(obj);
    }
    if let (Some(first), Some(last)) = (s.find('{'), s.rfind('}')) {
        if last > first {
            if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&s[first..=last]) {
                return Ok(obj);
            }
        }
    }

    let preview: String = s.chars().take(400).collect();
    Err(ClientError::invalid_response(format!(
        "failed to parse JSON object from content: {}",
        preview
    )))
}

/// Read an image into a `data:` URL.
pub(crate) async fn file_to_data_url(path: &Path) -> ClientResult<String> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(ClientError::invalid_input(format!(
            "input image does not exist: {}",
            path.display()
        )));
    }
    let bytes = tokio::fs::read(path).await?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{};base64,{}", guess_mime(path), encoded))
}

fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

fn number_field(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn text_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
