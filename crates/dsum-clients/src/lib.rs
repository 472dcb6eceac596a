//! Clients for the collaborators the pipeline consumes.
//!
//! This crate provides:
//! - Provider traits for frame scoring, illustration generation and the camera platform
//! - OpenAI vision scorer (chat completions, JSON output)
//! - OpenAI image-edit illustration generator
//! - Ollama placeholders that report the capability as unsupported
//! - Home Assistant REST client (states, services, event bus)

pub mod error;
pub mod home_assistant;
pub mod image_gen;
pub mod ollama;
pub mod providers;
pub mod registry;
pub mod types;
pub mod vision;

pub use error::{ClientError, ClientResult};
pub use home_assistant::{EntityState, HomeAssistantClient, HomeAssistantConfig};
pub use image_gen::{ImageEditConfig, OpenAiImageEditor};
pub use ollama::{OllamaImageEditor, OllamaScorer};
pub use providers::{CameraPlatform, FrameScorer, GeneratedImage, IllustrationGenerator, ProviderName};
pub use registry::{build_generator, build_scorer};
pub use vision::{OpenAiVisionScorer, ScoreFieldNames, VisionScorerConfig};
