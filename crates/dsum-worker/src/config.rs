//! Worker configuration.
//!
//! Process-wide settings come from the environment; per-zone settings come
//! from a zones file (YAML, TOML or JSON, picked by extension) with
//! `DSUM__`-prefixed environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dsum_clients::{ImageEditConfig, ProviderName, ScoreFieldNames, VisionScorerConfig};
use dsum_models::BundleKey;
use dsum_storage::{StorageLayout, TraceConfig};

use crate::capture::CaptureSettings;
use crate::error::{WorkerError, WorkerResult};
use crate::publisher::PublishSettings;
use crate::selection::{RankPolicyName, SelectionSettings};

const DEFAULT_MEDIA_FS_ROOT: &str = "/media";

/// Process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Zones file
    pub zones_file: PathBuf,
    /// Bundle store state file; in-memory only when unset
    pub store_path: Option<PathBuf>,
    /// Published bundles older than this are dropped from the store
    pub retention_hours: f64,
    pub max_bundles_per_key: usize,
    /// Trigger entity polling interval
    pub motion_poll_interval: Duration,
    /// Fallback API key for zones that configure none
    pub openai_api_key: Option<String>,
    /// Prometheus exporter port; metrics are off when unset
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            zones_file: PathBuf::from("zones.yaml"),
            store_path: None,
            retention_hours: 24.0,
            max_bundles_per_key: 50,
            motion_poll_interval: Duration::from_millis(1000),
            openai_api_key: None,
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            zones_file: std::env::var("DSUM_ZONES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("zones.yaml")),
            store_path: std::env::var("DSUM_STORE_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            retention_hours: std::env::var("DSUM_RETENTION_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(24.0),
            max_bundles_per_key: std::env::var("DSUM_MAX_BUNDLES_PER_KEY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(50),
            motion_poll_interval: Duration::from_millis(
                std::env::var("DSUM_MOTION_POLL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            openai_api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            metrics_port: std::env::var("METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    /// Load and resolve the zones file named by this config.
    pub fn load_zones(&self) -> WorkerResult<Vec<ZoneConfig>> {
        let file = ZonesFile::load(&self.zones_file)?;
        Ok(file.resolve(self.openai_api_key.as_deref()))
    }
}

/// Settings shared by every zone in a zones file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedZoneSettings {
    pub openai_api_key: Option<String>,
    pub media_fs_root: Option<String>,
}

/// Top-level zones file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZonesFile {
    pub shared: SharedZoneSettings,
    pub zones: Vec<ZoneConfig>,
}

impl ZonesFile {
    /// Read `path`, applying `DSUM__` environment overrides.
    pub fn load(path: &Path) -> WorkerResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("DSUM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| WorkerError::config_error(format!("{}: {}", path.display(), e)))?;

        settings
            .try_deserialize()
            .map_err(|e| WorkerError::config_error(format!("{}: {}", path.display(), e)))
    }

    /// Fill per-zone gaps from the shared section, then from `env_api_key`.
    pub fn resolve(self, env_api_key: Option<&str>) -> Vec<ZoneConfig> {
        let shared = self.shared;
        self.zones
            .into_iter()
            .map(|mut zone| {
                let fallback_key = shared
                    .openai_api_key
                    .clone()
                    .or_else(|| env_api_key.map(str::to_string));
                if zone.external_data_api_key.is_none() {
                    zone.external_data_api_key = fallback_key.clone();
                }
                if zone.external_image_gen_api_key.is_none() {
                    zone.external_image_gen_api_key = fallback_key;
                }
                if zone.media_fs_root.is_none() {
                    zone.media_fs_root = shared.media_fs_root.clone();
                }
                zone
            })
            .collect()
    }
}

/// Configuration of one zone (one bundle key).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    pub bundle_key: String,
    pub trigger_entity_id: String,
    /// Trigger state that counts as "on"
    pub trigger_to: String,
    pub camera_entity_id: String,
    /// Platform path under which runs are written
    pub snapshot_dir: String,

    // Capture
    pub snapshot_interval_s: f64,
    pub off_grace_s: f64,
    pub capture_max_s: f64,

    // Cooldown
    pub cooldown_s: f64,
    pub cooldown_backoff_max_s: f64,

    // Selection
    pub analyze_max_snapshots: usize,
    pub no_people_threshold: f64,
    pub external_data_parallelism: usize,
    /// "faces_first" or "person_first"
    pub rank_policy: String,

    // Trace
    pub trace_enabled: bool,
    pub trace_copy_selected_frames: bool,
    pub trace_copy_best_frame: bool,
    pub trace_max_copies: usize,

    // Layout
    pub media_fs_root: Option<String>,
    pub runs_subdir: String,
    pub captured_subdir: String,
    pub best_filename: String,
    pub generated_filename: String,
    pub published_generated_filename: String,
    pub generated_image_camera_entity_id: Option<String>,
    pub write_bundle_json: bool,

    pub log_snapshot_events: bool,
    pub log_llm_events: bool,

    // Scoring provider
    pub data_instructions: String,
    pub data_expected_keys: Vec<String>,
    pub data_person_field: String,
    pub data_face_field: String,
    pub data_frame_field: String,
    pub data_pose_field: String,
    pub data_summary_field: String,
    pub external_data_provider: String,
    pub external_data_model: String,
    pub external_data_base_url: Option<String>,
    pub external_data_api_key: Option<String>,
    pub external_data_timeout_s: f64,
    pub external_data_max_output_tokens: u32,
    pub external_data_image_detail: String,

    // Illustration provider
    pub external_image_gen_enabled: bool,
    pub external_image_gen_provider: String,
    pub external_image_gen_model: String,
    pub external_image_gen_size: String,
    pub external_image_gen_quality: String,
    pub external_image_gen_output_format: String,
    pub external_image_gen_timeout_s: f64,
    pub external_image_gen_retries: u32,
    pub external_image_gen_api_key: Option<String>,
    pub external_image_gen_base_url: Option<String>,
    pub image_instructions: String,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        let fields = ScoreFieldNames::default();
        Self {
            bundle_key: String::new(),
            trigger_entity_id: String::new(),
            trigger_to: "on".to_string(),
            camera_entity_id: String::new(),
            snapshot_dir: String::new(),
            snapshot_interval_s: 3.0,
            off_grace_s: 15.0,
            capture_max_s: 300.0,
            cooldown_s: 60.0,
            cooldown_backoff_max_s: 1800.0,
            analyze_max_snapshots: 10,
            no_people_threshold: 1.0,
            external_data_parallelism: 4,
            rank_policy: RankPolicyName::FacesFirst.as_str().to_string(),
            trace_enabled: false,
            trace_copy_selected_frames: true,
            trace_copy_best_frame: true,
            trace_max_copies: 50,
            media_fs_root: None,
            runs_subdir: "runs".to_string(),
            captured_subdir: "captured".to_string(),
            best_filename: "best.jpg".to_string(),
            generated_filename: "generated.png".to_string(),
            published_generated_filename: "detection_summary_generated.png".to_string(),
            generated_image_camera_entity_id: None,
            write_bundle_json: true,
            log_snapshot_events: true,
            log_llm_events: true,
            data_instructions: String::new(),
            data_expected_keys: Vec::new(),
            data_person_field: fields.person_score,
            data_face_field: fields.face_score,
            data_frame_field: fields.frame_score,
            data_pose_field: fields.pose,
            data_summary_field: fields.summary,
            external_data_provider: ProviderName::OpenAi.as_str().to_string(),
            external_data_model: "gpt-5.2".to_string(),
            external_data_base_url: None,
            external_data_api_key: None,
            external_data_timeout_s: 60.0,
            external_data_max_output_tokens: 300,
            external_data_image_detail: "low".to_string(),
            external_image_gen_enabled: true,
            external_image_gen_provider: ProviderName::OpenAi.as_str().to_string(),
            external_image_gen_model: "gpt-image-1.5".to_string(),
            external_image_gen_size: "1024x1024".to_string(),
            external_image_gen_quality: "medium".to_string(),
            external_image_gen_output_format: "png".to_string(),
            external_image_gen_timeout_s: 90.0,
            external_image_gen_retries: 1,
            external_image_gen_api_key: None,
            external_image_gen_base_url: None,
            image_instructions: String::new(),
        }
    }
}

impl ZoneConfig {
    pub fn key(&self) -> BundleKey {
        BundleKey::new(self.bundle_key.clone())
    }

    /// Check the zone before any runner is built.
    pub fn validate(&self) -> WorkerResult<()> {
        let zone = if self.bundle_key.trim().is_empty() {
            "<unnamed>"
        } else {
            self.bundle_key.as_str()
        };
        let invalid = |msg: &str| Err(WorkerError::config_error(format!("zone {}: {}", zone, msg)));

        if self.bundle_key.trim().is_empty() {
            return invalid("bundle_key is required");
        }
        if self.trigger_entity_id.trim().is_empty() {
            return invalid("trigger_entity_id is required");
        }
        if self.camera_entity_id.trim().is_empty() {
            return invalid("camera_entity_id is required");
        }
        if self.snapshot_dir.trim().is_empty() {
            return invalid("snapshot_dir is required");
        }
        if self.snapshot_interval_s.is_nan() || self.snapshot_interval_s <= 0.0 {
            return invalid("snapshot_interval_s must be positive");
        }
        for (name, value) in [
            ("snapshot_interval_s", self.snapshot_interval_s),
            ("off_grace_s", self.off_grace_s),
            ("capture_max_s", self.capture_max_s),
            ("external_data_timeout_s", self.external_data_timeout_s),
            ("external_image_gen_timeout_s", self.external_image_gen_timeout_s),
        ] {
            if value > MAX_DURATION_S {
                return invalid(&format!("{} must be at most {} seconds", name, MAX_DURATION_S));
            }
        }
        if self.analyze_max_snapshots == 0 {
            return invalid("analyze_max_snapshots must be at least 1");
        }
        if self.external_data_parallelism == 0 {
            return invalid("external_data_parallelism must be at least 1");
        }
        if self.cooldown_backoff_max_s < self.cooldown_s {
            return invalid("cooldown_backoff_max_s must not be below cooldown_s");
        }
        if self.external_image_gen_enabled && self.image_instructions.trim().is_empty() {
            return invalid("image_instructions is required when image generation is enabled");
        }

        let data_provider = self.data_provider()?;
        if data_provider == ProviderName::OpenAi && !has_key(&self.external_data_api_key) {
            return invalid("external_data_api_key is required for the openai provider");
        }
        if self.external_image_gen_enabled {
            let image_provider = self.image_provider()?;
            if image_provider == ProviderName::OpenAi && !has_key(&self.external_image_gen_api_key) {
                return invalid("external_image_gen_api_key is required for the openai provider");
            }
        }
        self.rank_policy_name()?;
        Ok(())
    }

    pub fn data_provider(&self) -> WorkerResult<ProviderName> {
        self.external_data_provider
            .parse()
            .map_err(|e| WorkerError::config_error(format!("zone {}: {}", self.bundle_key, e)))
    }

    pub fn image_provider(&self) -> WorkerResult<ProviderName> {
        self.external_image_gen_provider
            .parse()
            .map_err(|e| WorkerError::config_error(format!("zone {}: {}", self.bundle_key, e)))
    }

    pub fn rank_policy_name(&self) -> WorkerResult<RankPolicyName> {
        self.rank_policy.parse()
    }

    pub fn layout(&self) -> StorageLayout {
        let root = self
            .media_fs_root
            .clone()
            .unwrap_or_else(|| DEFAULT_MEDIA_FS_ROOT.to_string());
        StorageLayout {
            runs_subdir: self.runs_subdir.clone(),
            captured_subdir: self.captured_subdir.clone(),
            best_filename: self.best_filename.clone(),
            generated_filename: self.generated_filename.clone(),
            published_generated_filename: self.published_generated_filename.clone(),
            ..StorageLayout::new(self.snapshot_dir.clone(), root)
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            snapshot_interval: secs(self.snapshot_interval_s),
            off_grace: secs(self.off_grace_s),
            capture_max: secs(self.capture_max_s),
            log_snapshot_events: self.log_snapshot_events,
        }
    }

    pub fn selection_settings(&self) -> SelectionSettings {
        SelectionSettings {
            analyze_max_snapshots: self.analyze_max_snapshots,
            no_people_threshold: self.no_people_threshold,
            parallelism: self.external_data_parallelism,
            call_timeout: secs(self.external_data_timeout_s),
            log_llm_events: self.log_llm_events,
            ..Default::default()
        }
    }

    pub fn trace_config(&self) -> TraceConfig {
        TraceConfig {
            enabled: self.trace_enabled,
            copy_selected_frames: self.trace_copy_selected_frames,
            copy_best_frame: self.trace_copy_best_frame,
            max_copies: self.trace_max_copies,
        }
    }

    pub fn publish_settings(&self, retention_hours: f64) -> PublishSettings {
        PublishSettings {
            write_bundle_json: self.write_bundle_json,
            trace: self.trace_config(),
            generated_image_camera_entity_id: self
                .generated_image_camera_entity_id
                .clone()
                .filter(|id| !id.trim().is_empty()),
            image_gen_retries: self.external_image_gen_retries,
            retention_hours,
            ..Default::default()
        }
    }

    pub fn scorer_config(&self) -> WorkerResult<VisionScorerConfig> {
        let provider = self.data_provider()?;
        Ok(VisionScorerConfig {
            api_key: self.external_data_api_key.clone().unwrap_or_default(),
            base_url: self
                .external_data_base_url
                .clone()
                .unwrap_or_else(|| provider.default_base_url().to_string()),
            model: self.external_data_model.clone(),
            timeout: secs(self.external_data_timeout_s),
            max_output_tokens: self.external_data_max_output_tokens,
            image_detail: self.external_data_image_detail.clone(),
            instructions: self.data_instructions.clone(),
            expected_keys: self.data_expected_keys.clone(),
            fields: ScoreFieldNames {
                person_score: self.data_person_field.clone(),
                face_score: self.data_face_field.clone(),
                frame_score: self.data_frame_field.clone(),
                pose: self.data_pose_field.clone(),
                summary: self.data_summary_field.clone(),
            },
            user: Some(format!("detection_summary:{}", self.bundle_key)),
        })
    }

    pub fn image_config(&self) -> WorkerResult<ImageEditConfig> {
        let provider = self.image_provider()?;
        Ok(ImageEditConfig {
            api_key: self.external_image_gen_api_key.clone().unwrap_or_default(),
            base_url: self
                .external_image_gen_base_url
                .clone()
                .unwrap_or_else(|| provider.default_base_url().to_string()),
            model: self.external_image_gen_model.clone(),
            size: self.external_image_gen_size.clone(),
            quality: self.external_image_gen_quality.clone(),
            output_format: self.external_image_gen_output_format.clone(),
            timeout: secs(self.external_image_gen_timeout_s),
            prompt: self.image_instructions.clone(),
            user: Some(format!("detection_summary:{}", self.bundle_key)),
            ..Default::default()
        })
    }
}

/// Validate every zone and reject duplicate bundle keys.
pub fn validate_zones(zones: &[ZoneConfig]) -> WorkerResult<()> {
    if zones.is_empty() {
        return Err(WorkerError::config_error("no zones configured"));
    }
    let mut seen = std::collections::HashSet::new();
    for zone in zones {
        zone.validate()?;
        if !seen.insert(zone.bundle_key.as_str()) {
            return Err(WorkerError::config_error(format!(
                "zone {}: duplicate bundle_key",
                zone.bundle_key
            )));
        }
    }
    Ok(())
}

fn has_key(key: &Option<String>) -> bool {
    key.as_deref().is_some_and(|k| !k.trim().is_empty())
}

/// Longest duration any zone option may ask for (one year).
const MAX_DURATION_S: f64 = 365.0 * 24.0 * 3600.0;

/// Non-finite or negative seconds become zero; huge ones are capped.
fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value.min(MAX_DURATION_S))
    } else {
        Duration::ZERO
    }
}
