use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::faces::thresholds;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub faces: FacesConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,
}

/// Detection engine selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// "pigo", "onnx" or "auto". Unknown names fall back to pigo.
    #[serde(default = "default_engine_name")]
    pub name: String,

    #[serde(default)]
    pub onnx: OnnxConfig,

    /// Directory holding `facefinder`, `puploc` and the `lp*` landmark cascades.
    #[serde(default = "default_cascade_dir")]
    pub cascade_dir: PathBuf,
}

fn default_engine_name() -> String {
    "auto".to_string()
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("facekit/models")
}

fn default_cascade_dir() -> PathBuf {
    default_models_dir().join("cascade")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            onnx: OnnxConfig::default(),
            cascade_dir: default_cascade_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnnxConfig {
    #[serde(default = "default_detector_model")]
    pub model_path: PathBuf,

    /// Path to the ONNX Runtime shared library. Exported as `ORT_DYLIB_PATH`
    /// before the first session is created unless that is already set.
    #[serde(default)]
    pub library_path: Option<PathBuf>,

    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,

    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,
}

fn default_detector_model() -> PathBuf {
    default_models_dir().join("scrfd.onnx")
}

fn default_threads() -> usize {
    4
}

fn default_score_threshold() -> f32 {
    0.5
}

fn default_nms_threshold() -> f32 {
    0.4
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            model_path: default_detector_model(),
            library_path: None,
            threads: default_threads(),
            score_threshold: default_score_threshold(),
            nms_threshold: default_nms_threshold(),
        }
    }
}

/// Face embedding network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model_path: PathBuf,

    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// NHWC input layout (TensorFlow exports) instead of NCHW.
    #[serde(default = "default_channels_last")]
    pub channels_last: bool,

    /// Also embed the horizontally mirrored crop.
    #[serde(default)]
    pub mirror: bool,

    #[serde(default = "default_threads")]
    pub threads: usize,
}

fn default_embedding_model() -> PathBuf {
    default_models_dir().join("facenet.onnx")
}

fn default_input_size() -> u32 {
    160
}

fn default_channels_last() -> bool {
    true
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_path: default_embedding_model(),
            input_size: default_input_size(),
            channels_last: default_channels_last(),
            mirror: false,
            threads: default_threads(),
        }
    }
}

/// Recognition tuning. Defaults mirror `faces::thresholds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacesConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_min_face_size")]
    pub min_face_size: u32,

    /// Faces smaller than this (pixels) are detected but not embedded.
    #[serde(default = "default_size_threshold")]
    pub size_threshold: u32,

    #[serde(default = "default_match_dist")]
    pub match_dist: f64,

    #[serde(default = "default_cluster_dist")]
    pub cluster_dist: f64,

    #[serde(default = "default_cluster_core")]
    pub cluster_core: usize,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Pause between matcher pages.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,

    /// JSON file with kids/ignored reference clusters.
    #[serde(default)]
    pub kind_filter: Option<PathBuf>,

    /// Directory for cached face crops.
    #[serde(default)]
    pub crop_cache: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_min_face_size() -> u32 {
    thresholds::MIN_FACE_SIZE
}

fn default_size_threshold() -> u32 {
    thresholds::SIZE_THRESHOLD
}

fn default_match_dist() -> f64 {
    thresholds::MATCH_DIST
}

fn default_cluster_dist() -> f64 {
    thresholds::CLUSTER_DIST
}

fn default_cluster_core() -> usize {
    thresholds::CLUSTER_CORE
}

fn default_page_size() -> usize {
    thresholds::PAGE_SIZE
}

fn default_throttle_ms() -> u64 {
    50
}

impl Default for FacesConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            min_face_size: default_min_face_size(),
            size_threshold: default_size_threshold(),
            match_dist: default_match_dist(),
            cluster_dist: default_cluster_dist(),
            cluster_core: default_cluster_core(),
            page_size: default_page_size(),
            throttle_ms: default_throttle_ms(),
            kind_filter: None,
            crop_cache: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facekit")
        .join("facekit.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            engine: EngineConfig::default(),
            embedding: EmbeddingConfig::default(),
            faces: FacesConfig::default(),
            scanner: ScannerConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facekit")
            .join("config.toml")
    }
}
