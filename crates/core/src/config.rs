use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::error::{UpscaleError, UpscaleResult};
use crate::image_io::OutputFormat;
use crate::model::{ModelDefinition, ModelType};
use crate::upscaler::UpscalerConfig;
use crate::warmup::WarmupSpec;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TILESCALE_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TilescaleConfig {
    pub model: ModelConfig,
    pub tiling: TilingConfig,
    pub warmup: WarmupConfig,
    pub runtime: RuntimeConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub path: String,
    pub model_type: ModelType,
    pub scale: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub divisibility_factor: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TilingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub padding: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WarmupConfig {
    pub sizes: Vec<WarmupSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: InferenceBackend,
    pub trt_cache_dir: PathBuf,
    pub model_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: "models/realesrgan-x4.onnx".to_string(),
            model_type: ModelType::Graph,
            scale: 4,
            divisibility_factor: None,
            architecture: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::Cuda,
            trt_cache_dir: PathBuf::from("trt_cache"),
            model_cache_dir: PathBuf::from("models/cache"),
        }
    }
}

impl TilescaleConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> UpscaleResult<()> {
        self.model_definition().validate()?;
        if self.tiling.patch_size == Some(0) {
            return Err(UpscaleError::InvalidConfig(
                "tiling.patch_size must be positive when set".to_string(),
            ));
        }
        if let (Some(patch), Some(padding)) = (self.tiling.patch_size, self.tiling.padding) {
            if padding >= patch {
                return Err(UpscaleError::InvalidConfig(format!(
                    "tiling.padding ({padding}) must be smaller than tiling.patch_size ({patch})"
                )));
            }
        }
        crate::warmup::normalize(&self.warmup.sizes)?;
        Ok(())
    }

    pub fn model_definition(&self) -> ModelDefinition {
        let mut definition =
            ModelDefinition::new(self.model.path.clone(), self.model.model_type, self.model.scale);
        definition.divisibility_factor = self.model.divisibility_factor;
        definition.architecture = self.model.architecture.clone();
        definition.patch_size = self.tiling.patch_size;
        definition.padding = self.tiling.padding;
        definition
    }

    pub fn upscaler_config(&self) -> UpscaleResult<UpscalerConfig> {
        self.validate()?;
        Ok(UpscalerConfig::new(self.model_definition()).with_warmup(self.warmup.sizes.clone()))
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TILESCALE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates `data_dir` and writes a default config.toml unless one exists.
/// Returns whether a new config file was written.
pub fn initialize_data_dir(data_dir: &Path) -> Result<bool> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if cfg_path.exists() {
        return Ok(false);
    }
    TilescaleConfig::default().save_to_path(&cfg_path)?;
    Ok(true)
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
