//! Model definitions, the inference/loader seams, and the owning [`ModelHandle`].

use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use futures::future::BoxFuture;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{UpscaleError, UpscaleResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Layers,
    #[default]
    Graph,
    Other,
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Layers => write!(f, "layers"),
            Self::Graph => write!(f, "graph"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Model-supplied cleanup hook, always driven as an async contract.
///
/// Synchronous hooks are wrapped with [`Teardown::from_sync`] and complete
/// immediately.
#[derive(Clone)]
pub struct Teardown(Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>);

impl Teardown {
    pub fn new<F, Fut>(hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self(Arc::new(move || -> BoxFuture<'static, Result<()>> {
            Box::pin(hook())
        }))
    }

    pub fn from_sync<F>(hook: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let hook = Arc::new(hook);
        Self(Arc::new(move || -> BoxFuture<'static, Result<()>> {
            let result = hook();
            Box::pin(async move { result })
        }))
    }

    pub async fn run(&self) -> Result<()> {
        (self.0)().await
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Teardown(..)")
    }
}

/// Immutable descriptor of the model an `Upscaler` owns.
#[derive(Debug, Clone)]
pub struct ModelDefinition {
    /// Load locator: a filesystem path or an http(s) URL.
    pub path: String,
    pub model_type: ModelType,
    pub scale: u32,
    /// Spatial dimensions fed to the model must be multiples of this.
    pub divisibility_factor: Option<usize>,
    /// Default tiling applied when a call does not specify its own.
    pub patch_size: Option<usize>,
    pub padding: Option<usize>,
    /// Informational metadata (architecture name, block counts, training setup).
    pub architecture: Option<serde_json::Value>,
    pub teardown: Option<Teardown>,
}

impl ModelDefinition {
    pub fn new(path: impl Into<String>, model_type: ModelType, scale: u32) -> Self {
        Self {
            path: path.into(),
            model_type,
            scale,
            divisibility_factor: None,
            patch_size: None,
            padding: None,
            architecture: None,
            teardown: None,
        }
    }

    pub fn with_tiling(mut self, patch_size: usize, padding: usize) -> Self {
        self.patch_size = Some(patch_size);
        self.padding = Some(padding);
        self
    }

    pub fn with_divisibility_factor(mut self, factor: usize) -> Self {
        self.divisibility_factor = Some(factor);
        self
    }

    pub fn with_architecture(mut self, architecture: serde_json::Value) -> Self {
        self.architecture = Some(architecture);
        self
    }

    pub fn with_teardown(mut self, teardown: Teardown) -> Self {
        self.teardown = Some(teardown);
        self
    }

    pub fn validate(&self) -> UpscaleResult<()> {
        if self.path.trim().is_empty() {
            return Err(UpscaleError::InvalidConfig(
                "model path must not be empty".to_string(),
            ));
        }
        if self.scale == 0 {
            return Err(UpscaleError::InvalidConfig(
                "model scale must be a positive integer".to_string(),
            ));
        }
        if self.divisibility_factor == Some(0) {
            return Err(UpscaleError::InvalidConfig(
                "divisibility_factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A loaded, inference-capable model.
///
/// `predict` maps an NCHW `[N, C, H, W]` input to `[N, C, H * scale, W * scale]`
/// and must not mutate shared model state, so concurrent calls may share one
/// instance.
pub trait InferenceModel: Send + Sync {
    fn predict(&self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Release native resources. Called once, from [`ModelHandle::dispose`].
    fn release(&self) {}
}

pub struct LoadedModel {
    pub model: Arc<dyn InferenceModel>,
    pub definition: ModelDefinition,
}

pub trait ModelLoader: Send + Sync {
    fn load<'a>(&'a self, definition: &'a ModelDefinition) -> BoxFuture<'a, Result<LoadedModel>>;
}

/// Exclusive owner of the loaded model for one `Upscaler`.
pub struct ModelHandle {
    definition: ModelDefinition,
    model: Mutex<Option<Arc<dyn InferenceModel>>>,
}

impl ModelHandle {
    pub async fn load(loader: &dyn ModelLoader, definition: ModelDefinition) -> Result<Self> {
        debug!(
            path = %definition.path,
            model_type = %definition.model_type,
            scale = definition.scale,
            "Loading model"
        );
        let loaded = loader.load(&definition).await?;
        if loaded.definition.scale == 0 {
            bail!("loaded model declares a scale of 0");
        }
        info!(
            path = %loaded.definition.path,
            scale = loaded.definition.scale,
            "Model loaded"
        );
        Ok(Self::from_loaded(loaded))
    }

    pub fn from_loaded(loaded: LoadedModel) -> Self {
        Self {
            definition: loaded.definition,
            model: Mutex::new(Some(loaded.model)),
        }
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn scale(&self) -> usize {
        self.definition.scale as usize
    }

    pub fn is_disposed(&self) -> bool {
        self.model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    /// Shared reference to the model for one inference call.
    pub fn model(&self) -> UpscaleResult<Arc<dyn InferenceModel>> {
        self.model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(UpscaleError::Disposed)
    }

    /// Release the model, then run the teardown hook if present.
    ///
    /// Returns `Ok(false)` when the handle was already disposed. A teardown
    /// failure is returned after release has completed.
    pub async fn dispose(&self) -> UpscaleResult<bool> {
        let taken = self
            .model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(model) = taken else {
            return Ok(false);
        };

        model.release();
        drop(model);
        debug!(path = %self.definition.path, "Model resources released");

        if let Some(teardown) = &self.definition.teardown {
            if let Err(err) = teardown.run().await {
                error!(path = %self.definition.path, error = %format!("{err:#}"), "Model teardown failed");
                return Err(UpscaleError::Teardown(err));
            }
            debug!(path = %self.definition.path, "Model teardown complete");
        }
        Ok(true)
    }
}
