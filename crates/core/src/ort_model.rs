//! ONNX Runtime implementation of [`InferenceModel`] and [`ModelLoader`].
//!
//! Models consume the 0–255 range directly. FP16 models are detected from the
//! input element type and converted in and out via `half`. Inputs are
//! reflection-padded to the model's divisibility factor and the output is
//! cropped back to `H * scale × W * scale`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4, ArrayD, IxDyn};
use ort::{session::Session, value::Tensor};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

use crate::backend::{build_session, resolve_trt_cache_dir, trt_cache_key, InferenceBackend, SessionConfig};
use crate::model::{InferenceModel, LoadedModel, ModelDefinition, ModelLoader, ModelType};

pub struct OrtModel {
    session: Mutex<Option<Session>>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    scale: usize,
    divisibility_factor: usize,
}

impl OrtModel {
    pub fn from_session(session: Session, definition: &ModelDefinition) -> Result<Self> {
        let input = session
            .inputs()
            .first()
            .context("ONNX model declares no inputs")?;
        let output = session
            .outputs()
            .first()
            .context("ONNX model declares no outputs")?;

        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            session: Mutex::new(Some(session)),
            input_name,
            output_name,
            is_fp16,
            scale: definition.scale as usize,
            divisibility_factor: definition.divisibility_factor.unwrap_or(1).max(1),
        })
    }

    fn run_f32(&self, session: &mut Session, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let input_tensor = Tensor::from_array(input)?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output_view.to_owned())
    }

    fn run_f16(&self, session: &mut Session, input: &Array4<f32>) -> Result<ArrayD<f32>> {
        let contiguous_input = input.as_standard_layout();
        let f32_slice = contiguous_input
            .as_slice()
            .context("input is not contiguous")?;
        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);

        let fp16_array = ArrayD::from_shape_vec(IxDyn(input.shape()), fp16_data)?;
        let input_tensor = Tensor::from_array(fp16_array)?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;

        let contiguous = output_view.as_standard_layout().into_owned();
        let fp16_slice = contiguous
            .as_slice()
            .context("FP16 output is not contiguous")?;
        let mut f32_data = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut f32_data);

        Ok(ArrayD::from_shape_vec(IxDyn(contiguous.shape()), f32_data)?)
    }
}

impl InferenceModel for OrtModel {
    fn predict(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let (_, _, h, w) = input.dim();
        let padded = reflect_pad(input, self.divisibility_factor);
        let (_, _, padded_h, padded_w) = padded.dim();

        let output = {
            let mut guard = self
                .session
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(session) = guard.as_mut() else {
                bail!("ONNX session has been released");
            };
            if self.is_fp16 {
                self.run_f16(session, &padded)?
            } else {
                self.run_f32(session, padded)?
            }
        };

        let output = output
            .into_dimensionality::<ndarray::Ix4>()
            .context("model output is not a 4D tensor")?;
        let (_, _, out_h, out_w) = output.dim();
        if out_h != padded_h * self.scale || out_w != padded_w * self.scale {
            bail!(
                "model produced {out_w}x{out_h} for a {padded_w}x{padded_h} input, expected scale {}",
                self.scale
            );
        }

        if padded_h == h && padded_w == w {
            Ok(output)
        } else {
            Ok(output
                .slice(s![.., .., ..h * self.scale, ..w * self.scale])
                .to_owned())
        }
    }

    fn release(&self) {
        let released = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if released.is_some() {
            debug!("ONNX session released");
        }
    }
}

fn reflect_index(i: usize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let m = i % period;
    if m < len {
        m
    } else {
        period - m
    }
}

/// Reflection-pad H and W up to the next multiple of `align`.
pub(crate) fn reflect_pad(arr: &Array4<f32>, align: usize) -> Array4<f32> {
    let (n, c, h, w) = arr.dim();
    let pad_h = (align - (h % align)) % align;
    let pad_w = (align - (w % align)) % align;

    if pad_h == 0 && pad_w == 0 {
        return arr.clone();
    }

    Array4::from_shape_fn((n, c, h + pad_h, w + pad_w), |(b, ch, y, x)| {
        arr[[b, ch, reflect_index(y, h), reflect_index(x, w)]]
    })
}

/// Explicit cache of resolved model files, keyed by normalized locator.
///
/// Remote locators are downloaded once into `dir` under a SHA-256 derived name.
pub struct ModelCache {
    dir: PathBuf,
    entries: DashMap<String, PathBuf>,
}

impl ModelCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entries: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn normalize_locator(locator: &str) -> String {
        let trimmed = locator.trim();
        if let Ok(url) = Url::parse(trimmed) {
            if matches!(url.scheme(), "http" | "https") {
                return url.to_string();
            }
            if url.scheme() == "file" {
                if let Ok(path) = url.to_file_path() {
                    return normalize_path(&path);
                }
            }
        }
        normalize_path(Path::new(trimmed))
    }

    pub fn get(&self, locator: &str) -> Option<PathBuf> {
        self.entries
            .get(&Self::normalize_locator(locator))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget a locator. Downloaded copies inside the cache directory are deleted.
    pub fn invalidate(&self, locator: &str) -> bool {
        let Some((_, path)) = self.entries.remove(&Self::normalize_locator(locator)) else {
            return false;
        };
        if path.starts_with(&self.dir) {
            let _ = std::fs::remove_file(&path);
        }
        true
    }

    pub fn clear(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.invalidate(&key);
        }
    }

    pub async fn resolve(&self, locator: &str) -> Result<PathBuf> {
        let key = Self::normalize_locator(locator);
        if let Some(path) = self.entries.get(&key) {
            if path.is_file() {
                debug!(locator = %key, "Model cache hit");
                return Ok(path.clone());
            }
        }

        let path = if key.starts_with("http://") || key.starts_with("https://") {
            self.download(&key).await?
        } else {
            let path = PathBuf::from(&key);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                bail!("model file not found: {}", path.display());
            }
            path
        };

        self.entries.insert(key, path.clone());
        Ok(path)
    }

    async fn download(&self, url: &str) -> Result<PathBuf> {
        let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
        let final_path = self.dir.join(format!("{digest}.onnx"));
        if final_path.is_file() {
            return Ok(final_path);
        }

        tokio::fs::create_dir_all(&self.dir).await.with_context(|| {
            format!("Failed to create model cache directory: {}", self.dir.display())
        })?;

        info!(%url, "Downloading model");
        let response = reqwest::get(url)
            .await
            .with_context(|| format!("Failed to fetch model from {url}"))?
            .error_for_status()
            .with_context(|| format!("Model request to {url} failed"))?;
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed while downloading model from {url}"))?;

        let tmp_path = final_path.with_extension("onnx.part");
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("Failed to finalize {}", final_path.display()))?;

        info!(path = %final_path.display(), bytes = bytes.len(), "Model downloaded");
        Ok(final_path)
    }
}

fn normalize_path(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

pub struct OrtModelLoader {
    backend: InferenceBackend,
    trt_cache_dir: Option<PathBuf>,
    cache: Arc<ModelCache>,
}

impl OrtModelLoader {
    pub fn new(backend: InferenceBackend, cache: Arc<ModelCache>) -> Self {
        Self {
            backend,
            trt_cache_dir: None,
            cache,
        }
    }

    pub fn with_trt_cache_dir(mut self, dir: PathBuf) -> Self {
        self.trt_cache_dir = Some(dir);
        self
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    async fn load_definition(&self, definition: &ModelDefinition) -> Result<LoadedModel> {
        if definition.model_type != ModelType::Graph {
            bail!(
                "unsupported model type '{}': the ONNX loader only accepts graph models",
                definition.model_type
            );
        }

        let model_path = self.cache.resolve(&definition.path).await?;
        let backend = self.backend.clone();
        let trt_cache_dir = self.trt_cache_dir.as_ref().map(|base| {
            let hash = format!(
                "{:x}",
                Sha256::digest(ModelCache::normalize_locator(&definition.path).as_bytes())
            );
            resolve_trt_cache_dir(base, Some(&trt_cache_key(&hash[..16], &backend)))
        });

        debug!(
            model = %model_path.display(),
            backend = %backend,
            "Building ONNX session"
        );

        let session = tokio::task::spawn_blocking(move || {
            build_session(&SessionConfig {
                model_path: &model_path,
                backend: &backend,
                trt_cache_dir: trt_cache_dir.as_deref(),
            })
        })
        .await
        .context("session builder task panicked")??;

        let model = OrtModel::from_session(session, definition)?;
        Ok(LoadedModel {
            model: Arc::new(model),
            definition: definition.clone(),
        })
    }
}

impl ModelLoader for OrtModelLoader {
    fn load<'a>(&'a self, definition: &'a ModelDefinition) -> BoxFuture<'a, Result<LoadedModel>> {
        Box::pin(self.load_definition(definition))
    }
}
