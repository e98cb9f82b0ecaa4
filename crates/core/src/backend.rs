//! Inference backend selection and `ort::Session` construction.
//!
//! [`build_session`] registers the execution providers for the requested
//! [`InferenceBackend`], with TensorRT engine caching keyed per model.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Default is `Cuda`. `Tensorrt` needs the TensorRT runtime libraries and falls
/// back to CUDA EP when they are missing; `Cpu` registers no GPU provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: &'a InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }

    stats
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match config.backend {
        InferenceBackend::Tensorrt => build_tensorrt_session(builder, config)?,
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }
            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session without GPU providers");
            builder.commit_from_file(config.model_path).with_context(|| {
                format!("Failed to load ONNX model: {}", config.model_path.display())
            })?
        }
    };

    Ok(session)
}

fn build_tensorrt_session(
    builder: ort::session::builder::SessionBuilder,
    config: &SessionConfig<'_>,
) -> Result<Session> {
    let cache_dir = config
        .trt_cache_dir
        .unwrap_or_else(|| Path::new("trt_cache"));

    if let Err(e) = std::fs::create_dir_all(cache_dir) {
        warn!(
            dir = %cache_dir.display(),
            error = %e,
            "Failed to create TRT cache directory"
        );
    }

    let cache_path = cache_dir.to_string_lossy().to_string();
    let before = cache_stats(cache_dir);
    let started = Instant::now();

    info!(
        cache_dir = %cache_dir.display(),
        cache_files = before.file_count,
        "Initializing TensorRT session (first run may take several minutes)"
    );

    let (stop_tx, stop_rx) = channel::<()>();
    let progress_thread = thread::spawn(move || {
        let tick = Duration::from_secs(15);
        let mut elapsed = 15_u64;
        loop {
            match stop_rx.recv_timeout(tick) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    info!(
                        elapsed_secs = elapsed,
                        "TensorRT session initialization still in progress"
                    );
                    elapsed += 15;
                }
            }
        }
    });

    // TRT EP may fail at runtime if libnvinfer is not installed; CUDA EP follows it.
    let session_result = builder
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .with_engine_cache_path(&cache_path)
                .with_fp16(true)
                .with_device_id(0)
                .build(),
            CUDAExecutionProvider::default().build(),
        ])?
        .commit_from_file(config.model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", config.model_path.display()));

    let _ = stop_tx.send(());
    let _ = progress_thread.join();

    let elapsed = started.elapsed().as_secs_f64();
    let after = cache_stats(cache_dir);
    match session_result {
        Ok(session) => {
            info!(
                elapsed_secs = elapsed,
                cache_updated = after.total_bytes != before.total_bytes,
                cache_bytes = after.total_bytes,
                "TensorRT session ready"
            );
            Ok(session)
        }
        Err(err) => {
            error!(
                elapsed_secs = elapsed,
                cache_dir = %cache_dir.display(),
                error = %err,
                "TensorRT session initialization failed"
            );
            Err(err)
        }
    }
}

/// Format: `{model_hash}_{backend}`; keeps engines for different models apart.
pub fn trt_cache_key(model_hash: &str, backend: &InferenceBackend) -> String {
    format!("{model_hash}_{backend}")
}

pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}
