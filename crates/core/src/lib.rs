//! Tiled, cancellable image super-resolution over ONNX models.

pub mod abort;
pub mod backend;
pub mod config;
pub mod error;
pub mod execution;
pub mod image_io;
pub mod logging;
pub mod model;
pub mod ort_model;
pub mod runtime;
pub mod tensor;
pub mod tiling;
pub mod upscaler;
pub mod warmup;

pub use abort::AbortHandle;
pub use error::{Capability, UpscaleError, UpscaleResult};
pub use execution::{Progress, UpscaleOptions, UpscaleOutput};
pub use image_io::{Environment, Input, OutputFormat};
pub use model::{InferenceModel, LoadedModel, ModelDefinition, ModelLoader, ModelType, Teardown};
pub use upscaler::{Upscaler, UpscalerConfig};
pub use warmup::{WarmupSpec, WarmupStatus};
