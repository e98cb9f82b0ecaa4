//! Error taxonomy surfaced at the `Upscaler` boundary.
//!
//! Internals use `anyhow` with context; everything that reaches a caller of
//! [`crate::upscaler::Upscaler`] is mapped onto [`UpscaleError`] so callers can
//! tell a user-initiated cancellation apart from a genuine failure.

use thiserror::Error;

pub const TROUBLESHOOTING_STRING_INPUT: &str =
    "https://upscalerjs.com/documentation/troubleshooting#environment-disallows-string-input";
pub const TROUBLESHOOTING_DATA_URL_OUTPUT: &str =
    "https://upscalerjs.com/documentation/troubleshooting#environment-disallows-base64";

/// Runtime capability an input or output representation depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    StringInput,
    DataUrlOutput,
}

impl Capability {
    pub fn troubleshooting_url(self) -> &'static str {
        match self {
            Self::StringInput => TROUBLESHOOTING_STRING_INPUT,
            Self::DataUrlOutput => TROUBLESHOOTING_DATA_URL_OUTPUT,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StringInput => write!(f, "string input"),
            Self::DataUrlOutput => write!(f, "data URL output"),
        }
    }
}

#[derive(Debug, Error)]
pub enum UpscaleError {
    /// Model missing, malformed, or of an unsupported type. Fatal to the instance.
    #[error("failed to load model: {0}")]
    Load(String),

    /// The upscaler was disposed before or while the call was issued.
    #[error("upscaler has been disposed")]
    Disposed,

    #[error("environment does not support {capability}: {message}\nFor more information, see {}.", capability.troubleshooting_url())]
    EnvironmentCapability {
        capability: Capability,
        message: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),

    /// Not a defect: the call observed `abort()` at a tile boundary.
    #[error("execution was cancelled")]
    Cancelled,

    /// Raised by a model teardown hook after its resources were already released.
    #[error("model teardown failed: {0:#}")]
    Teardown(anyhow::Error),
}

impl UpscaleError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn environment(capability: Capability) -> Self {
        let message = match capability {
            Capability::StringInput => {
                "Environment does not support a string URL as an input format."
            }
            Capability::DataUrlOutput => {
                "Environment does not support base64 as an output format."
            }
        };
        Self::EnvironmentCapability {
            capability,
            message: message.to_string(),
        }
    }
}

pub type UpscaleResult<T> = std::result::Result<T, UpscaleError>;
