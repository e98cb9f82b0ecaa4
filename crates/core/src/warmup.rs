//! Synthetic inference passes that force lazy model initialization.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{UpscaleError, UpscaleResult};
use crate::execution::infer;
use crate::model::InferenceModel;
use crate::tensor::{TensorHandle, TensorLedger};

/// Warmup sizes as accepted from callers and config files.
///
/// A bare number `n` is an `n × n` tile, a pair `[w, h]` is a `w × h` tile,
/// both with zero padding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WarmupSpec {
    Size(usize),
    Pair(usize, usize),
    Patch {
        #[serde(alias = "patchSize")]
        patch_size: usize,
        #[serde(default)]
        padding: usize,
    },
    Sequence(Vec<WarmupSpec>),
}

impl From<usize> for WarmupSpec {
    fn from(value: usize) -> Self {
        Self::Size(value)
    }
}

/// One synthetic inference of a `width × height` input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupPass {
    pub width: usize,
    pub height: usize,
    pub padding: usize,
}

impl WarmupPass {
    /// Input size the model sees: an interior tile carries padding on all sides.
    pub fn input_size(&self) -> (usize, usize) {
        (
            self.width + 2 * self.padding,
            self.height + 2 * self.padding,
        )
    }
}

/// Flatten specs into passes, in order.
pub fn normalize(specs: &[WarmupSpec]) -> UpscaleResult<Vec<WarmupPass>> {
    let mut passes = Vec::new();
    for spec in specs {
        collect(spec, &mut passes)?;
    }
    Ok(passes)
}

fn collect(spec: &WarmupSpec, passes: &mut Vec<WarmupPass>) -> UpscaleResult<()> {
    let pass = match spec {
        WarmupSpec::Sequence(items) => {
            for item in items {
                collect(item, passes)?;
            }
            return Ok(());
        }
        WarmupSpec::Size(n) => WarmupPass {
            width: *n,
            height: *n,
            padding: 0,
        },
        WarmupSpec::Pair(width, height) => WarmupPass {
            width: *width,
            height: *height,
            padding: 0,
        },
        WarmupSpec::Patch {
            patch_size,
            padding,
        } => WarmupPass {
            width: *patch_size,
            height: *patch_size,
            padding: *padding,
        },
    };
    if pass.width == 0 || pass.height == 0 {
        return Err(UpscaleError::InvalidConfig(format!(
            "warmup size must be positive, got {}x{}",
            pass.width, pass.height
        )));
    }
    passes.push(pass);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmupStatus {
    /// No warmup sizes were configured.
    Skipped,
    Pending,
    Running,
    Complete { passes: usize },
    /// Stopped by `abort()` or `dispose()` between passes.
    Cancelled,
    Failed(String),
}

impl WarmupStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Run each pass on a zero tensor, discarding outputs. Stops between passes on cancel.
pub async fn run_warmup(
    model: &Arc<dyn InferenceModel>,
    ledger: &Arc<TensorLedger>,
    passes: &[WarmupPass],
    channels: usize,
    token: &CancellationToken,
) -> UpscaleResult<usize> {
    for (index, pass) in passes.iter().enumerate() {
        if token.is_cancelled() {
            debug!(completed = index, total = passes.len(), "Warmup cancelled");
            return Err(UpscaleError::Cancelled);
        }
        let (width, height) = pass.input_size();
        let input = TensorHandle::zeros(ledger, (1, channels, height, width));
        let mut output = infer(model, ledger, input).await?;
        output.dispose();
        debug!(pass = index, width, height, "Warmup pass complete");
    }
    info!(passes = passes.len(), "Warmup complete");
    Ok(passes.len())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::Result;
    use ndarray::Array4;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        shapes: Mutex<Vec<(usize, usize, usize, usize)>>,
    }

    impl InferenceModel for Recorder {
        fn predict(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
            self.shapes.lock().unwrap().push(input.dim());
            Ok(input.clone())
        }
    }

    #[test]
    fn test_single_number_is_one_square_pass() {
        let passes = normalize(&[WarmupSpec::Size(32)]).unwrap();
        assert_eq!(
            passes,
            vec![WarmupPass {
                width: 32,
                height: 32,
                padding: 0
            }]
        );
    }

    #[test]
    fn test_pair_is_width_and_height() {
        let passes = normalize(&[WarmupSpec::Pair(48, 16)]).unwrap();
        assert_eq!(passes[0].input_size(), (48, 16));
        assert_eq!(passes[0].padding, 0);
    }

    #[test]
    fn test_nested_sequences_flatten_in_order() {
        let specs = vec![
            WarmupSpec::Size(8),
            WarmupSpec::Sequence(vec![
                WarmupSpec::Patch {
                    patch_size: 16,
                    padding: 2,
                },
                WarmupSpec::Pair(4, 6),
            ]),
        ];
        let sizes: Vec<_> = normalize(&specs)
            .unwrap()
            .iter()
            .map(WarmupPass::input_size)
            .collect();
        assert_eq!(sizes, vec![(8, 8), (20, 20), (4, 6)]);
    }

    #[test]
    fn test_zero_size_is_rejected() {
        assert!(matches!(
            normalize(&[WarmupSpec::Pair(0, 4)]),
            Err(UpscaleError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_specs_deserialize_from_json_shapes() {
        let specs: Vec<WarmupSpec> =
            serde_json::from_str(r#"[64, [32, 16], {"patchSize": 24, "padding": 2}, [[8, 8], 4]]"#)
                .unwrap();
        assert_eq!(specs[0], WarmupSpec::Size(64));
        assert_eq!(specs[1], WarmupSpec::Pair(32, 16));
        assert_eq!(
            specs[2],
            WarmupSpec::Patch {
                patch_size: 24,
                padding: 2
            }
        );
        assert_eq!(
            specs[3],
            WarmupSpec::Sequence(vec![WarmupSpec::Pair(8, 8), WarmupSpec::Size(4)])
        );
    }

    #[tokio::test]
    async fn test_each_pass_runs_one_zero_inference() {
        let recorder = Arc::new(Recorder::default());
        let model: Arc<dyn InferenceModel> = recorder.clone();
        let ledger = TensorLedger::new();
        let passes = normalize(&[WarmupSpec::Size(5), WarmupSpec::Pair(3, 2)]).unwrap();

        let ran = run_warmup(&model, &ledger, &passes, 3, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ran, 2);
        assert_eq!(
            *recorder.shapes.lock().unwrap(),
            vec![(1, 3, 5, 5), (1, 3, 2, 3)]
        );
        assert_eq!(ledger.live(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_warmup_stops_before_next_pass() {
        let recorder = Arc::new(Recorder::default());
        let model: Arc<dyn InferenceModel> = recorder.clone();
        let ledger = TensorLedger::new();
        let token = CancellationToken::new();
        token.cancel();

        let err = run_warmup(&model, &ledger, &normalize(&[WarmupSpec::Size(4)]).unwrap(), 3, &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(recorder.shapes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_status_is_settled_and_not_failed() {
        assert!(WarmupStatus::Cancelled.is_settled());
        assert!(WarmupStatus::Skipped.is_settled());
        assert!(!WarmupStatus::Running.is_settled());
        assert_ne!(WarmupStatus::Cancelled, WarmupStatus::Failed("execution was cancelled".into()));
    }
}
