//! One `execute()` call, driven tile by tile to settlement.

use std::sync::Arc;

use anyhow::anyhow;
use ndarray::Array4;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{UpscaleError, UpscaleResult};
use crate::image_io::{to_data_url, OutputFormat};
use crate::model::InferenceModel;
use crate::tensor::{TensorHandle, TensorLedger};
use crate::tiling::{self, extract_tile, Stitcher, Tile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Success,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Pending,
    Tiling,
    Inferring(usize),
    Stitching,
    Settled(Settlement),
}

/// Reported after each tile's output has been stitched.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub ratio: f32,
    pub row: usize,
    pub col: usize,
    /// The tile's upscaled core, padding removed. Present only when
    /// [`UpscaleOptions::progress_output`] is set.
    pub tile: Option<UpscaleOutput>,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Per-call options. Tiling falls back to the model definition's defaults.
#[derive(Clone, Default)]
pub struct UpscaleOptions {
    pub output: OutputFormat,
    pub patch_size: Option<usize>,
    pub padding: Option<usize>,
    pub progress: Option<ProgressCallback>,
    pub progress_output: Option<OutputFormat>,
}

impl UpscaleOptions {
    pub fn tensor() -> Self {
        Self {
            output: OutputFormat::Tensor,
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: OutputFormat) -> Self {
        self.output = output;
        self
    }

    pub fn with_tiling(mut self, patch_size: usize, padding: usize) -> Self {
        self.patch_size = Some(patch_size);
        self.padding = Some(padding);
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Deliver each stitched tile to the progress callback in `format`.
    pub fn with_progress_output(mut self, format: OutputFormat) -> Self {
        self.progress_output = Some(format);
        self
    }
}

impl std::fmt::Debug for UpscaleOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpscaleOptions")
            .field("output", &self.output)
            .field("patch_size", &self.patch_size)
            .field("padding", &self.padding)
            .field("progress", &self.progress.is_some())
            .field("progress_output", &self.progress_output)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpscaleOutput {
    Tensor(Array4<f32>),
    DataUrl(String),
}

impl UpscaleOutput {
    pub fn as_tensor(&self) -> Option<&Array4<f32>> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            Self::DataUrl(_) => None,
        }
    }

    pub fn into_tensor(self) -> Option<Array4<f32>> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            Self::DataUrl(_) => None,
        }
    }

    pub fn as_data_url(&self) -> Option<&str> {
        match self {
            Self::DataUrl(url) => Some(url),
            Self::Tensor(_) => None,
        }
    }
}

/// Effective `(patch_size, padding)` for one call.
pub fn resolve_tiling(
    call_patch: Option<usize>,
    call_padding: Option<usize>,
    default_patch: Option<usize>,
    default_padding: Option<usize>,
) -> (Option<usize>, usize) {
    let patch_size = call_patch.or(default_patch).filter(|p| *p > 0);
    let padding = call_padding.or(default_padding).unwrap_or(0);
    if patch_size.is_none() && padding > 0 {
        warn!(padding, "Padding without a patch size is ignored");
        return (None, 0);
    }
    (patch_size, padding)
}

/// Runs one inference on the blocking pool and tracks both tensors in the ledger.
pub(crate) async fn infer(
    model: &Arc<dyn InferenceModel>,
    ledger: &Arc<TensorLedger>,
    input: TensorHandle,
) -> UpscaleResult<TensorHandle> {
    let model = Arc::clone(model);
    let output = tokio::task::spawn_blocking(move || {
        let mut input = input;
        let result = input.array().and_then(|array| model.predict(array));
        input.dispose();
        result
    })
    .await
    .map_err(|e| UpscaleError::Inference(anyhow!("inference task failed: {e}")))?
    .map_err(UpscaleError::Inference)?;
    Ok(TensorHandle::new(ledger, output))
}

pub struct ExecutionController {
    id: u64,
    model: Arc<dyn InferenceModel>,
    scale: usize,
    ledger: Arc<TensorLedger>,
    token: CancellationToken,
    phase: ExecutionPhase,
}

impl ExecutionController {
    pub fn new(
        id: u64,
        model: Arc<dyn InferenceModel>,
        scale: usize,
        ledger: Arc<TensorLedger>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            model,
            scale,
            ledger,
            token,
            phase: ExecutionPhase::Pending,
        }
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.phase
    }

    fn transition(&mut self, next: ExecutionPhase) {
        debug!(id = self.id, from = ?self.phase, to = ?next, "Execution phase");
        self.phase = next;
    }

    /// Drive `input` through tiling, inference, stitching, and encoding.
    ///
    /// Every tensor created here is disposed before this returns, on every path.
    pub async fn run(
        &mut self,
        input: Array4<f32>,
        tiling: (Option<usize>, usize),
        options: &UpscaleOptions,
    ) -> UpscaleResult<UpscaleOutput> {
        let result = self.run_inner(input, tiling, options).await;
        let settlement = match &result {
            Ok(_) => Settlement::Success,
            Err(err) if err.is_cancelled() => Settlement::Cancelled,
            Err(_) => Settlement::Failed,
        };
        self.transition(ExecutionPhase::Settled(settlement));
        result
    }

    async fn run_inner(
        &mut self,
        input: Array4<f32>,
        (patch_size, padding): (Option<usize>, usize),
        options: &UpscaleOptions,
    ) -> UpscaleResult<UpscaleOutput> {
        let (_, _, height, width) = input.dim();
        if height == 0 || width == 0 {
            return Err(UpscaleError::InvalidInput(format!(
                "cannot upscale an empty {width}x{height} image"
            )));
        }

        let mut input = TensorHandle::new(&self.ledger, input);
        self.transition(ExecutionPhase::Tiling);
        let plan = tiling::plan(width, height, patch_size, padding);
        debug!(
            id = self.id,
            width,
            height,
            rows = plan.rows,
            cols = plan.cols,
            tiles = plan.len(),
            "Tile plan ready"
        );

        let mut stitcher = Stitcher::new(&self.ledger, &plan, self.scale);
        let total = plan.len();
        for (index, tile) in plan.tiles().iter().enumerate() {
            if self.token.is_cancelled() {
                debug!(id = self.id, tile = index, total, "Cancellation observed");
                input.dispose();
                return Err(UpscaleError::Cancelled);
            }
            self.transition(ExecutionPhase::Inferring(index));
            let tile_format = options.progress.as_ref().and(options.progress_output);
            let core = self
                .infer_tile(&input, tile, &mut stitcher, tile_format.is_some())
                .await?;

            if let Some(progress) = &options.progress {
                let tile_output = match (core, tile_format) {
                    (Some(core), Some(format)) => {
                        Some(encode(TensorHandle::new(&self.ledger, core), format)?)
                    }
                    _ => None,
                };
                progress(Progress {
                    completed: index + 1,
                    total,
                    ratio: (index + 1) as f32 / total as f32,
                    row: tile.row,
                    col: tile.col,
                    tile: tile_output,
                });
            }
        }
        input.dispose();

        self.transition(ExecutionPhase::Stitching);
        let output = stitcher.finish().map_err(UpscaleError::Inference)?;
        encode(output, options.output)
    }

    async fn infer_tile(
        &self,
        input: &TensorHandle,
        tile: &Tile,
        stitcher: &mut Stitcher,
        copy_core: bool,
    ) -> UpscaleResult<Option<Array4<f32>>> {
        let array = input.array().map_err(UpscaleError::Inference)?;
        let tile_input = TensorHandle::new(&self.ledger, extract_tile(array, tile));
        let tile_output = infer(&self.model, &self.ledger, tile_input).await?;
        let written = if copy_core {
            stitcher.write_and_copy_core(tile, tile_output).map(Some)
        } else {
            stitcher.write(tile, tile_output).map(|_| None)
        };
        written.map_err(UpscaleError::Inference)
    }
}

fn encode(mut output: TensorHandle, format: OutputFormat) -> UpscaleResult<UpscaleOutput> {
    match format {
        OutputFormat::Tensor => output
            .into_array()
            .map(UpscaleOutput::Tensor)
            .map_err(UpscaleError::Inference),
        OutputFormat::DataUrl => {
            let array = output.array().map_err(UpscaleError::Inference)?;
            if array.dim().0 != 1 {
                return Err(UpscaleError::InvalidInput(format!(
                    "a batch of {} images cannot be encoded as one data URL",
                    array.dim().0
                )));
            }
            let url = to_data_url(array).map_err(UpscaleError::Inference)?;
            output.dispose();
            Ok(UpscaleOutput::DataUrl(url))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::{bail, Result};
    use ndarray::Axis;

    use super::*;

    /// Nearest-neighbour upscaler.
    struct Nearest {
        scale: usize,
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl Nearest {
        fn new(scale: usize) -> Arc<Self> {
            Arc::new(Self {
                scale,
                calls: AtomicUsize::new(0),
                fail_on: None,
            })
        }
    }

    impl InferenceModel for Nearest {
        fn predict(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(call) {
                bail!("kernel exploded on call {call}");
            }
            let (n, c, h, w) = input.dim();
            let s = self.scale;
            Ok(Array4::from_shape_fn((n, c, h * s, w * s), |(b, ch, y, x)| {
                input[[b, ch, y / s, x / s]]
            }))
        }
    }

    fn image(h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| (c * 40 + y * 7 + x * 3) as f32)
    }

    fn controller(
        model: Arc<dyn InferenceModel>,
        ledger: &Arc<TensorLedger>,
        token: CancellationToken,
    ) -> ExecutionController {
        ExecutionController::new(1, model, 2, Arc::clone(ledger), token)
    }

    #[tokio::test]
    async fn test_tiled_and_untiled_outputs_match() {
        let ledger = TensorLedger::new();
        let model = Nearest::new(2);
        let input = image(7, 9);

        let untiled = controller(model.clone(), &ledger, CancellationToken::new())
            .run(input.clone(), (None, 0), &UpscaleOptions::tensor())
            .await
            .unwrap()
            .into_tensor()
            .unwrap();
        let tiled = controller(model.clone(), &ledger, CancellationToken::new())
            .run(input, (Some(3), 2), &UpscaleOptions::tensor())
            .await
            .unwrap()
            .into_tensor()
            .unwrap();

        assert_eq!(untiled.dim(), (1, 3, 14, 18));
        assert_eq!(tiled, untiled);
        assert_eq!(ledger.live(), 0);
    }

    #[tokio::test]
    async fn test_progress_reports_every_tile_in_order() {
        let ledger = TensorLedger::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = UpscaleOptions::tensor().with_progress(move |p| {
            sink.lock().unwrap().push((p.completed, p.total, p.row, p.col));
        });

        let mut ctl = controller(Nearest::new(2), &ledger, CancellationToken::new());
        ctl.run(image(4, 4), (Some(2), 0), &options).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, 4, 0, 0), (2, 4, 0, 1), (3, 4, 1, 0), (4, 4, 1, 1)]
        );
        assert_eq!(ctl.phase(), ExecutionPhase::Settled(Settlement::Success));
    }

    #[tokio::test]
    async fn test_progress_delivers_cropped_tiles() {
        let ledger = TensorLedger::new();
        let input = image(5, 4);
        let expected = Nearest::new(2).predict(&input).unwrap();
        let tiles = Arc::new(Mutex::new(Vec::new()));
        let sink = tiles.clone();
        let options = UpscaleOptions::tensor()
            .with_progress_output(OutputFormat::Tensor)
            .with_progress(move |p| sink.lock().unwrap().push(p));

        let output = controller(Nearest::new(2), &ledger, CancellationToken::new())
            .run(input, (Some(3), 1), &options)
            .await
            .unwrap()
            .into_tensor()
            .unwrap();
        assert_eq!(output, expected);

        let tiles = tiles.lock().unwrap();
        assert_eq!(tiles.len(), 4);
        for (p, (y0, x0, h, w)) in tiles.iter().zip([(0, 0, 6, 6), (0, 6, 6, 2), (6, 0, 4, 6), (6, 6, 4, 2)]) {
            let tile = p.tile.as_ref().and_then(UpscaleOutput::as_tensor).unwrap();
            assert_eq!(tile, &expected.slice(ndarray::s![.., .., y0..y0 + h, x0..x0 + w]));
        }
        assert_eq!(ledger.live(), 0);
    }

    #[tokio::test]
    async fn test_progress_tiles_as_data_urls() {
        let ledger = TensorLedger::new();
        let urls = Arc::new(Mutex::new(Vec::new()));
        let sink = urls.clone();
        let options = UpscaleOptions::tensor()
            .with_progress_output(OutputFormat::DataUrl)
            .with_progress(move |p| {
                if let Some(UpscaleOutput::DataUrl(url)) = p.tile {
                    sink.lock().unwrap().push(url);
                }
            });

        controller(Nearest::new(2), &ledger, CancellationToken::new())
            .run(image(4, 4), (Some(2), 0), &options)
            .await
            .unwrap();

        let urls = urls.lock().unwrap();
        assert_eq!(urls.len(), 4);
        assert!(urls.iter().all(|url| url.starts_with("data:image/png;base64,")));
        assert_eq!(ledger.live(), 0);
    }

    #[tokio::test]
    async fn test_progress_without_output_format_has_no_tile() {
        let ledger = TensorLedger::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = UpscaleOptions::tensor().with_progress(move |p| sink.lock().unwrap().push(p.tile));

        controller(Nearest::new(2), &ledger, CancellationToken::new())
            .run(image(4, 4), (Some(2), 0), &options)
            .await
            .unwrap();
        assert!(seen.lock().unwrap().iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn test_cancellation_after_first_tile_stops_submission() {
        let ledger = TensorLedger::new();
        let model = Nearest::new(2);
        let token = CancellationToken::new();
        let trigger = token.clone();
        let options = UpscaleOptions::tensor().with_progress(move |p| {
            if p.completed == 1 {
                trigger.cancel();
                trigger.cancel();
            }
        });

        let mut ctl = controller(model.clone(), &ledger, token);
        let err = ctl.run(image(4, 4), (Some(2), 0), &options).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.phase(), ExecutionPhase::Settled(Settlement::Cancelled));
        assert_eq!(ledger.live(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_before_start_runs_no_inference() {
        let ledger = TensorLedger::new();
        let model = Nearest::new(2);
        let token = CancellationToken::new();
        token.cancel();

        let err = controller(model.clone(), &ledger, token)
            .run(image(2, 2), (None, 0), &UpscaleOptions::tensor())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.live(), 0);
    }

    #[tokio::test]
    async fn test_inference_failure_disposes_everything() {
        let ledger = TensorLedger::new();
        let model = Arc::new(Nearest {
            scale: 2,
            calls: AtomicUsize::new(0),
            fail_on: Some(2),
        });

        let mut ctl = controller(model, &ledger, CancellationToken::new());
        let err = ctl
            .run(image(4, 4), (Some(2), 1), &UpscaleOptions::tensor())
            .await
            .unwrap_err();

        assert!(matches!(err, UpscaleError::Inference(_)));
        assert!(err.to_string().contains("kernel exploded on call 2"));
        assert_eq!(ctl.phase(), ExecutionPhase::Settled(Settlement::Failed));
        assert_eq!(ledger.live(), 0);
        assert!(ledger.allocated() > 0);
    }

    #[tokio::test]
    async fn test_wrong_scale_model_fails_the_call() {
        let ledger = TensorLedger::new();
        let mut ctl = ExecutionController::new(
            7,
            Nearest::new(3),
            2,
            Arc::clone(&ledger),
            CancellationToken::new(),
        );
        let err = ctl
            .run(image(4, 4), (Some(2), 0), &UpscaleOptions::tensor())
            .await
            .unwrap_err();
        assert!(matches!(err, UpscaleError::Inference(_)));
        assert_eq!(ledger.live(), 0);
    }

    #[tokio::test]
    async fn test_data_url_output_encodes_png() {
        let ledger = TensorLedger::new();
        let output = controller(Nearest::new(2), &ledger, CancellationToken::new())
            .run(image(3, 3), (None, 0), &UpscaleOptions::default())
            .await
            .unwrap();
        let url = output.as_data_url().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
        assert_eq!(ledger.live(), 0);
    }

    #[tokio::test]
    async fn test_batched_data_url_output_is_rejected() {
        let ledger = TensorLedger::new();
        let batch = ndarray::concatenate(Axis(0), &[image(2, 2).view(), image(2, 2).view()]).unwrap();
        let err = controller(Nearest::new(2), &ledger, CancellationToken::new())
            .run(batch, (None, 0), &UpscaleOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UpscaleError::InvalidInput(_)));
        assert_eq!(ledger.live(), 0);
    }

    #[tokio::test]
    async fn test_empty_image_is_invalid_input() {
        let ledger = TensorLedger::new();
        let err = controller(Nearest::new(2), &ledger, CancellationToken::new())
            .run(Array4::zeros((1, 3, 0, 4)), (None, 0), &UpscaleOptions::tensor())
            .await
            .unwrap_err();
        assert!(matches!(err, UpscaleError::InvalidInput(_)));
    }

    #[test]
    fn test_tiling_resolution_prefers_call_options() {
        assert_eq!(resolve_tiling(Some(64), Some(4), Some(128), Some(8)), (Some(64), 4));
        assert_eq!(resolve_tiling(None, None, Some(128), Some(8)), (Some(128), 8));
        assert_eq!(resolve_tiling(None, Some(4), None, None), (None, 0));
        assert_eq!(resolve_tiling(Some(0), None, None, None), (None, 0));
        assert_eq!(resolve_tiling(Some(32), None, None, None), (Some(32), 0));
    }
}
