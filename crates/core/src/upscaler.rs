//! The `Upscaler` façade: model lifecycle, in-flight call registry, abort and dispose.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};

use crate::abort::{AbortHandle, AbortRegistry, CallKind, Registration};
use crate::error::{UpscaleError, UpscaleResult};
use crate::execution::{resolve_tiling, ExecutionController, UpscaleOptions, UpscaleOutput};
use crate::image_io::{normalize_input, Environment, Input};
use crate::model::{ModelDefinition, ModelHandle, ModelLoader};
use crate::tensor::TensorLedger;
use crate::warmup::{self, WarmupPass, WarmupSpec, WarmupStatus};

/// Channels of the synthetic warmup tensors.
const WARMUP_CHANNELS: usize = 3;

#[derive(Debug, Clone)]
pub struct UpscalerConfig {
    pub model: ModelDefinition,
    pub warmup: Vec<WarmupSpec>,
    pub environment: Environment,
}

impl UpscalerConfig {
    pub fn new(model: ModelDefinition) -> Self {
        Self {
            model,
            warmup: Vec::new(),
            environment: Environment::default(),
        }
    }

    pub fn with_warmup(mut self, specs: impl IntoIterator<Item = WarmupSpec>) -> Self {
        self.warmup = specs.into_iter().collect();
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }
}

#[derive(Clone)]
enum LoadState {
    Loading,
    Ready(Arc<ModelHandle>),
    Failed(String),
}

struct Shared {
    registry: Arc<AbortRegistry>,
    ledger: Arc<TensorLedger>,
    load: watch::Receiver<LoadState>,
    disposed: AtomicBool,
    disposal: OnceCell<()>,
}

impl Shared {
    async fn loaded(&self) -> UpscaleResult<Arc<ModelHandle>> {
        let mut load = self.load.clone();
        let state = load
            .wait_for(|state| !matches!(state, LoadState::Loading))
            .await
            .map(|state| state.clone())
            .map_err(|_| UpscaleError::Load("model load task ended unexpectedly".to_string()))?;
        match state {
            LoadState::Ready(handle) => Ok(handle),
            LoadState::Failed(message) => Err(UpscaleError::Load(message)),
            LoadState::Loading => Err(UpscaleError::Load("model is still loading".to_string())),
        }
    }

    /// Register first, then check `disposed`: `dispose()` sets the flag before
    /// aborting, so every call either sees the flag or gets aborted and awaited.
    fn register(&self, kind: CallKind) -> UpscaleResult<Registration> {
        let registration = self.registry.register(kind);
        if self.disposed.load(Ordering::SeqCst) {
            return Err(UpscaleError::Disposed);
        }
        Ok(registration)
    }

    async fn warmup(&self, passes: &[WarmupPass]) -> UpscaleResult<usize> {
        let registration = self.register(CallKind::Warmup)?;
        let handle = self.loaded().await?;
        let model = handle.model()?;
        warmup::run_warmup(
            &model,
            &self.ledger,
            passes,
            WARMUP_CHANNELS,
            registration.token(),
        )
        .await
    }
}

/// Super-resolution over one loaded model, shared by any number of concurrent calls.
///
/// Construction spawns the model load (and the configured warmup after it) on
/// the current tokio runtime and returns immediately.
pub struct Upscaler {
    definition: ModelDefinition,
    environment: Environment,
    shared: Arc<Shared>,
    warmup_status: watch::Receiver<WarmupStatus>,
}

impl Upscaler {
    pub fn new(config: UpscalerConfig, loader: Arc<dyn ModelLoader>) -> UpscaleResult<Self> {
        config.model.validate()?;
        let passes = warmup::normalize(&config.warmup)?;

        let (load_tx, load_rx) = watch::channel(LoadState::Loading);
        let initial_warmup = if passes.is_empty() {
            WarmupStatus::Skipped
        } else {
            WarmupStatus::Pending
        };
        let (warmup_tx, warmup_rx) = watch::channel(initial_warmup);

        let shared = Arc::new(Shared {
            registry: AbortRegistry::new(),
            ledger: TensorLedger::new(),
            load: load_rx,
            disposed: AtomicBool::new(false),
            disposal: OnceCell::new(),
        });

        let definition = config.model.clone();
        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            match ModelHandle::load(loader.as_ref(), definition).await {
                Ok(handle) => {
                    load_tx.send_replace(LoadState::Ready(Arc::new(handle)));
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "Model load failed");
                    load_tx.send_replace(LoadState::Failed(message.clone()));
                    if !passes.is_empty() {
                        warmup_tx.send_replace(WarmupStatus::Failed(message));
                    }
                    return;
                }
            }

            if passes.is_empty() {
                return;
            }
            warmup_tx.send_replace(WarmupStatus::Running);
            let status = match task_shared.warmup(&passes).await {
                Ok(count) => WarmupStatus::Complete { passes: count },
                Err(err) if err.is_cancelled() || matches!(err, UpscaleError::Disposed) => {
                    debug!(error = %err, "Scheduled warmup cancelled");
                    WarmupStatus::Cancelled
                }
                Err(err) => {
                    error!(error = %err, "Warmup failed");
                    WarmupStatus::Failed(err.to_string())
                }
            };
            warmup_tx.send_replace(status);
        });

        Ok(Self {
            definition: config.model,
            environment: config.environment,
            shared,
            warmup_status: warmup_rx,
        })
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn ledger(&self) -> &Arc<TensorLedger> {
        &self.shared.ledger
    }

    /// Resolves once the model is loaded; returns the load error otherwise.
    pub async fn ready(&self) -> UpscaleResult<()> {
        self.shared.loaded().await.map(|_| ())
    }

    pub async fn execute(
        &self,
        input: impl Into<Input>,
        options: UpscaleOptions,
    ) -> UpscaleResult<UpscaleOutput> {
        let input = input.into();
        self.environment
            .check(&input, options.output, options.progress_output)?;

        let registration = self.shared.register(CallKind::Execute)?;
        let handle = self.shared.loaded().await?;
        let model = handle.model()?;
        let pixels = normalize_input(input).await?;

        let definition = handle.definition();
        let tiling = resolve_tiling(
            options.patch_size,
            options.padding,
            definition.patch_size,
            definition.padding,
        );

        let mut controller = ExecutionController::new(
            registration.id(),
            model,
            handle.scale(),
            Arc::clone(&self.shared.ledger),
            registration.token().clone(),
        );
        let result = controller.run(pixels, tiling, &options).await;
        drop(registration);
        result
    }

    /// Cancel every call in flight. Calls started afterwards are unaffected.
    pub fn abort(&self) {
        let cancelled = self.shared.registry.abort_all();
        debug!(cancelled, "Abort requested");
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(Arc::clone(&self.shared.registry))
    }

    /// Number of executions and warmups currently in flight.
    pub fn execution_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Run warmup passes now, in addition to any configured at construction.
    pub async fn warmup(&self, specs: &[WarmupSpec]) -> UpscaleResult<usize> {
        let passes = warmup::normalize(specs)?;
        self.shared.warmup(&passes).await
    }

    pub fn warmup_status(&self) -> WarmupStatus {
        self.warmup_status.borrow().clone()
    }

    /// Waits for the constructor-scheduled warmup to settle.
    pub async fn warmup_settled(&self) -> WarmupStatus {
        let mut status = self.warmup_status.clone();
        let settled = match status.wait_for(WarmupStatus::is_settled).await {
            Ok(settled) => settled.clone(),
            Err(_) => self.warmup_status(),
        };
        settled
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Abort everything in flight, wait for it to settle, then release the model.
    ///
    /// Only the first call does the work and reports its outcome. Later calls,
    /// concurrent or not, wait for that work to finish and return `Ok`.
    /// Disposing after a failed load succeeds.
    pub async fn dispose(&self) -> UpscaleResult<()> {
        let mut outcome = None;
        let slot = &mut outcome;
        self.shared
            .disposal
            .get_or_init(|| async move {
                *slot = Some(self.dispose_once().await);
            })
            .await;
        outcome.unwrap_or(Ok(()))
    }

    async fn dispose_once(&self) -> UpscaleResult<()> {
        self.shared.disposed.store(true, Ordering::SeqCst);

        let cancelled = self.shared.registry.abort_all();
        debug!(cancelled, "Waiting for in-flight calls before dispose");
        self.shared.registry.wait_until_empty().await;

        match self.shared.loaded().await {
            Ok(handle) => {
                handle.dispose().await?;
                info!(path = %self.definition.path, "Upscaler disposed");
            }
            Err(err) => {
                warn!(error = %err, "Disposing upscaler whose model never loaded");
            }
        }

        let live = self.shared.ledger.live();
        if live != 0 {
            warn!(live, "Tensors still live after dispose");
        }
        Ok(())
    }
}
