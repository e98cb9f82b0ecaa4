use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilescale_core::backend::InferenceBackend;
use tilescale_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, TilescaleConfig,
};
use tilescale_core::image_io::save_png;
use tilescale_core::logging::{FileSink, LogSettings, DEFAULT_LOG_FILTER};
use tilescale_core::ort_model::{ModelCache, OrtModelLoader};
use tilescale_core::{
    Progress, UpscaleOptions, UpscaleOutput, UpscaleResult, Upscaler, WarmupSpec, WarmupStatus,
};

#[derive(Parser)]
#[command(name = "tilescale", about = "Tiled super-resolution for images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Config file (default: <data-dir>/config.toml)")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Upscale(UpscaleArgs),
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a default config file if none exists.
    Init,
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Image path, http(s) URL, or data URL")]
    input: String,
    #[arg(short = 'o', long, help = "Output PNG path")]
    output: PathBuf,
    #[arg(long, help = "Model path or URL (overrides [model].path)")]
    model: Option<String>,
    #[arg(long)]
    scale: Option<u32>,
    #[arg(long)]
    patch_size: Option<usize>,
    #[arg(long)]
    padding: Option<usize>,
    #[arg(long = "warmup", value_name = "SIZE", num_args = 1.., help = "Warmup tile sizes")]
    warmup: Vec<usize>,
    #[arg(long, value_name = "cuda|tensorrt|cpu")]
    backend: Option<String>,
    #[arg(long, help = "Abort the upscale after this many seconds")]
    timeout_secs: Option<u64>,
}

impl UpscaleArgs {
    fn apply_to(&self, config: &mut TilescaleConfig) {
        if let Some(model) = &self.model {
            config.model.path = model.clone();
        }
        if let Some(scale) = self.scale {
            config.model.scale = scale;
        }
        if self.patch_size.is_some() {
            config.tiling.patch_size = self.patch_size;
        }
        if self.padding.is_some() {
            config.tiling.padding = self.padding;
        }
        if !self.warmup.is_empty() {
            config.warmup.sizes = self.warmup.iter().copied().map(WarmupSpec::Size).collect();
        }
        if let Some(backend) = &self.backend {
            config.runtime.backend = InferenceBackend::from_str_lossy(backend);
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_status = tilescale_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    tilescale_core::runtime::log_runtime_lib_status(&runtime_status);

    let cfg_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_path(&resolved_data_dir));
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Config(ConfigCommand::Init) => init_config(&resolved_data_dir, cli.config.as_deref()),
        Commands::Upscale(args) => run_upscale(args, &resolved_data_dir, &cfg_path).await,
    }
}

fn init_config(data_dir: &Path, explicit: Option<&Path>) -> Result<()> {
    match explicit {
        Some(path) if path.exists() => info!(path = %path.display(), "Config file already exists"),
        Some(path) => {
            TilescaleConfig::default().save_to_path(path)?;
            info!(path = %path.display(), "Wrote default config");
        }
        None => {
            if initialize_data_dir(data_dir)? {
                info!(path = %config_path(data_dir).display(), "Wrote default config");
            } else {
                info!(path = %config_path(data_dir).display(), "Config file already exists");
            }
        }
    }
    Ok(())
}

async fn run_upscale(args: UpscaleArgs, data_dir: &Path, cfg_path: &Path) -> Result<()> {
    let mut config = TilescaleConfig::load_from_path(cfg_path)?;
    args.apply_to(&mut config);
    let upscaler_config = config.upscaler_config()?;

    let cache = Arc::new(ModelCache::new(resolve_relative_to(
        data_dir,
        &config.runtime.model_cache_dir,
    )));
    let loader = OrtModelLoader::new(config.runtime.backend.clone(), cache)
        .with_trt_cache_dir(resolve_relative_to(data_dir, &config.runtime.trt_cache_dir));

    let started = Instant::now();
    let upscaler = Upscaler::new(upscaler_config, Arc::new(loader))?;
    upscaler.ready().await?;
    info!(
        model = %config.model.path,
        scale = config.model.scale,
        backend = %config.runtime.backend,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Model ready"
    );

    match upscaler.warmup_settled().await {
        WarmupStatus::Failed(reason) => warn!(%reason, "Warmup failed; continuing"),
        WarmupStatus::Complete { passes } => info!(passes, "Warmup finished"),
        _ => {}
    }

    let run_started = Instant::now();
    let options = UpscaleOptions::tensor().with_progress(move |progress| {
        eprint!("\r{}", render_progress(&progress, run_started.elapsed().as_secs_f64()));
    });

    let result = execute_with_timeout(&upscaler, args.input.clone(), options, args.timeout_secs).await;
    eprintln!();

    let outcome = match result {
        Ok(output) => write_output(output, &args.output, run_started),
        Err(err) if err.is_cancelled() => Err(anyhow::anyhow!(
            "upscale aborted after {}s timeout",
            args.timeout_secs.unwrap_or_default()
        )),
        Err(err) => Err(err).context("upscale failed"),
    };

    upscaler.dispose().await?;
    outcome
}

fn write_output(output: UpscaleOutput, path: &Path, started: Instant) -> Result<()> {
    let Some(tensor) = output.into_tensor() else {
        bail!("upscaler returned an encoded image where a tensor was requested");
    };
    save_png(&tensor, path)?;
    let (_, _, h, w) = tensor.dim();
    info!(
        output = %path.display(),
        width = w,
        height = h,
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Upscale complete"
    );
    Ok(())
}

/// Races the call against a timer; on expiry aborts and waits for it to settle.
async fn execute_with_timeout(
    upscaler: &Upscaler,
    input: String,
    options: UpscaleOptions,
    timeout_secs: Option<u64>,
) -> UpscaleResult<UpscaleOutput> {
    let call = upscaler.execute(input, options);
    let Some(secs) = timeout_secs else {
        return call.await;
    };

    tokio::pin!(call);
    tokio::select! {
        result = &mut call => result,
        _ = tokio::time::sleep(Duration::from_secs(secs)) => {
            warn!(timeout_secs = secs, "Timeout reached; aborting");
            upscaler.abort_handle().abort();
            call.await
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let settings = LogSettings {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        env_filter: std::env::var("RUST_LOG").ok(),
    };
    let filters = settings.filters();
    let console_filter = filters.console;
    let file_filter = filters.file;

    match settings.file_sink() {
        FileSink::Rolling(appender) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSink::Unavailable { log_dir, reason } => {
            let attempted_log_dir = log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress(progress: &Progress, elapsed: f64) -> String {
    let fraction = progress.ratio.clamp(0.0, 1.0) as f64;
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let eta = if progress.completed > 0 && progress.completed < progress.total {
        let per_tile = elapsed / progress.completed as f64;
        let remaining = (progress.total - progress.completed) as f64 * per_tile;
        format!(" | ETA: {}", format_duration(remaining))
    } else {
        String::new()
    };

    format!(
        "[{}] {:5.1}% | Tile {}/{} | Elapsed: {}{}    ",
        bar,
        fraction * 100.0,
        progress.completed,
        progress.total,
        format_duration(elapsed),
        eta,
    )
}
