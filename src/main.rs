//! rawcap: capture raw frames from a camera into files

use std::path::PathBuf;

use color_eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rawcap::capture::{CaptureBackend, SyntheticBackend};
use rawcap::pipeline::{PipelineController, PipelineOptions, PipelineResult};
use rawcap::sink::{FrameSink, RawFileSink};
use rawcap::{BackendKind, Config};

const CONFIG_ENV: &str = "RAWCAP_CONFIG";
const DEFAULT_CONFIG: &str = "rawcap.toml";

fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    let default = PathBuf::from(DEFAULT_CONFIG);
    default.exists().then_some(default)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rawcap=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("rawcap launching...");

    // Load configuration
    let path = config_path();
    let config = Config::load(path.as_deref())?;
    match &path {
        Some(p) => info!("Loaded configuration from {}", p.display()),
        None => info!("Using default configuration"),
    }

    let result = match config.backend.kind {
        BackendKind::Synthetic => {
            let backend = SyntheticBackend::new(config.backend.synthetic.clone());
            run(backend, &config).await?
        }
        #[cfg(feature = "v4l2")]
        BackendKind::V4l2 => {
            let backend = rawcap::capture::V4l2Backend::new(
                config.backend.buffer_count,
                config.capture.pixel_format,
            );
            run(backend, &config).await?
        }
        #[cfg(not(feature = "v4l2"))]
        BackendKind::V4l2 => {
            return Err(color_eyre::eyre::eyre!(
                "rawcap was built without the `v4l2` feature"
            ));
        }
    };

    for e in &result.shutdown_errors {
        warn!("Shutdown: {}", e);
    }

    match result.outcome {
        Ok(()) => {
            info!(
                "Captured {} frames in {:.2?} ({:?})",
                result.frames_processed, result.elapsed, result.stop_reason
            );
            Ok(())
        }
        Err(e) => {
            error!("Pipeline failed after {} frames", result.frames_processed);
            Err(e.into())
        }
    }
}

async fn run<B>(backend: B, config: &Config) -> Result<PipelineResult>
where
    B: CaptureBackend + Send + 'static,
{
    let output = config.output.clone();
    let mut controller = PipelineController::new(
        backend,
        PipelineOptions::from(&config.pipeline),
        move || Ok(Box::new(RawFileSink::new(&output)?) as Box<dyn FrameSink>),
    );

    // Ctrl-C ends the run early
    let cancel = controller.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            cancel.cancel();
        }
    });

    let capture = config.capture.clone();
    let duration = config.pipeline.duration();
    let result = tokio::task::spawn_blocking(move || match duration {
        Some(duration) => controller.run(&capture, duration),
        None => controller.run_until_stopped(&capture),
    })
    .await?;

    info!("Pipeline finished: {}", result);
    Ok(result)
}
