use std::sync::Arc;

use media_bus::{Outcome, Pipeline, PipelineConfig};
use tokio_util::sync::CancellationToken;

mod api;

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

/// Config file from the first argument, then `HWPIPE_CONFIG`; a built-in
/// test pattern run when neither is given.
fn load_config() -> anyhow::Result<PipelineConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HWPIPE_CONFIG").ok());
    match path {
        Some(path) => {
            log::info!("loading pipeline config from {}", path);
            Ok(PipelineConfig::from_file(&path)?)
        }
        None => {
            log::info!("no config given, running the default test pattern");
            Ok(PipelineConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    #[cfg(feature = "ffmpeg")]
    media_bus::init()?;

    let config = load_config()?;
    log::debug!("config: {}", serde_json::to_string(&config)?);
    let pipeline = Arc::new(Pipeline::from_config(&config)?);
    let cancel = CancellationToken::new();

    if let Ok(listen) = std::env::var("HWPIPE_LISTEN") {
        api::start_api_server(listen, Arc::clone(&pipeline), cancel.clone()).await?;
    }

    let mut events = pipeline.events();
    pipeline.open()?;
    pipeline.start()?;

    let outcome = tokio::select! {
        outcome = pipeline.wait(&mut events) => outcome,
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted");
            Outcome::Interrupted
        },
        _ = cancel.cancelled() => {
            log::info!("stop requested");
            Outcome::Interrupted
        },
    };
    cancel.cancel();

    pipeline.stop()?;
    pipeline.close()?;
    for status in pipeline.status() {
        log::info!("{}", serde_json::to_string(&status)?);
    }

    match outcome {
        Outcome::Finished => {
            log::info!("pipeline finished");
            Ok(())
        }
        Outcome::Interrupted => Ok(()),
        Outcome::Failed { stage, error } => Err(anyhow::anyhow!("{} failed: {}", stage, error)),
    }
}
