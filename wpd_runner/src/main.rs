use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use sunlight_wpd::pipeline::{PipelineConfig, WpdPipeline};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const USAGE: &str = "Usage: wpd_runner <aoi_dir> <frame_dir> <output_dir> [config.json]";

fn init_tracing() {
    let use_json = env::var("WPD_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(env_filter)
            .init();
    }
}

/// Defaults, then the JSON file, then `WPD_*` variables, then the positional directories.
fn load_config(args: &[String]) -> anyhow::Result<PipelineConfig> {
    let mut config = match args.get(4) {
        Some(path) => PipelineConfig::from_json_file(&PathBuf::from(path))?,
        None => PipelineConfig::default(),
    };
    config.apply_env()?;
    config.aoi_directory = PathBuf::from(&args[1]);
    config.frame_directory = PathBuf::from(&args[2]);
    config.output_directory = PathBuf::from(&args[3]);
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // --- 1. Argument Parsing & Setup ---
    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        eprintln!("{USAGE}");
        return Ok(ExitCode::from(2));
    }
    init_tracing();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            return Ok(ExitCode::from(1));
        }
    };
    info!(?config, "starting wpd_runner");

    // --- 2. Run ---
    let pipeline = WpdPipeline::new(config);
    match pipeline.run().await {
        Ok(summary) => {
            info!(
                series = summary.series_written,
                recovered_errors = summary.recovered_errors(),
                "finished"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_fatal() => {
            error!(category = ?e.category(), "{e}");
            Ok(ExitCode::from(1))
        }
        Err(e) => Err(e.into()),
    }
}
