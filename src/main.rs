use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use registry_geocoder::{
    init_tracing, run_countries, AppConfig, CountrySettings, HttpGeocoder, RunSummary,
};
use tracing::{error, info};

fn main() -> ExitCode {
    init_tracing();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(?err, "unable to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run()) {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(summary) => {
            error!(failed = ?summary.failed_countries, "run finished with failures");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<RunSummary> {
    let config = AppConfig::from_env();
    info!(config = ?config.public_profile(), "starting geocoding run");
    let settings = CountrySettings::load(&config.country_config_path)
        .context("loading country configuration")?;
    let transport = Arc::new(HttpGeocoder::new(&config)?);
    let summary = run_countries(&config, &settings, transport).await?;
    Ok(summary)
}
