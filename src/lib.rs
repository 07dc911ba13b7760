mod batch;
mod cache;
mod client;
mod config;
mod errors;
mod ingestion;
mod normalize;
mod query;
mod resolver;
mod strategy;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use batch::{
    BatchDriver, BatchReport, Checkpoint, CheckpointStore, FailedRecord, FailurePolicy,
    FailureReason,
};
pub use cache::QueryCache;
pub use client::{
    ClientStats, GeocodeTransport, HttpGeocoder, Lookup, LookupSource, QueryClient, RateLimiter,
};
pub use config::{AppConfig, CountryProfile, CountrySettings, PublicAppConfig};
pub use errors::{AppError, AppResult};
pub use ingestion::{
    detect_header, format_approval_code, read_records, standardize_rows, zero_fill_postal_code,
    ColumnLayout, HeaderLocation, RecordFormat, RecordWriter, StandardizeOutcome,
    StandardizedRecord,
};
pub use normalize::{normalize, NormalizationRules, Replacement, RuleProvider};
pub use query::{first_candidate, CountryTarget, GeocodeResult, QueryField, QueryParams};
pub use resolver::{Resolution, Resolver};
pub use strategy::{AttemptContext, Strategy, StrategyChain, StrategyOutcome};

#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<BatchReport>,
    // errors, aborts, or failures where the profile demands full resolution
    pub failed_countries: Vec<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed_countries.is_empty()
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,registry_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

pub async fn run_country(
    config: &AppConfig,
    profile: &CountryProfile,
    transport: Arc<dyn GeocodeTransport>,
    rate_limiter: Arc<RateLimiter>,
) -> AppResult<BatchReport> {
    let input = config.input_path(&profile.code);
    if !input.exists() {
        return Err(AppError::Validation(format!(
            "no standardized input at {}",
            input.display()
        )));
    }
    let records = read_records(&input)?;

    let cache = QueryCache::open(config.cache_dir(), &profile.code)?;
    let client = QueryClient::new(cache, transport, rate_limiter, config.empty_result_attempts);
    let resolver = Resolver::new(
        client,
        profile.target(),
        profile.chain.clone(),
        profile.rules.clone(),
    );

    info!(
        target: "batch",
        country = %profile.code,
        records = records.len(),
        strategies = profile.chain.len(),
        "geocoding country"
    );
    BatchDriver::new(&resolver, profile.failure_policy)
        .run(&records, &config.output_path(&profile.code))
        .await
}

/// Runs every requested country in turn. Throttling and configuration errors
/// end the run at once; any other per-country error is reported and the next
/// country proceeds.
pub async fn run_countries(
    config: &AppConfig,
    settings: &CountrySettings,
    transport: Arc<dyn GeocodeTransport>,
) -> AppResult<RunSummary> {
    let codes: Vec<String> = if config.countries.is_empty() {
        settings.codes().map(str::to_string).collect()
    } else {
        config.countries.clone()
    };
    let profiles = codes
        .iter()
        .map(|code| settings.profile(code))
        .collect::<AppResult<Vec<_>>>()?;

    let rate_limiter = Arc::new(RateLimiter::new(config.request_delay()));
    let mut summary = RunSummary::default();
    for profile in profiles {
        let outcome = run_country(
            config,
            profile,
            Arc::clone(&transport),
            Arc::clone(&rate_limiter),
        )
        .await;
        match outcome {
            Ok(report) => {
                info!(target: "summary", "{}", report.summary_line());
                if report.failure_count > 0 {
                    warn!(
                        target: "summary",
                        country = %profile.code,
                        failed = ?report.failed_codes(config.failure_listing_limit),
                        "first failed codes"
                    );
                }
                if report.aborted || (profile.require_full_resolution && !report.is_complete()) {
                    summary.failed_countries.push(profile.code.clone());
                }
                summary.reports.push(report);
            }
            Err(err) if err.is_fatal() => {
                error!(target: "summary", country = %profile.code, %err, "stopping run");
                return Err(err);
            }
            Err(err) => {
                error!(target: "summary", country = %profile.code, %err, "country failed");
                summary.failed_countries.push(profile.code.clone());
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;
    use crate::client::testing::{Reply, ScriptedTransport};

    const SETTINGS: &str = r#"{
        "countries": {
            "FI": { "name": "Finland" },
            "HR": { "name": "Croatia", "code_suffix": "EU" }
        }
    }"#;

    fn config(data_dir: &std::path::Path, request_delay_ms: u64) -> AppConfig {
        AppConfig {
            geocoder_endpoint: "http://localhost/search".into(),
            geocoder_api_key: None,
            geocoder_user_agent: "registry-geocoder-tests".into(),
            request_delay_ms,
            empty_result_attempts: 1,
            request_timeout_secs: 5,
            data_dir: data_dir.to_path_buf(),
            country_config_path: data_dir.join("countries.json"),
            countries: Vec::new(),
            failure_listing_limit: 5,
        }
    }

    fn write_input(config: &AppConfig, country_code: &str, row: &str) {
        let input = config.input_path(country_code);
        std::fs::create_dir_all(input.parent().unwrap()).unwrap();
        std::fs::write(input, format!("code;name;street;city;postalcode\n{row}\n")).unwrap();
    }

    #[tokio::test]
    async fn request_delay_holds_between_countries() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 300);
        write_input(&config, "FI", "FI 1 EC;Dairy;Katu 1;Helsinki;00100");
        write_input(&config, "HR", "HR 1 EU;Mljekara;Ilica 1;Zagreb;10000");
        let settings = CountrySettings::from_json(SETTINGS).unwrap();

        let sent = Arc::new(Mutex::new(Vec::new()));
        let stamps = Arc::clone(&sent);
        let transport = ScriptedTransport::new(move |_| {
            stamps.lock().push(Instant::now());
            Reply::hit("45.0", "15.0")
        });

        let summary = run_countries(&config, &settings, transport).await.unwrap();
        assert!(summary.is_success());

        let sent = sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].duration_since(sent[0]) >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn configuration_errors_end_the_run_before_geocoding() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), 0);
        config.countries = vec!["FI".into(), "SE".into()];
        write_input(&config, "FI", "FI 1 EC;Dairy;Katu 1;Helsinki;00100");
        let settings = CountrySettings::from_json(SETTINGS).unwrap();
        let transport = ScriptedTransport::new(|_| Reply::hit("60.17", "24.94"));

        let err = run_countries(&config, &settings, transport.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_input_fails_only_that_country() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 0);
        write_input(&config, "HR", "HR 1 EU;Mljekara;Ilica 1;Zagreb;10000");
        let settings = CountrySettings::from_json(SETTINGS).unwrap();
        let transport = ScriptedTransport::new(|_| Reply::hit("45.81", "15.98"));

        let summary = run_countries(&config, &settings, transport.clone())
            .await
            .unwrap();
        assert_eq!(summary.failed_countries, vec!["FI".to_string()]);
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].success_count, 1);
        assert_eq!(transport.calls().len(), 1);
    }
}
