use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs, io};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::FailurePolicy;
use crate::errors::{AppError, AppResult};
use crate::ingestion::RecordFormat;
use crate::normalize::{NormalizationRules, RuleProvider};
use crate::query::CountryTarget;
use crate::strategy::StrategyChain;

const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_USER_AGENT: &str = concat!("registry-geocoder/", env!("CARGO_PKG_VERSION"));
const DEFAULT_REQUEST_DELAY_MS: u64 = 1_500;
// Total requests for one query while the service answers with no candidates,
// the first request included. Not a count of extra retries.
const DEFAULT_EMPTY_RESULT_ATTEMPTS: u32 = 3;
const DEFAULT_CODE_SUFFIX: &str = "EC";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoder_endpoint: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_user_agent: String,
    pub request_delay_ms: u64,
    pub empty_result_attempts: u32,
    pub request_timeout_secs: u64,
    pub data_dir: PathBuf,
    pub country_config_path: PathBuf,
    pub countries: Vec<String>,
    pub failure_listing_limit: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocoder_endpoint: String,
    pub geocoder_user_agent: String,
    pub request_delay_ms: u64,
    pub empty_result_attempts: u32,
    pub request_timeout_secs: u64,
    pub data_dir: String,
    pub country_config_path: String,
    pub countries: Vec<String>,
    pub failure_listing_limit: usize,
    pub has_geocoder_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            geocoder_endpoint: non_blank("GEOCODER_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            geocoder_api_key: non_blank("GEOCODER_API_KEY").map(SecretString::from),
            geocoder_user_agent: non_blank("GEOCODER_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            request_delay_ms: env_or("GEOCODER_REQUEST_DELAY_MS", DEFAULT_REQUEST_DELAY_MS),
            empty_result_attempts: env_or::<u32>(
                "GEOCODER_EMPTY_RESULT_ATTEMPTS",
                DEFAULT_EMPTY_RESULT_ATTEMPTS,
            )
            .max(1),
            request_timeout_secs: env_or("GEOCODER_TIMEOUT_SECS", 10),
            data_dir: non_blank("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
            country_config_path: non_blank("COUNTRY_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/countries.json")),
            countries: country_list("GEOCODE_COUNTRIES"),
            failure_listing_limit: env_or("FAILURE_LISTING_LIMIT", 10),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoder_endpoint: self.geocoder_endpoint.clone(),
            geocoder_user_agent: self.geocoder_user_agent.clone(),
            request_delay_ms: self.request_delay_ms,
            empty_result_attempts: self.empty_result_attempts,
            request_timeout_secs: self.request_timeout_secs,
            data_dir: self.data_dir.to_string_lossy().to_string(),
            country_config_path: self.country_config_path.to_string_lossy().to_string(),
            countries: self.countries.clone(),
            failure_listing_limit: self.failure_listing_limit,
            has_geocoder_api_key: self.geocoder_api_key.is_some(),
        }
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn input_path(&self, country_code: &str) -> PathBuf {
        self.data_dir.join("input").join(format!("{country_code}.csv"))
    }

    pub fn output_path(&self, country_code: &str) -> PathBuf {
        self.data_dir.join("output").join(format!("{country_code}.csv"))
    }
}

#[derive(Debug, Clone)]
pub struct CountryProfile {
    pub code: String,
    pub name: String,
    pub chain: StrategyChain,
    pub rules: RuleProvider,
    pub failure_policy: FailurePolicy,
    pub require_full_resolution: bool,
    pub postal_code_width: Option<usize>,
    pub code_suffix: String,
}

impl CountryProfile {
    pub fn target(&self) -> CountryTarget {
        CountryTarget {
            name: self.name.clone(),
            code: self.code.clone(),
        }
    }

    pub fn record_format(&self) -> RecordFormat {
        RecordFormat {
            country_code: self.code.clone(),
            code_suffix: self.code_suffix.clone(),
            postal_code_width: self.postal_code_width,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CountrySettings {
    default_chain: StrategyChain,
    countries: BTreeMap<String, CountryProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCountrySettings {
    #[serde(default)]
    default_strategies: Option<Vec<String>>,
    countries: BTreeMap<String, RawCountryProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCountryProfile {
    name: String,
    #[serde(default)]
    strategies: Option<Vec<String>>,
    #[serde(default)]
    normalization: NormalizationRules,
    #[serde(default)]
    abort_on_failure: bool,
    #[serde(default)]
    require_full_resolution: bool,
    #[serde(default)]
    postal_code_width: Option<usize>,
    #[serde(default)]
    code_suffix: Option<String>,
}

impl CountrySettings {
    pub fn load(path: &Path) -> AppResult<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!(
                "unable to read country configuration {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json(&contents)
    }

    // Everything is validated here, before any record is touched.
    pub fn from_json(contents: &str) -> AppResult<Self> {
        let raw: RawCountrySettings = serde_json::from_str(contents)
            .map_err(|err| AppError::Config(format!("malformed country configuration: {err}")))?;

        let default_chain = match &raw.default_strategies {
            Some(names) => StrategyChain::from_names(names)?,
            None => StrategyChain::default(),
        };

        let mut countries = BTreeMap::new();
        for (code, profile) in raw.countries {
            let code = code.trim().to_ascii_uppercase();
            if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(AppError::Config(format!(
                    "country code {code:?} must be ASCII letters or digits"
                )));
            }
            if profile.name.trim().is_empty() {
                return Err(AppError::Config(format!("country {code} needs a name")));
            }
            let chain = match &profile.strategies {
                Some(names) => StrategyChain::from_names(names)
                    .map_err(|err| AppError::Config(format!("{code}: {err}")))?,
                None => default_chain.clone(),
            };
            let rules = RuleProvider::compile(&code, &profile.normalization)?;
            let failure_policy = if profile.abort_on_failure {
                FailurePolicy::AbortCountry
            } else {
                FailurePolicy::Continue
            };
            countries.insert(
                code.clone(),
                CountryProfile {
                    code,
                    name: profile.name.trim().to_string(),
                    chain,
                    rules,
                    failure_policy,
                    require_full_resolution: profile.require_full_resolution,
                    postal_code_width: profile.postal_code_width,
                    code_suffix: profile
                        .code_suffix
                        .unwrap_or_else(|| DEFAULT_CODE_SUFFIX.to_string()),
                },
            );
        }

        Ok(Self {
            default_chain,
            countries,
        })
    }

    pub fn profile(&self, country_code: &str) -> AppResult<&CountryProfile> {
        let code = country_code.trim().to_ascii_uppercase();
        self.countries
            .get(&code)
            .ok_or_else(|| AppError::Config(format!("no configuration for country {code}")))
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.countries.keys().map(String::as_str)
    }

    pub fn default_chain(&self) -> &StrategyChain {
        &self.default_chain
    }
}

// `.env` only feeds local runs: debug builds, or release builds that opt in.
fn load_dotenv_if_applicable() {
    let opted_in = non_blank("ALLOW_DOTENV").is_some_and(|v| matches!(v.as_str(), "1" | "true"));
    if !cfg!(debug_assertions) && !opted_in {
        debug!("not loading .env in a release build");
        return;
    }

    match dotenvy::dotenv() {
        Ok(path) => debug!(path = %path.display(), "loaded .env"),
        Err(dotenvy::Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => debug!(?err, "unable to load .env file"),
    }
}

fn non_blank(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// Unparsable values fall back to the default rather than failing startup.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    non_blank(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn country_list(key: &str) -> Vec<String> {
    non_blank(key)
        .map(|v| {
            v.split(',')
                .map(|item| item.trim().to_ascii_uppercase())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
