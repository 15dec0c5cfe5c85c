//! Configuration types for Larder components.
//!
//! Every service takes its configuration explicitly. Defaults mirror the
//! values the pipeline has always run with; an optional `larder.toml`
//! overrides pipeline tuning (see [`load_pipeline_config`]).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::retry::RetryConfig;

/// Nutrient columns summed into meals and kept in the meal store.
pub const DEFAULT_NUTRIENT_COLUMNS: &[&str] = &[
    "energy_kcal",
    "fat",
    "fatty_acids_saturated",
    "carbohydrates",
    "sugar",
    "salt",
    "fiber",
    "calcium",
    "iron",
    "zinc",
    "phosphorus",
    "fatty_acids_polyunsaturated",
    "fatty_acids_monounsaturated",
    "alcohol",
    "starch",
    "sodium",
    "water",
    "protein",
    "cholesterol",
];

/// SQLite connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP client configuration for the partner API.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("larder/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Harvester configuration.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Number of participants harvested concurrently.
    pub concurrency: usize,
    /// `items` query parameter for every paginated request.
    pub page_size: u32,
    /// `limit` query parameter for annotation requests.
    pub annotation_limit: u32,
    /// Hard ceiling on pages fetched per paginated listing.
    pub max_pages: u32,
    /// Look-back of a windowed harvest, in days.
    pub days_window: u32,
    pub retry: RetryConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            page_size: 250,
            annotation_limit: 20,
            max_pages: 1000,
            days_window: 3,
            retry: RetryConfig::default(),
        }
    }
}

impl HarvestConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn with_days_window(mut self, days: u32) -> Self {
        self.days_window = days;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Meal clustering configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Maximum gap between consecutive intake groups of one meal.
    pub window: TimeDelta,
    /// Zone used to derive wall-clock `local_time`.
    pub timezone: Tz,
    /// Nutrients summed into meals and persisted.
    pub nutrient_columns: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            window: TimeDelta::minutes(30),
            timezone: chrono_tz::Europe::Zurich,
            nutrient_columns: DEFAULT_NUTRIENT_COLUMNS
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

impl ClusterConfig {
    pub fn with_window(mut self, window: TimeDelta) -> Self {
        self.window = window;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_nutrient_columns(mut self, columns: Vec<String>) -> Self {
        self.nutrient_columns = columns;
        self
    }
}

/// Configuration of a whole pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub harvest: HarvestConfig,
    pub cluster: ClusterConfig,
}

// =============================================================================
// Partner credentials
// =============================================================================

/// Partner deployment selected by `MFR_DATA_ENV`. There is no default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartnerEnvironment {
    Local,
    Staging,
    Production,
}

impl PartnerEnvironment {
    pub const ENV_VAR: &'static str = "MFR_DATA_ENV";

    /// Resolves an optional selector, failing when it is absent or blank.
    pub fn resolve(value: Option<&str>) -> Result<Self, AppError> {
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => value.parse(),
            None => Err(AppError::ConfigError(format!(
                "{} is not set. Valid options: local, staging, production",
                Self::ENV_VAR
            ))),
        }
    }

    pub fn host(&self) -> &'static str {
        match self {
            Self::Local => "mfr.localhost",
            Self::Staging => "staging-v2.myfoodrepo.org",
            Self::Production => "v2.myfoodrepo.org",
        }
    }

    pub fn base_url(&self) -> String {
        format!("https://{}", self.host())
    }
}

impl fmt::Display for PartnerEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl FromStr for PartnerEnvironment {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            _ => Err(AppError::ConfigError(format!(
                "Unknown MFR_DATA_ENV: '{}'. Valid options: local, staging, production",
                s
            ))),
        }
    }
}

/// The three header values that authenticate against the partner API.
#[derive(Clone, PartialEq, Eq)]
pub struct PartnerCredentials {
    pub uid: String,
    pub client: String,
    pub access_token: String,
}

impl fmt::Debug for PartnerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartnerCredentials")
            .field("uid", &self.uid)
            .field("client", &self.client)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl PartnerCredentials {
    pub const UID_VAR: &'static str = "MFR_UID";
    pub const CLIENT_VAR: &'static str = "MFR_CLIENT";
    pub const ACCESS_TOKEN_VAR: &'static str = "MFR_ACCESS_TOKEN";

    /// Reads `MFR_UID`, `MFR_CLIENT` and `MFR_ACCESS_TOKEN` from the process
    /// environment.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads credentials through `lookup`. Missing or blank values are a
    /// configuration error naming every absent variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let uid = read(Self::UID_VAR);
        let client = read(Self::CLIENT_VAR);
        let access_token = read(Self::ACCESS_TOKEN_VAR);

        match (uid, client, access_token) {
            (Some(uid), Some(client), Some(access_token)) => Ok(Self {
                uid,
                client,
                access_token,
            }),
            (uid, client, access_token) => {
                let missing: Vec<&str> = [
                    (Self::UID_VAR, uid.is_none()),
                    (Self::CLIENT_VAR, client.is_none()),
                    (Self::ACCESS_TOKEN_VAR, access_token.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, absent)| absent.then_some(name))
                .collect();
                Err(AppError::ConfigError(format!(
                    "Missing partner credentials: {}",
                    missing.join(", ")
                )))
            }
        }
    }
}

// =============================================================================
// Pipeline configuration file (larder.toml)
// =============================================================================

/// Root structure of `larder.toml`. Every key is optional.
///
/// # Example
///
/// ```toml
/// [harvest]
/// concurrency = 4
/// days_window = 7
///
/// [retry]
/// max_attempts = 3
///
/// [cluster]
/// window_minutes = 45
/// timezone = "Europe/Rome"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfigFile {
    #[serde(default)]
    pub harvest: HarvestSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub cluster: ClusterSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarvestSection {
    pub concurrency: Option<usize>,
    pub page_size: Option<u32>,
    pub annotation_limit: Option<u32>,
    pub max_pages: Option<u32>,
    pub days_window: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub base_delay_secs: Option<u64>,
    pub max_jitter_secs: Option<u64>,
    pub max_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSection {
    pub window_minutes: Option<i64>,
    pub timezone: Option<String>,
    pub nutrient_columns: Option<Vec<String>>,
}

impl PipelineConfigFile {
    /// Overlays the values present in the file onto `base`.
    pub fn apply(&self, base: PipelineConfig) -> Result<PipelineConfig, AppError> {
        let PipelineConfig {
            mut harvest,
            mut cluster,
        } = base;

        let h = &self.harvest;
        if let Some(v) = h.concurrency {
            harvest = harvest.with_concurrency(v);
        }
        if let Some(v) = h.page_size {
            harvest.page_size = v.max(1);
        }
        if let Some(v) = h.annotation_limit {
            harvest.annotation_limit = v.max(1);
        }
        if let Some(v) = h.max_pages {
            harvest = harvest.with_max_pages(v);
        }
        if let Some(v) = h.days_window {
            harvest = harvest.with_days_window(v);
        }

        let r = &self.retry;
        if let Some(v) = r.max_attempts {
            harvest.retry.max_attempts = v.max(1);
        }
        if let Some(v) = r.base_delay_secs {
            harvest.retry.base_delay = Duration::from_secs(v);
        }
        if let Some(v) = r.max_jitter_secs {
            harvest.retry.max_jitter = Duration::from_secs(v);
        }
        if let Some(v) = r.max_delay_secs {
            harvest.retry.max_delay = Duration::from_secs(v);
        }

        let c = &self.cluster;
        if let Some(minutes) = c.window_minutes {
            let window = TimeDelta::try_minutes(minutes)
                .filter(|w| *w >= TimeDelta::zero())
                .ok_or_else(|| {
                    AppError::ConfigError(format!("Invalid cluster window: {} minutes", minutes))
                })?;
            cluster = cluster.with_window(window);
        }
        if let Some(name) = &c.timezone {
            let tz: Tz = name
                .parse()
                .map_err(|_| AppError::ConfigError(format!("Unknown timezone: '{}'", name)))?;
            cluster = cluster.with_timezone(tz);
        }
        if let Some(columns) = &c.nutrient_columns {
            cluster = cluster.with_nutrient_columns(columns.clone());
        }

        Ok(PipelineConfig { harvest, cluster })
    }
}

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "larder.toml";

/// Returns the default configuration directory: `~/.config/larder/`.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("larder"))
}

/// Returns the default configuration file path: `~/.config/larder/larder.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join(CONFIG_FILE_NAME))
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Larder pipeline configuration
#
# Every key is optional; uncomment to override the built-in default.

[harvest]
# concurrency = 10
# page_size = 250
# annotation_limit = 20
# max_pages = 1000
# days_window = 3

[retry]
# max_attempts = 5
# base_delay_secs = 10
# max_jitter_secs = 5
# max_delay_secs = 180

[cluster]
# window_minutes = 30
# timezone = "Europe/Zurich"
# nutrient_columns = ["energy_kcal", "fat", "carbohydrates", "protein"]
"#;

/// Load pipeline configuration from a TOML file.
///
/// # Returns
/// * `Ok(Some(file))` - Configuration loaded
/// * `Ok(None)` - No default config directory, or the template could not be written
/// * `Err(e)` - A custom path does not exist, or the file is invalid
///
/// When `path` is `None` and nothing exists at the default path, a commented
/// template is written there first.
pub fn load_pipeline_config(path: Option<PathBuf>) -> Result<Option<PipelineConfigFile>, AppError> {
    let using_default_path = path.is_none();
    let config_path = match path {
        Some(p) => p,
        None => match default_config_path() {
            Some(p) => p,
            None => return Ok(None),
        },
    };

    if !config_path.exists() {
        if !using_default_path {
            return Err(AppError::ConfigError(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }
        if let Err(e) = create_default_config(&config_path) {
            tracing::warn!("Could not create default config template: {}", e);
            return Ok(None);
        }
    }

    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        AppError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    let file: PipelineConfigFile = toml::from_str(&content).map_err(|e| {
        AppError::ConfigError(format!(
            "Invalid TOML in '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    Ok(Some(file))
}

fn create_default_config(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    tracing::info!("Created default config template at: {}", path.display());

    Ok(())
}
