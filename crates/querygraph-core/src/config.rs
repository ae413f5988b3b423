use crate::ConnectionDetails;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration for QueryGraph
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct QueryGraphConfig {
    /// LLM used for mapping extraction
    #[serde(default)]
    pub llm: LLMConfig,

    /// Query engine connection defaults
    #[serde(default)]
    pub engine: EngineConfig,

    /// Pipeline timeouts and assembly options
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// LLM configuration for mapping extraction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LLMConfig {
    /// LLM provider: "anthropic", "openai", "openai-compatible"
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// Model identifier, provider default when unset
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub anthropic_api_key: Option<String>,

    #[serde(default)]
    pub openai_api_key: Option<String>,

    /// Base URL for OpenAI and OpenAI-compatible endpoints
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            anthropic_api_key: None,
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// Default engine connection. Values passed with a request take precedence.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub server_hostname: Option<String>,

    #[serde(default)]
    pub http_path: Option<String>,

    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    pub catalog: Option<String>,

    #[serde(default)]
    pub database: Option<String>,

    /// HTTP timeout for a single statement request
    #[serde(default = "default_engine_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_hostname: None,
            http_path: None,
            access_token: None,
            catalog: None,
            database: None,
            request_timeout_secs: default_engine_request_timeout_secs(),
        }
    }
}

impl EngineConfig {
    pub fn to_connection_details(&self) -> ConnectionDetails {
        ConnectionDetails {
            server_hostname: self.server_hostname.clone(),
            http_path: self.http_path.clone(),
            access_token: self.access_token.clone(),
            catalog: self.catalog.clone(),
            database: self.database.clone(),
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("server_hostname", &self.server_hostname)
            .field("http_path", &self.http_path)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<redacted>"),
            )
            .field("catalog", &self.catalog)
            .field("database", &self.database)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Timeout for each entity and join smoke query
    #[serde(default = "default_fragment_timeout_secs")]
    pub fragment_timeout_secs: u64,

    /// Timeout for the assembled query smoke test
    #[serde(default = "default_final_timeout_secs")]
    pub final_timeout_secs: u64,

    /// Emit a `WITH <name>_cte AS (...)` entry per surviving entity
    #[serde(default)]
    pub use_cte_preamble: bool,

    /// Capacity of the progress event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fragment_timeout_secs: default_fragment_timeout_secs(),
            final_timeout_secs: default_final_timeout_secs(),
            use_cte_preamble: false,
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive, e.g. "info" or "querygraph=debug"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_llm_provider() -> String {
    "anthropic".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> usize {
    2000
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}
fn default_engine_request_timeout_secs() -> u64 {
    60
}
fn default_fragment_timeout_secs() -> u64 {
    10
}
fn default_final_timeout_secs() -> u64 {
    15
}
fn default_event_buffer() -> usize {
    64
}
fn default_session_ttl_secs() -> u64 {
    3600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

const LLM_PROVIDERS: &[&str] = &["anthropic", "openai", "openai-compatible"];
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["pretty", "json", "compact"];

/// Configuration manager with layered sources
pub struct ConfigManager {
    config: QueryGraphConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (.env file)
    /// 2. Config file (.querygraph.toml)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        info!("🔧 Loading QueryGraph configuration...");

        Self::load_dotenv();

        let (config, config_path) = Self::load_config_file()?;
        let config = Self::apply_env_overrides(config);
        Self::validate_config(&config)?;

        info!("✅ Configuration loaded successfully");
        if let Some(ref path) = config_path {
            info!("   📄 Config file: {}", path.display());
        } else {
            info!("   📄 Config file: NONE (using defaults)");
        }
        info!("   🤖 LLM provider: {}", config.llm.provider);
        info!("   🔧 LLM model: {:?}", config.llm.model);
        info!(
            "   🗄️  Engine host: {}",
            config
                .engine
                .server_hostname
                .as_deref()
                .unwrap_or("<per request>")
        );
        info!(
            "   ⏱️  Timeouts: fragment {}s, final {}s",
            config.orchestrator.fragment_timeout_secs, config.orchestrator.final_timeout_secs
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Load an explicit config file, then apply environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::load_dotenv();
        let config = Self::apply_env_overrides(Self::read_toml_file(path)?);
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Wrap an already built configuration after validating it.
    pub fn from_config(config: QueryGraphConfig) -> Result<Self, ConfigError> {
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: None,
        })
    }

    fn load_dotenv() {
        if Path::new(".env").exists() {
            if let Err(e) = dotenv::from_filename(".env") {
                warn!("Failed to load .env file: {}", e);
            } else {
                info!("📋 Loaded .env file from current directory");
            }
            return;
        }

        if let Some(home) = dirs::home_dir() {
            let home_env = home.join(".querygraph.env");
            if home_env.exists() {
                if let Err(e) = dotenv::from_path(&home_env) {
                    warn!("Failed to load .querygraph.env: {}", e);
                } else {
                    info!("📋 Loaded .querygraph.env from home directory");
                }
            }
        }
    }

    /// Search order:
    /// 1. ./.querygraph.toml
    /// 2. ~/.querygraph/config.toml
    /// 3. defaults
    fn load_config_file() -> Result<(QueryGraphConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".querygraph.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(user_config) = Self::user_config_path() {
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        info!("📋 No config file found, using defaults");
        Ok((QueryGraphConfig::default(), None))
    }

    /// `~/.querygraph/config.toml`
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".querygraph").join("config.toml"))
    }

    pub fn read_toml_file(path: &Path) -> Result<QueryGraphConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: QueryGraphConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Ok(config)
    }

    pub fn apply_env_overrides(config: QueryGraphConfig) -> QueryGraphConfig {
        Self::apply_overrides(config, |key| std::env::var(key).ok())
    }

    /// Apply overrides from any variable source. Unparseable numbers are ignored.
    pub fn apply_overrides<F>(mut config: QueryGraphConfig, var: F) -> QueryGraphConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        // LLM
        if let Some(provider) = var("QUERYGRAPH_LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Some(model) = var("QUERYGRAPH_MODEL") {
            config.llm.model = Some(model);
        }
        if let Some(key) = var("ANTHROPIC_API_KEY") {
            config.llm.anthropic_api_key = Some(key);
        }
        if let Some(key) = var("OPENAI_API_KEY") {
            config.llm.openai_api_key = Some(key);
        }
        if let Some(url) = var("QUERYGRAPH_OPENAI_BASE_URL") {
            config.llm.openai_base_url = url;
        }

        // Engine
        if let Some(host) = var("DATABRICKS_SERVER_HOSTNAME") {
            config.engine.server_hostname = Some(host);
        }
        if let Some(path) = var("DATABRICKS_HTTP_PATH") {
            config.engine.http_path = Some(path);
        }
        if let Some(token) = var("DATABRICKS_TOKEN") {
            config.engine.access_token = Some(token);
        }

        // Orchestrator
        if let Some(secs) = var("QUERYGRAPH_FRAGMENT_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                config.orchestrator.fragment_timeout_secs = secs;
            }
        }
        if let Some(secs) = var("QUERYGRAPH_FINAL_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                config.orchestrator.final_timeout_secs = secs;
            }
        }
        if let Some(flag) = var("QUERYGRAPH_USE_CTE_PREAMBLE") {
            config.orchestrator.use_cte_preamble = flag.to_lowercase() == "true" || flag == "1";
        }

        // Logging
        if let Some(level) = var("RUST_LOG") {
            config.logging.level = level;
        }

        config
    }

    pub fn validate_config(config: &QueryGraphConfig) -> Result<(), ConfigError> {
        if !LLM_PROVIDERS.contains(&config.llm.provider.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid LLM provider: {}. Must be one of: {}",
                config.llm.provider,
                LLM_PROVIDERS.join(", ")
            )));
        }

        let orchestrator = &config.orchestrator;
        if orchestrator.fragment_timeout_secs == 0 || orchestrator.final_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Timeouts must be greater than zero".to_string(),
            ));
        }
        if orchestrator.final_timeout_secs < orchestrator.fragment_timeout_secs {
            return Err(ConfigError::ValidationError(format!(
                "Final timeout ({}s) must not be shorter than the fragment timeout ({}s)",
                orchestrator.final_timeout_secs, orchestrator.fragment_timeout_secs
            )));
        }
        if orchestrator.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "Event buffer must hold at least one event".to_string(),
            ));
        }

        // Directives such as "querygraph=debug,info" are passed through to the filter
        let level = config.logging.level.as_str();
        if !level.contains('=') && !level.contains(',') && !LOG_LEVELS.contains(&level) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {}",
                level,
                LOG_LEVELS.join(", ")
            )));
        }
        if !LOG_FORMATS.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log format: {}. Must be one of: {}",
                config.logging.format,
                LOG_FORMATS.join(", ")
            )));
        }

        Ok(())
    }

    pub fn config(&self) -> &QueryGraphConfig {
        &self.config
    }

    pub fn into_config(self) -> QueryGraphConfig {
        self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Create a default config file
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = QueryGraphConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}
