//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

/// Smallest RSA modulus the engine will generate.
pub const MIN_KEY_BITS: usize = 2048;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub actor: ActorConfig,
    pub federation: FederationConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    pub content: ContentConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "example.social")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://example.social"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Local actor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    /// Preferred username of the single local actor (default: "test")
    #[serde(default = "default_actor_username")]
    pub username: String,
    /// RSA modulus size for the actor keypair (default: 2048)
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
    /// Generate the actor during startup instead of waiting for the
    /// provisioning endpoint
    #[serde(default)]
    pub provision_on_startup: bool,
    /// PKCS#8 PEM file holding a key exported with `GET /admin/actor/key`.
    /// When set the actor is restored from it at startup instead of being
    /// generated.
    #[serde(default)]
    pub private_key_path: Option<String>,
}

fn default_actor_username() -> String {
    "test".to_string()
}

fn default_key_bits() -> usize {
    MIN_KEY_BITS
}

/// Federation tuning
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Per-call timeout for outbound fetches and deliveries
    pub request_timeout_seconds: u64,
    /// Delivery attempts before giving up on a transport failure
    pub delivery_max_attempts: u32,
    /// First retry delay; doubles on each further attempt
    pub delivery_backoff_base_ms: u64,
    /// Accepted distance between a signature's Date header and now
    pub clock_skew_seconds: i64,
    /// How long a resolved remote actor stays cached
    pub actor_cache_ttl_seconds: u64,
    /// Maximum number of cached remote actors
    pub actor_cache_capacity: u64,
    /// How long an accepted activity id is remembered for deduplication
    pub dedupe_ttl_seconds: u64,
    /// Maximum number of remembered activity ids
    pub dedupe_capacity: u64,
    /// Allow fetching from and delivering to loopback/private hosts
    #[serde(default)]
    pub allow_private_hosts: bool,
    /// Note sent to every new follower after the Accept
    pub welcome_note: Option<String>,
    /// User-Agent for outbound requests
    pub user_agent: String,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.delivery_backoff_base_ms)
    }

    pub fn clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.clock_skew_seconds)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 10,
            delivery_max_attempts: 3,
            delivery_backoff_base_ms: 1000,
            clock_skew_seconds: 1800,
            actor_cache_ttl_seconds: 3600,
            actor_cache_capacity: 10_000,
            dedupe_ttl_seconds: 86_400,
            dedupe_capacity: 10_000,
            allow_private_hosts: false,
            welcome_note: None,
            user_agent: format!("Courier/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Operator access configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdminConfig {
    /// Bearer token for the provisioning endpoint.
    ///
    /// When unset the endpoint is disabled.
    pub provision_token: Option<String>,
}

/// Received content store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ContentConfig {
    /// Maximum number of received objects kept in memory (default: 2000)
    pub max_items: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (COURIER__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let defaults = FederationConfig::default();
        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost")?
            .set_default("server.protocol", "http")?
            .set_default("actor.username", default_actor_username())?
            .set_default("actor.key_bits", MIN_KEY_BITS as u64)?
            .set_default("actor.provision_on_startup", false)?
            .set_default(
                "federation.request_timeout_seconds",
                defaults.request_timeout_seconds,
            )?
            .set_default(
                "federation.delivery_max_attempts",
                defaults.delivery_max_attempts,
            )?
            .set_default(
                "federation.delivery_backoff_base_ms",
                defaults.delivery_backoff_base_ms,
            )?
            .set_default("federation.clock_skew_seconds", defaults.clock_skew_seconds)?
            .set_default(
                "federation.actor_cache_ttl_seconds",
                defaults.actor_cache_ttl_seconds,
            )?
            .set_default(
                "federation.actor_cache_capacity",
                defaults.actor_cache_capacity,
            )?
            .set_default("federation.dedupe_ttl_seconds", defaults.dedupe_ttl_seconds)?
            .set_default("federation.dedupe_capacity", defaults.dedupe_capacity)?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("federation.user_agent", defaults.user_agent)?
            .set_default("content.max_items", 2000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (COURIER__*)
            .add_source(
                Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.actor.username.trim().is_empty() {
            return Err(AppError::Config(
                "actor.username must not be empty".to_string(),
            ));
        }

        if self.actor.key_bits < MIN_KEY_BITS {
            return Err(AppError::Config(format!(
                "actor.key_bits must be at least {}",
                MIN_KEY_BITS
            )));
        }

        if self.federation.delivery_max_attempts == 0 {
            return Err(AppError::Config(
                "federation.delivery_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.federation.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "federation.request_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.federation.clock_skew_seconds <= 0 {
            return Err(AppError::Config(
                "federation.clock_skew_seconds must be greater than 0".to_string(),
            ));
        }

        if self
            .admin
            .provision_token
            .as_deref()
            .is_some_and(|token| token.trim().is_empty())
        {
            return Err(AppError::Config(
                "admin.provision_token must not be empty when set".to_string(),
            ));
        }

        if !self.server.protocol.eq_ignore_ascii_case("https") {
            if is_local_server_domain(&self.server.domain) {
                let host = normalized_server_host(&self.server.domain);
                tracing::warn!(
                    host = %host,
                    protocol = %self.server.protocol,
                    "Serving federation over plain http for local development"
                );
            } else {
                return Err(AppError::Config(
                    "server.protocol must be https for non-local server domains".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
