use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::services::attack_patterns::AttackCategory;

/// Environment keys that accept comma-separated lists, e.g.
/// `APP_JWT__PUBLIC_PATHS=/health,/auth/refresh`.
const LIST_KEYS: &[&str] = &[
    "jwt.public_paths",
    "jwt.public_path_prefixes",
    "rate_limit.exempt_paths",
];

/// Upper bounds keeping TTLs well inside what `chrono::Duration` can hold.
const MAX_ACCESS_TOKEN_EXPIRY_MINUTES: i64 = 60 * 24 * 30;
const MAX_REFRESH_TOKEN_EXPIRY_DAYS: i64 = 365 * 5;
const MAX_AUTO_ROTATE_DAYS: i64 = 365 * 10;

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    pub encryption: EncryptionConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Upper bound for every store round-trip before the caller applies its
    /// failure policy.
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// Shared secret for the HS* family.
    #[serde(default)]
    pub secret: Option<Secret<String>>,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// PEM files for RS256. Without a private key the service only verifies.
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub public_key_path: Option<String>,
    /// `kid` header stamped on issued tokens.
    #[serde(default)]
    pub key_id: Option<String>,
    /// When set, RS256 verification keys come from this JWKS document
    /// instead of `public_key_path`.
    #[serde(default)]
    pub jwks_url: Option<String>,
    #[serde(default = "default_jwks_cache_ttl_seconds")]
    pub jwks_cache_ttl_seconds: u64,
    /// Required `iss`/`aud` values; unchecked when absent.
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default = "default_access_token_expiry_minutes")]
    pub access_token_expiry_minutes: i64,
    #[serde(default = "default_refresh_token_expiry_days")]
    pub refresh_token_expiry_days: i64,
    /// Query parameter consulted when no `Authorization` header is present.
    #[serde(default)]
    pub token_query_param: Option<String>,
    /// Cookie consulted after the query parameter.
    #[serde(default)]
    pub token_cookie_name: Option<String>,
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
    #[serde(default = "default_public_path_prefixes")]
    pub public_path_prefixes: Vec<String>,
    /// Path prefix to the roles a bearer must hold, all of them. The
    /// longest matching prefix applies.
    #[serde(default)]
    pub required_roles: HashMap<String, Vec<String>>,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: None,
            algorithm: default_algorithm(),
            private_key_path: None,
            public_key_path: None,
            key_id: None,
            jwks_url: None,
            jwks_cache_ttl_seconds: default_jwks_cache_ttl_seconds(),
            issuer: None,
            audience: None,
            access_token_expiry_minutes: default_access_token_expiry_minutes(),
            refresh_token_expiry_days: default_refresh_token_expiry_days(),
            token_query_param: None,
            token_cookie_name: None,
            public_paths: default_public_paths(),
            public_path_prefixes: default_public_path_prefixes(),
            required_roles: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct LimitSpec {
    pub requests: u32,
    pub period_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate_limit_requests")]
    pub requests: u32,
    #[serde(default = "default_rate_limit_period")]
    pub period_seconds: u64,
    /// Exact path overrides.
    #[serde(default)]
    pub path_limits: HashMap<String, LimitSpec>,
    /// Path prefix overrides; the longest matching prefix applies.
    #[serde(default)]
    pub prefix_limits: HashMap<String, LimitSpec>,
    /// Per HTTP method overrides, keyed by upper-case method name.
    #[serde(default)]
    pub method_limits: HashMap<String, LimitSpec>,
    #[serde(default = "default_rate_limit_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests: default_rate_limit_requests(),
            period_seconds: default_rate_limit_period(),
            path_limits: HashMap::new(),
            prefix_limits: HashMap::new(),
            method_limits: HashMap::new(),
            exempt_paths: default_rate_limit_exempt_paths(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationMode {
    /// Reject offending requests.
    #[default]
    Block,
    /// Log violations and let the request through.
    #[serde(alias = "log_only")]
    LogOnly,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub mode: ValidationMode,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_max_url_length")]
    pub max_url_length: usize,
    /// Replaces the built-in rule set when present.
    #[serde(default)]
    pub rules: Option<Vec<RuleConfig>>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            mode: ValidationMode::default(),
            max_body_size: default_max_body_size(),
            max_url_length: default_max_url_length(),
            rules: None,
        }
    }
}

/// One configured validation rule. Omitted filters mean "applies everywhere";
/// omitted `patterns` means the built-in patterns for `category`.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub category: AttackCategory,
    #[serde(default)]
    pub patterns: Option<Vec<String>>,
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    #[serde(default)]
    pub path_prefixes: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    #[serde(default)]
    pub content_types: Option<Vec<String>>,
    #[serde(default)]
    pub field_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    pub master_key: Secret<String>,
    #[serde(default = "default_key_store_path")]
    pub key_store_path: String,
    #[serde(default = "default_auto_rotate_days")]
    pub auto_rotate_days: i64,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    pub api_key: Secret<String>,
}

impl SecurityConfig {
    /// Load `config/base.*` (if any) overlaid with `APP_*` environment
    /// variables, then validate.
    pub fn load() -> Result<Self, AppError> {
        let config_dir = config_directory()?;
        let config: SecurityConfig = service_core::config::load(Some(&config_dir), LIST_KEYS)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.server.port == 0 {
            return Err(config_error("server.port must be greater than 0"));
        }

        if self.redis.timeout_ms == 0 {
            return Err(config_error("redis.timeout_ms must be greater than 0"));
        }

        if !(1..=MAX_ACCESS_TOKEN_EXPIRY_MINUTES).contains(&self.jwt.access_token_expiry_minutes) {
            return Err(config_error(&format!(
                "jwt.access_token_expiry_minutes must be between 1 and {}",
                MAX_ACCESS_TOKEN_EXPIRY_MINUTES
            )));
        }

        if !(1..=MAX_REFRESH_TOKEN_EXPIRY_DAYS).contains(&self.jwt.refresh_token_expiry_days) {
            return Err(config_error(&format!(
                "jwt.refresh_token_expiry_days must be between 1 and {}",
                MAX_REFRESH_TOKEN_EXPIRY_DAYS
            )));
        }

        match self.jwt.algorithm.to_uppercase().as_str() {
            "HS256" | "HS384" | "HS512" => {
                let secret_len = self
                    .jwt
                    .secret
                    .as_ref()
                    .map(|s| s.expose_secret().len())
                    .unwrap_or(0);
                if secret_len == 0 {
                    return Err(config_error("jwt.secret is required for HMAC algorithms"));
                }
                if self.environment == Environment::Prod && secret_len < 32 {
                    return Err(config_error(
                        "jwt.secret must be at least 32 bytes in production",
                    ));
                }
            }
            "RS256" => {
                if self.jwt.public_key_path.is_none() && self.jwt.jwks_url.is_none() {
                    return Err(config_error(
                        "jwt.public_key_path or jwt.jwks_url is required for RS256",
                    ));
                }
                if self.jwt.jwks_cache_ttl_seconds == 0 {
                    return Err(config_error(
                        "jwt.jwks_cache_ttl_seconds must be greater than 0",
                    ));
                }
            }
            other => {
                return Err(config_error(&format!("Unsupported jwt.algorithm: {}", other)));
            }
        }

        if self.jwt.jwks_url.is_some() && !self.jwt.algorithm.eq_ignore_ascii_case("RS256") {
            return Err(config_error("jwt.jwks_url requires the RS256 algorithm"));
        }

        for (prefix, roles) in &self.jwt.required_roles {
            if !prefix.starts_with('/') {
                return Err(config_error(&format!(
                    "jwt.required_roles key {} must start with '/'",
                    prefix
                )));
            }
            if roles.is_empty() || !roles.iter().all(|role| is_role_token(role)) {
                return Err(config_error(&format!(
                    "jwt.required_roles.{} needs at least one role of visible ASCII without quotes",
                    prefix
                )));
            }
        }

        validate_limit("rate_limit", self.rate_limit.requests, self.rate_limit.period_seconds)?;
        for (scope, limits) in [
            ("rate_limit.path_limits", &self.rate_limit.path_limits),
            ("rate_limit.prefix_limits", &self.rate_limit.prefix_limits),
            ("rate_limit.method_limits", &self.rate_limit.method_limits),
        ] {
            for (key, spec) in limits {
                validate_limit(&format!("{}.{}", scope, key), spec.requests, spec.period_seconds)?;
            }
        }

        if self.validation.max_body_size == 0 {
            return Err(config_error("validation.max_body_size must be greater than 0"));
        }

        if self.validation.max_url_length == 0 {
            return Err(config_error("validation.max_url_length must be greater than 0"));
        }

        let master_len = self.encryption.master_key.expose_secret().len();
        if master_len == 0 {
            return Err(config_error("encryption.master_key must not be empty"));
        }

        if !(1..=MAX_AUTO_ROTATE_DAYS).contains(&self.encryption.auto_rotate_days) {
            return Err(config_error(&format!(
                "encryption.auto_rotate_days must be between 1 and {}",
                MAX_AUTO_ROTATE_DAYS
            )));
        }

        if self.encryption.kdf_iterations == 0 {
            return Err(config_error("encryption.kdf_iterations must be greater than 0"));
        }

        if self.admin.api_key.expose_secret().is_empty() {
            return Err(config_error("admin.api_key must not be empty"));
        }

        if self.environment == Environment::Prod {
            if master_len < 32 {
                return Err(config_error(
                    "encryption.master_key must be at least 32 bytes in production",
                ));
            }
            if self.encryption.kdf_iterations < default_kdf_iterations() {
                return Err(config_error(
                    "encryption.kdf_iterations is below the production minimum",
                ));
            }
            if self.validation.mode == ValidationMode::LogOnly {
                tracing::warn!("Input validation is running in log-only mode in production");
            }
        }

        Ok(())
    }
}

fn validate_limit(scope: &str, requests: u32, period_seconds: u64) -> Result<(), AppError> {
    if requests == 0 || period_seconds == 0 {
        return Err(config_error(&format!(
            "{} requires positive requests and period_seconds",
            scope
        )));
    }
    Ok(())
}

// Roles end up inside a quoted `WWW-Authenticate` parameter.
fn is_role_token(role: &str) -> bool {
    !role.is_empty()
        && role
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b'"' && b != b'\\')
}

fn config_error(msg: &str) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(msg.to_string()))
}

fn config_directory() -> Result<PathBuf, AppError> {
    let base_path = std::env::current_dir()?;

    if base_path.ends_with("security-service") {
        Ok(base_path.join("config"))
    } else {
        Ok(base_path.join("security-service").join("config"))
    }
}

fn default_service_name() -> String {
    "security-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

fn default_access_token_expiry_minutes() -> i64 {
    30
}

fn default_refresh_token_expiry_days() -> i64 {
    7
}

fn default_jwks_cache_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_public_paths() -> Vec<String> {
    ["/health", "/metrics", "/auth/refresh"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

// Admin routes carry their own API-key check instead of a bearer token.
fn default_public_path_prefixes() -> Vec<String> {
    ["/static/", "/assets/", "/admin/"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_requests() -> u32 {
    100
}

fn default_rate_limit_period() -> u64 {
    60
}

fn default_rate_limit_exempt_paths() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

fn default_max_url_length() -> usize {
    2048
}

fn default_key_store_path() -> String {
    "encryption_keys.json".to_string()
}

fn default_auto_rotate_days() -> i64 {
    90
}

fn default_kdf_iterations() -> u32 {
    100_000
}
