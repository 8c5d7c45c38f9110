use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use validator::Validate;

use crate::models::TokenPurpose;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct EngineConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    #[validate(nested)]
    pub token: TokenConfig,
    #[validate(nested)]
    pub lockout: LockoutConfig,
    #[validate(nested)]
    pub rate_limit: RateLimitConfig,
    #[validate(nested)]
    pub anomaly: AnomalyConfig,
    #[validate(nested)]
    pub password: PasswordPolicyConfig,
    #[validate(nested)]
    pub orchestrator: OrchestratorConfig,
    #[validate(nested)]
    pub retry: RetrySettings,
    #[validate(nested)]
    pub maintenance: MaintenanceConfig,
    pub http: HttpConfig,
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

/// HMAC signing secret. Never printed, never serialized.
#[derive(Deserialize)]
#[serde(from = "String")]
pub struct SigningSecret(SecretString);

impl SigningSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(SecretString::new(secret.into()))
    }

    pub fn expose(&self) -> &[u8] {
        self.0.expose_secret().as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for SigningSecret {
    fn from(secret: String) -> Self {
        Self::new(secret)
    }
}

impl Clone for SigningSecret {
    fn clone(&self) -> Self {
        Self::new(self.0.expose_secret().clone())
    }
}

impl std::fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningSecret([REDACTED])")
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TokenConfig {
    pub secret: SigningSecret,
    #[validate(length(min = 1))]
    pub issuer: String,
    #[validate(range(min = 1))]
    pub access_ttl_seconds: i64,
    #[validate(range(min = 1))]
    pub refresh_ttl_seconds: i64,
    #[validate(range(min = 1))]
    pub password_reset_ttl_seconds: i64,
    #[validate(range(min = 1))]
    pub email_verification_ttl_seconds: i64,
    /// How long before expiry a token may be exchanged for a fresh one.
    #[validate(range(min = 1))]
    pub refresh_window_seconds: i64,
}

impl TokenConfig {
    pub fn ttl_for(&self, purpose: TokenPurpose) -> Duration {
        let seconds = match purpose {
            TokenPurpose::Access => self.access_ttl_seconds,
            TokenPurpose::Refresh => self.refresh_ttl_seconds,
            TokenPurpose::PasswordReset => self.password_reset_ttl_seconds,
            TokenPurpose::EmailVerification => self.email_verification_ttl_seconds,
        };
        Duration::seconds(seconds)
    }

    pub fn longest_ttl(&self) -> Duration {
        let longest = [
            self.access_ttl_seconds,
            self.refresh_ttl_seconds,
            self.password_reset_ttl_seconds,
            self.email_verification_ttl_seconds,
        ]
        .into_iter()
        .max()
        .unwrap_or(self.refresh_ttl_seconds);
        Duration::seconds(longest)
    }

    pub fn refresh_window(&self) -> Duration {
        Duration::seconds(self.refresh_window_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LockoutConfig {
    /// Failed attempts inside the window that lock the account.
    #[validate(range(min = 1))]
    pub threshold: u32,
    #[validate(range(min = 1))]
    pub window_seconds: i64,
    #[validate(range(min = 1))]
    pub duration_seconds: i64,
    /// Upper bound on attempts kept per username.
    #[validate(range(min = 1))]
    pub max_tracked_attempts: usize,
    /// Closed lockouts kept per username for audit views.
    pub history_size: usize,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RateLimitConfig {
    #[validate(range(min = 1))]
    pub ip_limit: u32,
    #[validate(range(min = 1))]
    pub ip_window_seconds: u64,
    #[validate(range(min = 1))]
    pub subject_limit: u32,
    #[validate(range(min = 1))]
    pub subject_window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AnomalyConfig {
    #[validate(range(min = 0.0, max = 1.0))]
    pub score_threshold: f64,
    #[validate(range(min = 0))]
    pub learning_period_hours: i64,
    pub min_observations: u64,
    /// Deny requests whose anomaly score crosses the threshold. Off means flag only.
    pub auto_block: bool,
    #[validate(range(min = 0.0))]
    pub network_weight: f64,
    #[validate(range(min = 0.0))]
    pub time_weight: f64,
    #[validate(range(min = 0.0))]
    pub frequency_weight: f64,
    /// Baselines of subjects unseen this long are dropped.
    #[validate(range(min = 1))]
    pub baseline_retention_hours: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PasswordPolicyConfig {
    #[validate(range(min = 1))]
    pub min_length: usize,
    #[validate(range(min = 1))]
    pub max_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_special: bool,
    /// Prior hashes remembered to block reuse.
    pub history_size: usize,
    /// Added to the built-in common password list.
    #[serde(default)]
    pub common_passwords: Vec<String>,
    #[validate(range(min = 8))]
    pub argon_memory_kib: u32,
    #[validate(range(min = 1))]
    pub argon_iterations: u32,
    #[validate(range(min = 1))]
    pub argon_parallelism: u32,
    #[validate(range(min = 16, max = 64))]
    pub argon_output_len: usize,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct OrchestratorConfig {
    /// Budget for the whole per-request pipeline before it fails closed.
    #[validate(range(min = 1))]
    pub check_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RetrySettings {
    #[validate(range(max = 10))]
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: std::time::Duration::from_millis(self.initial_backoff_ms),
            max_backoff: std::time::Duration::from_millis(self.max_backoff_ms),
            ..RetryConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MaintenanceConfig {
    /// Period of the sweep over revocations, counters, lockouts and baselines.
    #[validate(range(min = 1))]
    pub interval_seconds: u64,
}

/// How the HTTP middleware reads its caller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpConfig {
    /// Peers whose forwarding headers are believed: `x-forwarded-for`,
    /// the forward-auth target headers and `x-session-*`. Empty trusts no one.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl HttpConfig {
    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.trusted_proxies.iter().any(|proxy| proxy.to_canonical() == ip)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: SigningSecret::new(""),
            issuer: "security-engine".to_string(),
            access_ttl_seconds: 15 * 60,
            refresh_ttl_seconds: 7 * 24 * 3600,
            password_reset_ttl_seconds: 3600,
            email_verification_ttl_seconds: 24 * 3600,
            refresh_window_seconds: 5 * 60,
        }
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window_seconds: 15 * 60,
            duration_seconds: 15 * 60,
            max_tracked_attempts: 100,
            history_size: 10,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ip_limit: 100,
            ip_window_seconds: 60,
            subject_limit: 30,
            subject_window_seconds: 60,
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.7,
            learning_period_hours: 7 * 24,
            min_observations: 20,
            auto_block: false,
            network_weight: 0.4,
            time_weight: 0.3,
            frequency_weight: 0.3,
            baseline_retention_hours: 30 * 24,
        }
    }
}

impl Default for PasswordPolicyConfig {
    fn default() -> Self {
        Self {
            min_length: 12,
            max_length: 128,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
            require_special: true,
            history_size: 5,
            common_passwords: Vec::new(),
            argon_memory_kib: 19 * 1024,
            argon_iterations: 2,
            argon_parallelism: 1,
            argon_output_len: 32,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            check_timeout_ms: 250,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Development defaults around the given signing secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            token: TokenConfig {
                secret: SigningSecret::new(secret),
                ..TokenConfig::default()
            },
            lockout: LockoutConfig::default(),
            rate_limit: RateLimitConfig::default(),
            anomaly: AnomalyConfig::default(),
            password: PasswordPolicyConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            retry: RetrySettings::default(),
            maintenance: MaintenanceConfig::default(),
            http: HttpConfig::default(),
            redis: None,
        }
    }

    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let password_defaults = PasswordPolicyConfig::default();
        let anomaly_defaults = AnomalyConfig::default();

        let config = EngineConfig {
            common,
            environment,
            token: TokenConfig {
                secret: SigningSecret::new(get_env("TOKEN_SIGNING_SECRET", None)?),
                issuer: get_env("TOKEN_ISSUER", Some("security-engine"))?,
                access_ttl_seconds: parse_env("TOKEN_ACCESS_TTL_SECONDS", 15 * 60)?,
                refresh_ttl_seconds: parse_env("TOKEN_REFRESH_TTL_SECONDS", 7 * 24 * 3600)?,
                password_reset_ttl_seconds: parse_env("TOKEN_PASSWORD_RESET_TTL_SECONDS", 3600)?,
                email_verification_ttl_seconds: parse_env(
                    "TOKEN_EMAIL_VERIFICATION_TTL_SECONDS",
                    24 * 3600,
                )?,
                refresh_window_seconds: parse_env("TOKEN_REFRESH_WINDOW_SECONDS", 5 * 60)?,
            },
            lockout: LockoutConfig {
                threshold: parse_env("LOCKOUT_THRESHOLD", 5)?,
                window_seconds: parse_env("LOCKOUT_WINDOW_SECONDS", 15 * 60)?,
                duration_seconds: parse_env("LOCKOUT_DURATION_SECONDS", 15 * 60)?,
                max_tracked_attempts: parse_env("LOCKOUT_MAX_TRACKED_ATTEMPTS", 100)?,
                history_size: parse_env("LOCKOUT_HISTORY_SIZE", 10)?,
            },
            rate_limit: RateLimitConfig {
                ip_limit: parse_env("RATE_LIMIT_IP_LIMIT", 100)?,
                ip_window_seconds: parse_env("RATE_LIMIT_IP_WINDOW_SECONDS", 60)?,
                subject_limit: parse_env("RATE_LIMIT_SUBJECT_LIMIT", 30)?,
                subject_window_seconds: parse_env("RATE_LIMIT_SUBJECT_WINDOW_SECONDS", 60)?,
            },
            anomaly: AnomalyConfig {
                score_threshold: parse_env(
                    "ANOMALY_SCORE_THRESHOLD",
                    anomaly_defaults.score_threshold,
                )?,
                learning_period_hours: parse_env(
                    "ANOMALY_LEARNING_PERIOD_HOURS",
                    anomaly_defaults.learning_period_hours,
                )?,
                min_observations: parse_env(
                    "ANOMALY_MIN_OBSERVATIONS",
                    anomaly_defaults.min_observations,
                )?,
                auto_block: parse_env("ANOMALY_AUTO_BLOCK", false)?,
                network_weight: parse_env("ANOMALY_NETWORK_WEIGHT", anomaly_defaults.network_weight)?,
                time_weight: parse_env("ANOMALY_TIME_WEIGHT", anomaly_defaults.time_weight)?,
                frequency_weight: parse_env(
                    "ANOMALY_FREQUENCY_WEIGHT",
                    anomaly_defaults.frequency_weight,
                )?,
                baseline_retention_hours: parse_env(
                    "ANOMALY_BASELINE_RETENTION_HOURS",
                    anomaly_defaults.baseline_retention_hours,
                )?,
            },
            password: PasswordPolicyConfig {
                min_length: parse_env("PASSWORD_MIN_LENGTH", password_defaults.min_length)?,
                max_length: parse_env("PASSWORD_MAX_LENGTH", password_defaults.max_length)?,
                require_uppercase: parse_env("PASSWORD_REQUIRE_UPPERCASE", true)?,
                require_lowercase: parse_env("PASSWORD_REQUIRE_LOWERCASE", true)?,
                require_digit: parse_env("PASSWORD_REQUIRE_DIGIT", true)?,
                require_special: parse_env("PASSWORD_REQUIRE_SPECIAL", true)?,
                history_size: parse_env("PASSWORD_HISTORY_SIZE", password_defaults.history_size)?,
                common_passwords: get_env("PASSWORD_COMMON_LIST", Some(""))?
                    .split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect(),
                argon_memory_kib: parse_env(
                    "PASSWORD_ARGON_MEMORY_KIB",
                    password_defaults.argon_memory_kib,
                )?,
                argon_iterations: parse_env(
                    "PASSWORD_ARGON_ITERATIONS",
                    password_defaults.argon_iterations,
                )?,
                argon_parallelism: parse_env(
                    "PASSWORD_ARGON_PARALLELISM",
                    password_defaults.argon_parallelism,
                )?,
                argon_output_len: parse_env(
                    "PASSWORD_ARGON_OUTPUT_LEN",
                    password_defaults.argon_output_len,
                )?,
            },
            orchestrator: OrchestratorConfig {
                check_timeout_ms: parse_env("SECURITY_CHECK_TIMEOUT_MS", 250)?,
            },
            retry: RetrySettings {
                max_retries: parse_env("STORE_RETRY_MAX_RETRIES", 2)?,
                initial_backoff_ms: parse_env("STORE_RETRY_INITIAL_BACKOFF_MS", 10)?,
                max_backoff_ms: parse_env("STORE_RETRY_MAX_BACKOFF_MS", 100)?,
            },
            maintenance: MaintenanceConfig {
                interval_seconds: parse_env("MAINTENANCE_INTERVAL_SECONDS", 60)?,
            },
            http: HttpConfig {
                trusted_proxies: parse_list("TRUSTED_PROXIES")?,
            },
            redis: env::var("REDIS_URL").ok().map(|url| RedisConfig { url }),
        };

        config.ensure_valid()?;
        Ok(config)
    }

    /// Field ranges plus the cross-field rules a derive cannot express.
    pub fn ensure_valid(&self) -> Result<(), AppError> {
        self.validate()?;

        if self.token.secret.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_SIGNING_SECRET must not be empty"
            )));
        }

        if self.environment == Environment::Prod && self.token.secret.len() < 32 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_SIGNING_SECRET must be at least 32 bytes in production"
            )));
        }

        if self.token.refresh_window_seconds >= self.token.access_ttl_seconds {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_REFRESH_WINDOW_SECONDS must be shorter than the access token TTL"
            )));
        }

        if self.password.min_length > self.password.max_length {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PASSWORD_MIN_LENGTH must not exceed PASSWORD_MAX_LENGTH"
            )));
        }

        if self.rate_limit.subject_limit >= self.rate_limit.ip_limit {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RATE_LIMIT_SUBJECT_LIMIT must be smaller than RATE_LIMIT_IP_LIMIT"
            )));
        }

        let weights =
            self.anomaly.network_weight + self.anomaly.time_weight + self.anomaly.frequency_weight;
        if weights <= 0.0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Anomaly weights must sum to a positive value"
            )));
        }

        if self.environment == Environment::Prod && self.redis.is_none() {
            tracing::warn!(
                "REDIS_URL not set in production - revocations and rate limits stay local to this replica"
            );
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => match default {
            Some(def) => Ok(def.to_string()),
            None => Err(AppError::ConfigError(anyhow::anyhow!(format!(
                "{} is required but not set",
                key
            )))),
        },
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!(format!("{} is invalid: {}", key, e)))
        }),
        Err(_) => Ok(default),
    }
}

/// Comma-separated values; unset or blank is an empty list.
fn parse_list<T>(key: &str) -> Result<Vec<T>, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(""))?
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse().map_err(|e: T::Err| {
                AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} has an invalid entry {:?}: {}",
                    key, item, e
                )))
            })
        })
        .collect()
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
