use anyhow::Result;
use std::str::FromStr;

// ============================================================================
// Configuration Constants
// ============================================================================

// Default port values
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HEALTH_PORT: u16 = 8081;

// Session policy defaults
const DEFAULT_MAX_SESSIONS_PER_PRINCIPAL: usize = 5;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

// Retry policy defaults
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 1000;
const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 10_000;

// Broker defaults
const DEFAULT_MESSAGE_TTL_MS: u64 = 24 * 60 * 60 * 1000;
const DEFAULT_PREFETCH_COUNT: u32 = 250;
const DEFAULT_CONCURRENT_CONSUMERS: usize = 3;
const DEFAULT_MAX_CONCURRENT_CONSUMERS: usize = 10;

// Payload validation defaults
const DEFAULT_MAX_MESSAGE_LEN: usize = 1000;

// ============================================================================
// Configuration Structures
// ============================================================================

/// JWT verification settings for CONNECT frames
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// HS256 signing/verification secret (min 32 bytes)
    pub jwt_secret: String,
    /// Optional RS256 public key PEM (verify-only mode for RS256 tokens)
    pub jwt_public_key: Option<String>,
    pub jwt_issuer: String,
    /// TTL for tokens created by this process (hours)
    pub access_token_ttl_hours: i64,
}

/// Session registry policy
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Concurrent sessions allowed per principal before the oldest is evicted
    pub max_sessions_per_principal: usize,
    /// Idle time after which a session is closed by the sweep task
    pub idle_timeout_secs: u64,
    /// How often the sweep task runs
    pub sweep_interval_secs: u64,
}

/// Consumer retry/backoff policy
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Retries after the initial attempt before a message is dead-lettered
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
    /// Error classes dead-lettered without any retry
    pub fatal_classes: Vec<String>,
}

/// Dead-letter destination
#[derive(Clone, Debug)]
pub struct DeadLetterConfig {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// Broker topology and consumer pool settings
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Topic exchange all client sends go through
    pub exchange: String,
    /// Broadcast queue, bound with `general_pattern`
    pub general_queue: String,
    /// Per-user queue, bound with `private_pattern`
    pub private_queue: String,
    pub general_pattern: String,
    pub private_pattern: String,
    pub dead_letter: DeadLetterConfig,
    /// Queue-level TTL; untouched messages route to the dead-letter exchange
    pub message_ttl_ms: u64,
    /// Unacked deliveries a single consumer may hold
    pub prefetch_count: u32,
    pub concurrent_consumers: usize,
    pub max_concurrent_consumers: usize,
}

/// SEND payload validation rules
#[derive(Clone, Debug)]
pub struct ValidationConfig {
    pub max_message_len: usize,
    /// Case-insensitive substrings rejected outright
    pub denied_patterns: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub health_port: u16,
    pub rust_log: String,
    /// Key material for payload encryption (falls back to the JWT secret)
    pub message_secret: String,
    pub auth: AuthConfig,
    pub session: SessionConfig,
    pub retry: RetryConfig,
    pub broker: BrokerConfig,
    pub validation: ValidationConfig,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_else(|_| default.iter().map(|s| s.to_string()).collect())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let jwt_secret = std::env::var("JWT_SECRET")?;
        if jwt_secret.len() < 32 {
            anyhow::bail!(
                "JWT_SECRET must be at least 32 characters long. \
                Generate one with: openssl rand -base64 32"
            );
        }

        let max_consumers = env_parse(
            "BROKER_MAX_CONCURRENT_CONSUMERS",
            DEFAULT_MAX_CONCURRENT_CONSUMERS,
        );
        let consumers = env_parse("BROKER_CONCURRENT_CONSUMERS", DEFAULT_CONCURRENT_CONSUMERS)
            .min(max_consumers);

        Ok(Self {
            port: env_parse("PORT", DEFAULT_PORT),
            health_port: env_parse("HEALTH_PORT", DEFAULT_HEALTH_PORT),
            rust_log: env_or("RUST_LOG", "info"),
            message_secret: env_or("MESSAGE_SECRET", &jwt_secret),
            auth: AuthConfig {
                jwt_secret,
                jwt_public_key: std::env::var("JWT_PUBLIC_KEY").ok(),
                jwt_issuer: env_or("JWT_ISSUER", "relay-gateway"),
                access_token_ttl_hours: env_parse("ACCESS_TOKEN_TTL_HOURS", 12),
            },
            session: SessionConfig {
                max_sessions_per_principal: env_parse(
                    "MAX_SESSIONS_PER_PRINCIPAL",
                    DEFAULT_MAX_SESSIONS_PER_PRINCIPAL,
                ),
                idle_timeout_secs: env_parse(
                    "SESSION_IDLE_TIMEOUT_SECS",
                    DEFAULT_IDLE_TIMEOUT_SECS,
                ),
                sweep_interval_secs: env_parse(
                    "SESSION_SWEEP_INTERVAL_SECS",
                    DEFAULT_SWEEP_INTERVAL_SECS,
                ),
            },
            retry: RetryConfig {
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS),
                initial_backoff_ms: env_parse(
                    "RETRY_INITIAL_BACKOFF_MS",
                    DEFAULT_RETRY_INITIAL_BACKOFF_MS,
                ),
                multiplier: env_parse("RETRY_MULTIPLIER", DEFAULT_RETRY_MULTIPLIER),
                max_backoff_ms: env_parse("RETRY_MAX_BACKOFF_MS", DEFAULT_RETRY_MAX_BACKOFF_MS),
                fatal_classes: env_list(
                    "FATAL_ERROR_CLASSES",
                    &["deserialization", "invalid-argument", "unsupported-operation"],
                ),
            },
            broker: BrokerConfig {
                exchange: env_or("BROKER_EXCHANGE", "chat.topic"),
                general_queue: env_or("BROKER_GENERAL_QUEUE", "chat.general"),
                private_queue: env_or("BROKER_PRIVATE_QUEUE", "chat.private"),
                general_pattern: env_or("BROKER_GENERAL_PATTERN", "room.*"),
                private_pattern: env_or("BROKER_PRIVATE_PATTERN", "user.#"),
                dead_letter: DeadLetterConfig {
                    exchange: env_or("BROKER_DLX_EXCHANGE", "chat.dlx"),
                    queue: env_or("BROKER_DLX_QUEUE", "chat.dead"),
                    routing_key: env_or("BROKER_DLX_ROUTING_KEY", "chat.dead"),
                },
                message_ttl_ms: env_parse("BROKER_MESSAGE_TTL_MS", DEFAULT_MESSAGE_TTL_MS),
                prefetch_count: env_parse("BROKER_PREFETCH_COUNT", DEFAULT_PREFETCH_COUNT),
                concurrent_consumers: consumers,
                max_concurrent_consumers: max_consumers,
            },
            validation: ValidationConfig {
                max_message_len: env_parse("MAX_MESSAGE_LEN", DEFAULT_MAX_MESSAGE_LEN),
                denied_patterns: env_list(
                    "DENIED_PAYLOAD_PATTERNS",
                    &["<script", "javascript:", "select", "union", "delete"],
                ),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        assert_eq!(DEFAULT_MAX_SESSIONS_PER_PRINCIPAL, 5);
        assert_eq!(DEFAULT_IDLE_TIMEOUT_SECS, 1800);
        assert_eq!(DEFAULT_SWEEP_INTERVAL_SECS, 60);
        assert_eq!(DEFAULT_RETRY_MAX_ATTEMPTS, 3);
        assert_eq!(DEFAULT_RETRY_INITIAL_BACKOFF_MS, 1000);
        assert_eq!(DEFAULT_RETRY_MAX_BACKOFF_MS, 10_000);
        assert_eq!(DEFAULT_PREFETCH_COUNT, 250);
        assert_eq!(DEFAULT_MESSAGE_TTL_MS, 86_400_000);
    }

    #[test]
    fn env_list_splits_and_trims() {
        std::env::set_var("TEST_ENV_LIST_KEY", "a, b ,,c");
        let parsed = env_list("TEST_ENV_LIST_KEY", &[]);
        assert_eq!(parsed, vec!["a", "b", "c"]);
        std::env::remove_var("TEST_ENV_LIST_KEY");
    }
}
