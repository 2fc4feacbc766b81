//! Configuration types, built from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default session timeout: 30 minutes.
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 1800;

/// Challenge session and HTTP surface settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// How long a session stays Listening before it times out.
    pub session_timeout: Duration,
    /// Expected number of digits in a verification code.
    pub code_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            code_length: 6,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let bind = match std::env::var("RELAY_BIND") {
            Ok(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "RELAY_BIND".into(),
                message: format!("{e}"),
            })?,
            Err(_) => defaults.bind,
        };
        let config = Self {
            bind,
            session_timeout: Duration::from_secs(env_parse(
                "RELAY_SESSION_TIMEOUT_SECS",
                DEFAULT_SESSION_TIMEOUT_SECS,
            )?),
            code_length: env_parse("RELAY_CODE_LENGTH", defaults.code_length)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.code_length == 0 {
            return Err(invalid("RELAY_CODE_LENGTH", "must be at least 1"));
        }
        if self.session_timeout.is_zero() {
            return Err(invalid("RELAY_SESSION_TIMEOUT_SECS", "must be at least 1"));
        }
        Ok(())
    }
}

/// Mail matching settings used by the code extractor.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Sender address codes must come from (case-insensitive).
    pub expected_sender: String,
    /// Regex applied to message bodies. Capture group 1 is the code if present.
    pub pattern: String,
    /// Matches that are not exactly this many ASCII digits are discarded.
    pub code_length: usize,
}

impl ExtractionConfig {
    /// Default pattern: a standalone run of exactly `len` ASCII digits.
    ///
    /// `[0-9]` rather than `\d`, which would also match other Unicode digits.
    pub fn digits_pattern(len: usize) -> String {
        format!(r"\b([0-9]{{{len}}})\b")
    }

    pub fn from_env(code_length: usize) -> Result<Self, ConfigError> {
        let expected_sender = std::env::var("RELAY_EXPECTED_SENDER")
            .map_err(|_| ConfigError::MissingEnvVar("RELAY_EXPECTED_SENDER".into()))?;
        let pattern = std::env::var("RELAY_CODE_PATTERN")
            .unwrap_or_else(|_| Self::digits_pattern(code_length));
        Ok(Self {
            expected_sender,
            pattern,
            code_length,
        })
    }
}

/// Relay retry policy and target.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Automation Worker Endpoint receiving `{"verificationId": ...}`.
    pub target_url: String,
    pub max_attempts: u32,
    /// Delay before retry n is `base_delay * n`.
    pub base_delay: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// JSONL file for dead letters. `None` logs them instead.
    pub dead_letter_path: Option<PathBuf>,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let target_url = std::env::var("RELAY_TARGET_URL")
            .map_err(|_| ConfigError::MissingEnvVar("RELAY_TARGET_URL".into()))?;
        let config = Self {
            target_url,
            max_attempts: env_parse("RELAY_MAX_ATTEMPTS", 3)?,
            base_delay: Duration::from_millis(env_parse("RELAY_BASE_DELAY_MS", 2000)?),
            request_timeout: Duration::from_secs(env_parse("RELAY_REQUEST_TIMEOUT_SECS", 30)?),
            dead_letter_path: std::env::var("RELAY_DEAD_LETTER_PATH")
                .ok()
                .map(PathBuf::from),
        };
        if config.max_attempts == 0 {
            return Err(invalid("RELAY_MAX_ATTEMPTS", "must be at least 1"));
        }
        Ok(config)
    }
}

/// Mailbox polling budget for one orchestrated cycle.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Wait before the first poll, covering mail-delivery latency.
    pub initial_wait: Duration,
    /// Fixed delay between polls.
    pub interval: Duration,
    pub max_polls: u32,
    /// Consider every message regardless of age (recovery after a restart).
    pub ignore_window: bool,
    /// Slack subtracted from the trigger time to absorb mail-server clock skew.
    pub since_grace: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_secs(30),
            interval: Duration::from_secs(15),
            max_polls: 10,
            ignore_window: false,
            since_grace: Duration::from_secs(60),
        }
    }
}

impl PollConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            initial_wait: Duration::from_secs(env_parse(
                "RELAY_INITIAL_WAIT_SECS",
                defaults.initial_wait.as_secs(),
            )?),
            interval: Duration::from_secs(env_parse(
                "RELAY_POLL_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            max_polls: env_parse("RELAY_MAX_POLLS", defaults.max_polls)?,
            ignore_window: env_bool("RELAY_IGNORE_WINDOW"),
            since_grace: Duration::from_secs(env_parse(
                "RELAY_SINCE_GRACE_SECS",
                defaults.since_grace.as_secs(),
            )?),
        };
        if config.max_polls == 0 {
            return Err(invalid("RELAY_MAX_POLLS", "must be at least 1"));
        }
        Ok(config)
    }
}

/// Parse an optional env var, falling back to `default` when unset.
///
/// A set-but-unparseable value is an error rather than a silent default.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.session_timeout, Duration::from_secs(30 * 60));
        assert_eq!(config.code_length, 6);
        assert_eq!(config.bind.port(), 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_code_length_is_invalid() {
        let config = ServerConfig {
            code_length: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "RELAY_CODE_LENGTH"
        ));
    }

    #[test]
    fn digits_pattern_uses_length() {
        assert_eq!(ExtractionConfig::digits_pattern(6), r"\b([0-9]{6})\b");
        assert_eq!(ExtractionConfig::digits_pattern(8), r"\b([0-9]{8})\b");
    }

    #[test]
    fn env_parse_rejects_garbage() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("RELAY_TEST_ENV_PARSE_GARBAGE", "three") };
        let result: Result<u32, _> = env_parse("RELAY_TEST_ENV_PARSE_GARBAGE", 3);
        assert!(result.is_err());
        unsafe { std::env::remove_var("RELAY_TEST_ENV_PARSE_GARBAGE") };
    }

    #[test]
    fn env_parse_defaults_when_unset() {
        let value: u32 = env_parse("RELAY_TEST_ENV_PARSE_UNSET", 7).unwrap();
        assert_eq!(value, 7);
    }
}
