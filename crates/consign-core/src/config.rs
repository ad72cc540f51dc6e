//! Workflow configuration.
//!
//! All thresholds that gate the signing workflow live here so that
//! deployments can tune dwell time, code TTLs, and attempt caps from a
//! TOML file without recompiling.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading or validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the TOML content.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field value is out of its permitted range.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Read-gate thresholds ("had the opportunity to read").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadGateConfig {
    /// Scroll coverage (percent) that alone satisfies the read gate.
    #[serde(default = "default_scroll_threshold")]
    pub scroll_threshold_percent: u8,

    /// Viewing time (seconds) that alone satisfies the read gate.
    #[serde(default = "default_min_dwell")]
    pub min_dwell_seconds: u32,
}

fn default_scroll_threshold() -> u8 {
    90
}

fn default_min_dwell() -> u32 {
    30
}

impl Default for ReadGateConfig {
    fn default() -> Self {
        Self {
            scroll_threshold_percent: default_scroll_threshold(),
            min_dwell_seconds: default_min_dwell(),
        }
    }
}

/// Password re-verification limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverifyPolicy {
    /// Consecutive failures permitted before attempts are refused.
    #[serde(default = "default_failure_cap")]
    pub failure_cap: u32,

    /// Initial cooldown window in seconds; doubles per excess failure.
    #[serde(default = "default_cooldown_base")]
    pub cooldown_base_seconds: i64,

    /// Upper bound on the cooldown window in seconds.
    #[serde(default = "default_cooldown_max")]
    pub cooldown_max_seconds: i64,
}

fn default_failure_cap() -> u32 {
    5
}

fn default_cooldown_base() -> i64 {
    60
}

fn default_cooldown_max() -> i64 {
    3600
}

impl Default for ReverifyPolicy {
    fn default() -> Self {
        Self {
            failure_cap: default_failure_cap(),
            cooldown_base_seconds: default_cooldown_base(),
            cooldown_max_seconds: default_cooldown_max(),
        }
    }
}

/// One-time code issuance and verification limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpPolicy {
    /// Number of digits in a generated code.
    #[serde(default = "default_code_length")]
    pub code_length: usize,

    /// Challenge time-to-live in seconds.
    #[serde(default = "default_otp_ttl")]
    pub ttl_seconds: i64,

    /// Verification attempts permitted per challenge.
    #[serde(default = "default_otp_attempt_cap")]
    pub attempt_cap: u32,
}

fn default_code_length() -> usize {
    6
}

fn default_otp_ttl() -> i64 {
    300
}

fn default_otp_attempt_cap() -> u32 {
    5
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            code_length: default_code_length(),
            ttl_seconds: default_otp_ttl(),
            attempt_cap: default_otp_attempt_cap(),
        }
    }
}

/// Consent-phrase gate settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhraseConfig {
    /// The phrase the subject must type to confirm consent.
    #[serde(default = "default_required_phrase")]
    pub required_phrase: String,

    /// Mismatches permitted before the gate is exhausted.
    #[serde(default = "default_phrase_attempt_cap")]
    pub attempt_cap: u32,
}

fn default_required_phrase() -> String {
    "I have read and agree to this document".to_string()
}

fn default_phrase_attempt_cap() -> u32 {
    5
}

impl Default for PhraseConfig {
    fn default() -> Self {
        Self {
            required_phrase: default_required_phrase(),
            attempt_cap: default_phrase_attempt_cap(),
        }
    }
}

/// Top-level workflow configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Read-gate thresholds.
    #[serde(default)]
    pub read_gate: ReadGateConfig,

    /// Password re-verification limits.
    #[serde(default)]
    pub password: ReverifyPolicy,

    /// One-time code limits.
    #[serde(default)]
    pub otp: OtpPolicy,

    /// Consent-phrase gate settings.
    #[serde(default)]
    pub phrase: PhraseConfig,
}

impl SigningConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or
    /// validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a field is out of
    /// range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if any threshold is outside
    /// its permitted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_gate.scroll_threshold_percent > 100 {
            return Err(ConfigError::Validation(format!(
                "scroll_threshold_percent must be <= 100, got {}",
                self.read_gate.scroll_threshold_percent
            )));
        }
        if !(4..=10).contains(&self.otp.code_length) {
            return Err(ConfigError::Validation(format!(
                "otp code_length must be between 4 and 10, got {}",
                self.otp.code_length
            )));
        }
        if self.otp.ttl_seconds <= 0 {
            return Err(ConfigError::Validation(
                "otp ttl_seconds must be positive".to_string(),
            ));
        }
        if self.otp.attempt_cap == 0 || self.password.failure_cap == 0 || self.phrase.attempt_cap == 0
        {
            return Err(ConfigError::Validation(
                "attempt caps must be at least 1".to_string(),
            ));
        }
        if self.password.cooldown_base_seconds <= 0
            || self.password.cooldown_max_seconds < self.password.cooldown_base_seconds
        {
            return Err(ConfigError::Validation(
                "cooldown window must be positive and max >= base".to_string(),
            ));
        }
        if self.phrase.required_phrase.trim().is_empty() {
            return Err(ConfigError::Validation(
                "required_phrase must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SigningConfig::default();
        assert_eq!(config.read_gate.scroll_threshold_percent, 90);
        assert_eq!(config.read_gate.min_dwell_seconds, 30);
        assert_eq!(config.password.failure_cap, 5);
        assert_eq!(config.otp.code_length, 6);
        assert_eq!(config.otp.ttl_seconds, 300);
        assert_eq!(config.otp.attempt_cap, 5);
        assert_eq!(config.phrase.attempt_cap, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial_override() {
        let config = SigningConfig::from_toml(
            r#"
            [read_gate]
            min_dwell_seconds = 45

            [phrase]
            required_phrase = "I consent"
            "#,
        )
        .unwrap();
        assert_eq!(config.read_gate.min_dwell_seconds, 45);
        assert_eq!(config.read_gate.scroll_threshold_percent, 90);
        assert_eq!(config.phrase.required_phrase, "I consent");
        assert_eq!(config.otp.attempt_cap, 5);
    }

    #[test]
    fn test_empty_toml_is_defaults() {
        let config = SigningConfig::from_toml("").unwrap();
        assert_eq!(config, SigningConfig::default());
    }

    #[test]
    fn test_from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consign.toml");
        std::fs::write(
            &path,
            r#"
            [otp]
            ttl_seconds = 120

            [password]
            failure_cap = 3
            "#,
        )
        .unwrap();

        let config = SigningConfig::from_file(&path).unwrap();
        assert_eq!(config.otp.ttl_seconds, 120);
        assert_eq!(config.password.failure_cap, 3);
        assert_eq!(config.read_gate.scroll_threshold_percent, 90);
    }

    #[test]
    fn test_from_file_missing_path_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = SigningConfig::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let result = SigningConfig::from_toml(
            r#"
            [read_gate]
            scroll_threshold_percent = 101
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));

        let result = SigningConfig::from_toml(
            r#"
            [otp]
            code_length = 3
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));

        let result = SigningConfig::from_toml(
            r#"
            [phrase]
            required_phrase = "   "
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
