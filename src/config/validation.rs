//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`EngineConfig`] that cannot
//! be expressed through the type system alone (range checks, non-empty
//! strings, non-zero periods).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::EngineConfig;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "external.temperature").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on an [`EngineConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &EngineConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Routing ──────────────────────────────────────────────────────
    let threshold = config.routing.fallback_accept_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        errors.push(invalid(
            "routing.fallback_accept_threshold",
            threshold,
            "must be between 0.0 and 1.0",
        ));
    }

    // ── Learned cache ────────────────────────────────────────────────
    if config.learned.window_days == 0 {
        errors.push(invalid("learned.window_days", 0, "must be at least 1 day"));
    }
    if config.learned.min_usage == 0 {
        errors.push(invalid("learned.min_usage", 0, "must be at least 1"));
    }
    if !(0.0..=1.0).contains(&config.learned.min_helpfulness) {
        errors.push(invalid(
            "learned.min_helpfulness",
            config.learned.min_helpfulness,
            "must be between 0.0 and 1.0",
        ));
    }
    if !(0.0..=1.0).contains(&config.learned.max_confidence) {
        errors.push(invalid(
            "learned.max_confidence",
            config.learned.max_confidence,
            "must be between 0.0 and 1.0",
        ));
    }

    // ── External model ───────────────────────────────────────────────
    if config.external.model.trim().is_empty() {
        errors.push(invalid(
            "external.model",
            "",
            "model name must not be empty",
        ));
    }
    let base_url = config.external.base_url.trim();
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        errors.push(invalid(
            "external.base_url",
            base_url,
            "must start with http:// or https://",
        ));
    }
    if !(0.1..=0.3).contains(&config.external.temperature) {
        errors.push(invalid(
            "external.temperature",
            config.external.temperature,
            "must be between 0.1 and 0.3",
        ));
    }
    if config.external.max_tokens == 0 {
        errors.push(invalid("external.max_tokens", 0, "must be at least 1"));
    }
    if config.external.timeout_secs == 0 {
        errors.push(invalid(
            "external.timeout_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if config.external.max_question_chars == 0 {
        errors.push(invalid(
            "external.max_question_chars",
            0,
            "must be at least 1",
        ));
    }
    if config.external.api_key_env.trim().is_empty() {
        errors.push(invalid(
            "external.api_key_env",
            "",
            "environment variable name must not be empty",
        ));
    }

    // ── Conversation state ───────────────────────────────────────────
    if config.conversation.ttl_hours == 0 {
        errors.push(invalid(
            "conversation.ttl_hours",
            0,
            "must be at least 1 hour",
        ));
    }
    if config.conversation.sweep_interval_secs == 0 {
        errors.push(invalid(
            "conversation.sweep_interval_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if config.conversation.max_entries == 0 {
        errors.push(invalid(
            "conversation.max_entries",
            0,
            "must be at least 1",
        ));
    }

    // ── Retention ────────────────────────────────────────────────────
    if config.retention.retention_days == 0 {
        errors.push(invalid(
            "retention.retention_days",
            0,
            "must be at least 1 day",
        ));
    }
    if config.retention.prune_interval_secs == 0 {
        errors.push(invalid(
            "retention.prune_interval_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if config.retention.intelligence_window_days == 0 {
        errors.push(invalid(
            "retention.intelligence_window_days",
            0,
            "must be at least 1 day",
        ));
    }
    if config.retention.common_question_min_count == 0 {
        errors.push(invalid(
            "retention.common_question_min_count",
            0,
            "must be at least 1",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
