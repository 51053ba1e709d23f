//! # Stage: Declarative Engine Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that tunes the router: learned-cache
//! thresholds, external model settings, conversation lifetime, and retention.
//! Every field has a default, so an empty file (or no file at all) yields a
//! working engine.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `EngineConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//! - Secret-free: the external API key is read from the environment, never
//!   from the file
//!
//! ## NOT Responsible For
//! - Building the router from config (that belongs to `router`)
//! - Scheduling maintenance (that belongs to `scheduler`)

pub mod loader;
pub mod validation;

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::clock::{DAY_SECS, HOUR_SECS};

// ── Default value functions ──────────────────────────────────────────────

fn default_fallback_accept_threshold() -> f64 {
    0.8
}

fn default_max_question_chars() -> usize {
    4000
}

fn default_learned_window_days() -> u64 {
    30
}

fn default_min_usage() -> usize {
    2
}

fn default_min_helpfulness() -> f64 {
    0.7
}

fn default_max_confidence() -> f64 {
    0.95
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    500
}

fn default_temperature() -> f32 {
    0.2
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_history_turns() -> usize {
    10
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_ttl_hours() -> u64 {
    24
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_max_entries() -> usize {
    10_000
}

fn default_retention_days() -> u64 {
    90
}

fn default_prune_interval_secs() -> u64 {
    6 * 3600
}

fn default_intelligence_window_days() -> u64 {
    7
}

fn default_common_question_min_count() -> usize {
    2
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a router instance.
///
/// # Example
///
/// ```toml
/// [external]
/// model = "gpt-4o-mini"
/// timeout_secs = 20
///
/// [conversation]
/// snapshot_path = "/var/lib/router/conversations.json"
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Tier selection thresholds and request limits.
    pub routing: RoutingConfig,
    /// Learned-answer cache thresholds.
    pub learned: LearnedConfig,
    /// External model connection.
    pub external: ExternalConfig,
    /// Per-user conversation state.
    pub conversation: ConversationConfig,
    /// Interaction retention and intelligence refresh.
    pub retention: RetentionConfig,
}

/// Tier selection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoutingConfig {
    /// A fallback answer is served without calling the external model only
    /// when its confidence is strictly above this value.
    #[serde(default = "default_fallback_accept_threshold")]
    pub fallback_accept_threshold: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            fallback_accept_threshold: default_fallback_accept_threshold(),
        }
    }
}

/// Learned-answer cache thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LearnedConfig {
    /// Only interactions newer than this many days are considered.
    #[serde(default = "default_learned_window_days")]
    pub window_days: u64,
    /// Minimum number of records sharing an answer.
    #[serde(default = "default_min_usage")]
    pub min_usage: usize,
    /// Minimum helpful / (helpful + unhelpful) ratio.
    #[serde(default = "default_min_helpfulness")]
    pub min_helpfulness: f64,
    /// Ceiling on reported confidence.
    #[serde(default = "default_max_confidence")]
    pub max_confidence: f64,
}

impl LearnedConfig {
    /// Lookback window as seconds.
    pub fn window_secs(&self) -> u64 {
        self.window_days.saturating_mul(DAY_SECS)
    }
}

impl Default for LearnedConfig {
    fn default() -> Self {
        Self {
            window_days: default_learned_window_days(),
            min_usage: default_min_usage(),
            min_helpfulness: default_min_helpfulness(),
            max_confidence: default_max_confidence(),
        }
    }
}

/// External chat-completion model settings.
///
/// The key itself is never part of the file; `api_key_env` names the
/// environment variable holding it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ExternalConfig {
    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// Maximum tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature, kept low for factual answers.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Hard deadline per call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Prior turns included in the prompt.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Question text sent to the model is cut to this many characters.
    /// Routing itself accepts questions of any length.
    #[serde(default = "default_max_question_chars")]
    pub max_question_chars: usize,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl ExternalConfig {
    /// Per-call deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            history_turns: default_history_turns(),
            max_question_chars: default_max_question_chars(),
            api_key_env: default_api_key_env(),
        }
    }
}

/// Per-user conversation state settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConversationConfig {
    /// Idle time after which an entry expires.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    /// How often expired entries are swept.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Upper bound on live entries; the least recently active is evicted.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Snapshot file for restart persistence. `None` disables it.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

impl ConversationConfig {
    /// Time-to-live as seconds.
    pub fn ttl_secs(&self) -> u64 {
        self.ttl_hours.saturating_mul(HOUR_SECS)
    }

    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_entries: default_max_entries(),
            snapshot_path: None,
        }
    }
}

/// Interaction retention and intelligence refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RetentionConfig {
    /// Interactions older than this are deleted.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// How often pruning and intelligence refresh run.
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    /// Window used for success rate and common questions.
    #[serde(default = "default_intelligence_window_days")]
    pub intelligence_window_days: u64,
    /// Times a question must be asked in the window to count as common.
    #[serde(default = "default_common_question_min_count")]
    pub common_question_min_count: usize,
}

impl RetentionConfig {
    /// Retention period as seconds.
    pub fn retention_secs(&self) -> u64 {
        self.retention_days.saturating_mul(DAY_SECS)
    }

    /// Intelligence window as seconds.
    pub fn intelligence_window_secs(&self) -> u64 {
        self.intelligence_window_days.saturating_mul(DAY_SECS)
    }

    /// Prune period.
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            prune_interval_secs: default_prune_interval_secs(),
            intelligence_window_days: default_intelligence_window_days(),
            common_question_min_count: default_common_question_min_count(),
        }
    }
}

// ── Credentials ──────────────────────────────────────────────────────────

static API_KEY: OnceLock<Option<String>> = OnceLock::new();

/// Read the external API key from the environment variable named by
/// `config.api_key_env`.
///
/// The variable is read once per process; later calls return the cached
/// value even if the environment changes. Blank values count as absent.
///
/// # Panics
///
/// This function never panics.
pub fn external_api_key(config: &ExternalConfig) -> Option<String> {
    API_KEY
        .get_or_init(|| {
            std::env::var(&config.api_key_env)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .clone()
}

/// Export the JSON Schema for [`EngineConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
///
/// # Panics
///
/// This function never panics.
pub fn json_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(EngineConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config: EngineConfig = toml::from_str("").expect("test: parse empty");
        assert_eq!(config, EngineConfig::default());
        assert!((config.routing.fallback_accept_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.learned.min_usage, 2);
        assert_eq!(config.external.model, "gpt-4o-mini");
        assert_eq!(config.conversation.ttl_hours, 24);
        assert_eq!(config.retention.retention_days, 90);
        assert!(config.conversation.snapshot_path.is_none());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let toml_str = r#"
[external]
timeout_secs = 5
"#;
        let config: EngineConfig = toml::from_str(toml_str).expect("test: parse partial");
        assert_eq!(config.external.timeout_secs, 5);
        assert_eq!(config.external.max_tokens, 500);
        assert_eq!(config.external.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn test_duration_helpers() {
        let config = EngineConfig::default();
        assert_eq!(config.learned.window_secs(), 30 * DAY_SECS);
        assert_eq!(config.conversation.ttl_secs(), 24 * HOUR_SECS);
        assert_eq!(config.retention.prune_interval(), Duration::from_secs(21_600));
        assert_eq!(config.external.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_snapshot_path_parses() {
        let toml_str = r#"
[conversation]
snapshot_path = "/tmp/conv.json"
"#;
        let config: EngineConfig = toml::from_str(toml_str).expect("test: parse path");
        assert_eq!(
            config.conversation.snapshot_path,
            Some(PathBuf::from("/tmp/conv.json"))
        );
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = EngineConfig::default();
        config.external.model = "gpt-4o".into();
        config.conversation.snapshot_path = Some(PathBuf::from("snap.json"));
        let s = toml::to_string_pretty(&config).expect("test: serialize");
        let back: EngineConfig = toml::from_str(&s).expect("test: deserialize");
        assert_eq!(config, back);
    }

    #[test]
    fn test_json_schema_produces_valid_json() {
        let schema = json_schema().expect("test: schema export");
        let value: serde_json::Value = serde_json::from_str(&schema).expect("test: valid json");
        assert!(value.get("properties").is_some());
    }
}
