//! Prometheus metrics for the response router.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_response`, `inc_external_call`, …) are no-ops if `init_metrics` was
//! never called, so routing is always safe to run and observability simply
//! degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `router_responses_total` | Counter | `source` |
//! | `router_external_calls_total` | Counter | `outcome` |
//! | `router_external_calls_avoided_total` | Counter | |
//! | `router_learned_lookups_total` | Counter | `outcome` |
//! | `router_route_duration_seconds` | Histogram | |
//! | `router_conversation_states` | Gauge | |
//! | `router_interactions_pruned_total` | Counter | |

use crate::EngineError;
use prometheus::{
    core::Collector, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All router metrics, bundled so they can be stored in a single
/// [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Responses served, by source tier.
    pub responses_total: IntCounterVec,
    /// External model calls, by outcome.
    pub external_calls_total: IntCounterVec,
    /// Requests answered without calling the external model.
    pub external_calls_avoided: IntCounter,
    /// Learned-cache lookups, by outcome (`hit`, `miss`, `error`).
    pub learned_lookups_total: IntCounterVec,
    /// End-to-end routing latency.
    pub route_duration: Histogram,
    /// Live conversation entries.
    pub conversation_states: IntGauge,
    /// Interaction records removed by retention.
    pub interactions_pruned: IntCounter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: C) -> Result<C, EngineError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| EngineError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn init_err(e: prometheus::Error) -> EngineError {
    EngineError::Other(format!("metrics init failed: {e}"))
}

fn build(registry: Registry, prefix: &str) -> Result<Metrics, EngineError> {
    let name = |suffix: &str| format!("{prefix}_{suffix}");

    let responses_total = register(
        &registry,
        IntCounterVec::new(
            Opts::new(name("responses_total"), "Responses served by source tier"),
            &["source"],
        )
        .map_err(init_err)?,
    )?;
    let external_calls_total = register(
        &registry,
        IntCounterVec::new(
            Opts::new(name("external_calls_total"), "External model calls by outcome"),
            &["outcome"],
        )
        .map_err(init_err)?,
    )?;
    let external_calls_avoided = register(
        &registry,
        IntCounter::new(
            name("external_calls_avoided_total"),
            "Requests answered without an external call",
        )
        .map_err(init_err)?,
    )?;
    let learned_lookups_total = register(
        &registry,
        IntCounterVec::new(
            Opts::new(name("learned_lookups_total"), "Learned cache lookups by outcome"),
            &["outcome"],
        )
        .map_err(init_err)?,
    )?;
    let route_duration = register(
        &registry,
        Histogram::with_opts(HistogramOpts::new(
            name("route_duration_seconds"),
            "End-to-end routing duration",
        ))
        .map_err(init_err)?,
    )?;
    let conversation_states = register(
        &registry,
        IntGauge::new(name("conversation_states"), "Live conversation entries")
            .map_err(init_err)?,
    )?;
    let interactions_pruned = register(
        &registry,
        IntCounter::new(
            name("interactions_pruned_total"),
            "Interaction records removed by retention",
        )
        .map_err(init_err)?,
    )?;

    Ok(Metrics {
        registry,
        responses_total,
        external_calls_total,
        external_calls_avoided,
        learned_lookups_total,
        route_duration,
        conversation_states,
        interactions_pruned,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`EngineError::Other`] if metric construction or registry
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), EngineError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = build(Registry::new(), "router")?;
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count one served response for `source`.
///
/// # Panics
///
/// This function never panics.
pub fn inc_response(source: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.responses_total.get_metric_with_label_values(&[source]) {
            c.inc();
        }
    }
}

/// Count one external call ending in `outcome` (`ok`, `timeout`, `http`, …).
///
/// # Panics
///
/// This function never panics.
pub fn inc_external_call(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.external_calls_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Count one request answered without an external call.
pub fn inc_external_call_avoided() {
    if let Some(m) = metrics() {
        m.external_calls_avoided.inc();
    }
}

/// Count one learned-cache lookup ending in `outcome`.
pub fn record_learned_lookup(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.learned_lookups_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Record end-to-end routing latency.
pub fn record_route_duration(d: Duration) {
    if let Some(m) = metrics() {
        m.route_duration.observe(d.as_secs_f64());
    }
}

/// Set the live conversation gauge.
pub fn set_conversation_states(count: usize) {
    if let Some(m) = metrics() {
        m.conversation_states
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }
}

/// Add `count` pruned interactions.
pub fn add_interactions_pruned(count: usize) {
    if let Some(m) = metrics() {
        m.interactions_pruned
            .inc_by(u64::try_from(count).unwrap_or(u64::MAX));
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// A structured snapshot of the router counters.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Responses keyed by source tier.
    pub responses_total: HashMap<String, u64>,
    /// External calls keyed by outcome.
    pub external_calls_total: HashMap<String, u64>,
    /// Requests answered without an external call.
    pub external_calls_avoided: u64,
}

fn collect_by_label(vec: &IntCounterVec, label: &str) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let key = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == label)
                .map_or("unknown", |l| l.get_value());
            let value = metric.get_counter().get_value() as u64;
            out.insert(key.to_string(), value);
        }
    }
    out
}

/// Return a structured summary of current counter values.
///
/// Returns a zeroed [`MetricsSummary`] if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };
    MetricsSummary {
        responses_total: collect_by_label(&m.responses_total, "source"),
        external_calls_total: collect_by_label(&m.external_calls_total, "outcome"),
        external_calls_avoided: m.external_calls_avoided.get(),
    }
}
