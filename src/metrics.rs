use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::cache::EntryKind;
use crate::http::classify::RequestClass;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Class {
    Plain,
    GitProtocol,
    GitClone,
}

impl From<RequestClass> for Class {
    fn from(class: RequestClass) -> Self {
        match class {
            RequestClass::Plain => Self::Plain,
            RequestClass::GitProtocol => Self::GitProtocol,
            RequestClass::GitClone => Self::GitClone,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClassLabels {
    pub class: Class,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Entry {
    Body,
    Archive,
}

impl From<EntryKind> for Entry {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::Body => Self::Body,
            EntryKind::Archive => Self::Archive,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EntryLabels {
    pub entry: Entry,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub requests_total: Family<ClassLabels, Counter>,
    pub cache_hits: Family<EntryLabels, Counter>,
    pub cache_misses: Family<EntryLabels, Counter>,
    pub upstream_errors: Counter,
    pub coalesced_waiters: Counter,
    pub archive_builds: Family<OutcomeLabels, Counter>,
    pub archive_build_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<ClassLabels, Counter>::default();
        registry.register(
            "gitaccel_requests_total",
            "Proxied requests by classification",
            requests_total.clone(),
        );

        let cache_hits = Family::<EntryLabels, Counter>::default();
        registry.register(
            "gitaccel_cache_hits_total",
            "Requests served from the on-disk cache",
            cache_hits.clone(),
        );

        let cache_misses = Family::<EntryLabels, Counter>::default();
        registry.register(
            "gitaccel_cache_misses_total",
            "Cacheable requests that missed the on-disk cache",
            cache_misses.clone(),
        );

        let upstream_errors = Counter::default();
        registry.register(
            "gitaccel_upstream_errors_total",
            "Upstream calls that failed before a response was received",
            upstream_errors.clone(),
        );

        let coalesced_waiters = Counter::default();
        registry.register(
            "gitaccel_coalesced_waiters_total",
            "Requests that joined an in-flight fetch or build",
            coalesced_waiters.clone(),
        );

        let archive_builds = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "gitaccel_archive_builds_total",
            "Repository archive builds by outcome",
            archive_builds.clone(),
        );

        let archive_build_duration_seconds = Histogram::new(exponential_buckets(0.25, 2.0, 12));
        registry.register(
            "gitaccel_archive_build_duration_seconds",
            "Clone and packaging latency in seconds",
            archive_build_duration_seconds.clone(),
        );

        Self {
            requests_total,
            cache_hits,
            cache_misses,
            upstream_errors,
            coalesced_waiters,
            archive_builds,
            archive_build_duration_seconds,
        }
    }

    pub fn record_request(&self, class: RequestClass) {
        self.requests_total
            .get_or_create(&ClassLabels {
                class: class.into(),
            })
            .inc();
    }

    pub fn record_hit(&self, kind: EntryKind) {
        self.cache_hits
            .get_or_create(&EntryLabels { entry: kind.into() })
            .inc();
    }

    pub fn record_miss(&self, kind: EntryKind) {
        self.cache_misses
            .get_or_create(&EntryLabels { entry: kind.into() })
            .inc();
    }

    pub fn record_build(&self, success: bool, seconds: f64) {
        let outcome = if success {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.archive_builds
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
        self.archive_build_duration_seconds.observe(seconds);
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_recorded_values() {
        let registry = MetricsRegistry::new();
        registry.metrics.record_request(RequestClass::GitClone);
        registry.metrics.record_hit(EntryKind::Archive);
        registry.metrics.record_miss(EntryKind::Body);
        registry.metrics.record_build(true, 1.5);

        let text = registry.encode().unwrap();
        assert!(text.contains("gitaccel_requests_total{class=\"GitClone\"} 1"));
        assert!(text.contains("gitaccel_cache_hits_total{entry=\"Archive\"} 1"));
        assert!(text.contains("gitaccel_cache_misses_total{entry=\"Body\"} 1"));
        assert!(text.contains("gitaccel_archive_builds_total{outcome=\"Success\"} 1"));
    }
}
