use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

/// Counters shared by the syncer and the patroller, labelled by resource kind
/// and tenant cluster so drift in one tenant stays visible.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,
    pub patrol_mismatch: IntCounterVec,
    pub patrol_orphans_deleted: IntCounterVec,
    pub patrol_requeued: IntCounterVec,
    pub reconcile_dropped: IntCounterVec,
    pub reconcile_retries: IntCounterVec,
    pub patrol_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let patrol_mismatch = IntCounterVec::new(
            Opts::new(
                "canopy_patrol_mismatch_total",
                "Objects found differing between tenant and super state",
            ),
            &["kind", "cluster"],
        )
        .expect("valid metric definition");
        let patrol_orphans_deleted = IntCounterVec::new(
            Opts::new(
                "canopy_patrol_orphans_deleted_total",
                "Super objects deleted because their tenant counterpart is gone",
            ),
            &["kind", "cluster"],
        )
        .expect("valid metric definition");
        let patrol_requeued = IntCounterVec::new(
            Opts::new(
                "canopy_patrol_requeued_total",
                "Tenant objects requeued by the patroller",
            ),
            &["kind", "cluster"],
        )
        .expect("valid metric definition");
        let reconcile_dropped = IntCounterVec::new(
            Opts::new(
                "canopy_reconcile_dropped_total",
                "Requests dropped from a sync queue (fail-fast or retry budget exhausted)",
            ),
            &["kind", "reason"],
        )
        .expect("valid metric definition");
        let reconcile_retries = IntCounterVec::new(
            Opts::new(
                "canopy_reconcile_retries_total",
                "Rate-limited requeues issued by sync workers",
            ),
            &["kind"],
        )
        .expect("valid metric definition");
        let patrol_duration = Histogram::with_opts(HistogramOpts::new(
            "canopy_patrol_duration_seconds",
            "Wall time of a single patrol pass",
        ))
        .expect("valid metric definition");

        for c in [
            &patrol_mismatch,
            &patrol_orphans_deleted,
            &patrol_requeued,
            &reconcile_dropped,
            &reconcile_retries,
        ] {
            registry
                .register(Box::new(c.clone()))
                .expect("metric registered once");
        }
        registry
            .register(Box::new(patrol_duration.clone()))
            .expect("metric registered once");

        Self {
            registry,
            patrol_mismatch,
            patrol_orphans_deleted,
            patrol_requeued,
            reconcile_dropped,
            reconcile_retries,
            patrol_duration,
        }
    }

    /// Renders the registry in the text exposition format.
    pub fn render(&self) -> String {
        use prometheus::Encoder;
        let mut buf = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("failed to encode metrics: {err}");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_with_labels() {
        let metrics = Metrics::new();
        metrics
            .patrol_orphans_deleted
            .with_label_values(&["Pod", "t1"])
            .inc();
        let out = metrics.render();
        assert!(out.contains("canopy_patrol_orphans_deleted_total"));
        assert!(out.contains("cluster=\"t1\""));
    }
}
