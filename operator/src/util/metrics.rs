use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Registry scraped by the metrics server. Kept separate from the
    /// default registry so only operator metrics are exported.
    pub static ref REGISTRY: Registry = Registry::new();
}

/// Per-controller reconcile instrumentation. Label sets follow the
/// reconcile call sites: resource name, namespace, and (where it applies)
/// the action taken.
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = IntCounterVec::new(
            Opts::new(
                format!("{controller}_reconciles_total"),
                "Total number of reconcile invocations.",
            ),
            &["name", "namespace"],
        )
        .unwrap();
        let action_counter = IntCounterVec::new(
            Opts::new(
                format!("{controller}_actions_total"),
                "Total number of write actions, by action.",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let read_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("{controller}_read_phase_seconds"),
                "Duration of the read phase of reconciliation.",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let write_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("{controller}_write_phase_seconds"),
                "Duration of the write phase of reconciliation.",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        REGISTRY
            .register(Box::new(reconcile_counter.clone()))
            .unwrap();
        REGISTRY.register(Box::new(action_counter.clone())).unwrap();
        REGISTRY.register(Box::new(read_histogram.clone())).unwrap();
        REGISTRY
            .register(Box::new(write_histogram.clone()))
            .unwrap();
        ControllerMetrics {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }
}
