use conventions_controller_binding::PipelineMetrics;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Reconciler-level counters plus the pipeline counters incremented from the
/// binding crate (webhook dispatches, image-resolution passes).
#[derive(Clone, Debug)]
pub struct Metrics {
    reconciles: Family<OutcomeLabels, Counter>,
    pipeline: PipelineMetrics,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: &'static str,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::default();
        reg.register(
            "reconciles",
            "Number of PodIntent reconciliations by outcome",
            reconciles.clone(),
        );

        let pipeline = PipelineMetrics::register(reg);

        Self {
            reconciles,
            pipeline,
        }
    }

    pub fn reconcile_outcome(&self, outcome: &'static str) {
        self.reconciles.get_or_create(&OutcomeLabels { outcome }).inc();
    }

    pub fn pipeline(&self) -> &PipelineMetrics {
        &self.pipeline
    }
}
