use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Counters for the per-intent pipeline: one increment per convention
/// webhook dispatch and one per image-resolution pass.
#[derive(Clone, Debug, Default)]
pub struct PipelineMetrics {
    webhook_calls: Family<ResultLabels, Counter>,
    image_resolutions: Family<ResultLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: &'static str,
}

// === impl PipelineMetrics ===

impl PipelineMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let webhook_calls = Family::default();
        reg.register(
            "webhook_calls",
            "Number of convention webhook dispatches by result",
            webhook_calls.clone(),
        );

        let image_resolutions = Family::default();
        reg.register(
            "image_resolutions",
            "Number of image metadata resolution passes by result",
            image_resolutions.clone(),
        );

        Self {
            webhook_calls,
            image_resolutions,
        }
    }

    pub(crate) fn webhook_call(&self, result: &'static str) {
        self.webhook_calls
            .get_or_create(&ResultLabels { result })
            .inc();
    }

    pub(crate) fn image_resolution(&self, result: &'static str) {
        self.image_resolutions
            .get_or_create(&ResultLabels { result })
            .inc();
    }
}
