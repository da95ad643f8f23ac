//! Filtering, ordering, and sequential application of conventions.

use crate::convention::{Convention, ConventionError};
use crate::image_config::{ImageErrors, ImageResolver};
use crate::metrics::PipelineMetrics;
use conventions_webhook::PodConventionContext;
use conventions_controller_k8s_api::convention::SelectorTarget;
use conventions_controller_k8s_api::labels::{self, Labels};
use conventions_controller_k8s_api::APPLIED_CONVENTIONS_ANNOTATION;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct Conventions(pub Vec<Convention>);

#[derive(Debug, thiserror::Error)]
#[error("unable to convert label selector for ClusterPodConvention {convention:?}: {source}")]
pub struct FilterError {
    pub convention: String,
    #[source]
    pub source: labels::InvalidSelector,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("failed to fetch metadata for Images: {0}")]
    ImageResolution(#[from] ImageErrors),

    #[error("failed to apply convention with name {name}: {source}")]
    Convention {
        name: String,
        #[source]
        source: ConventionError,
    },
}

// === impl Conventions ===

impl Conventions {
    /// Keeps the conventions whose selectors match the label set of their
    /// declared target, ordered by priority band and then name.
    pub fn filter_and_sort(
        self,
        collected_labels: &HashMap<SelectorTarget, Labels>,
    ) -> Result<Self, FilterError> {
        Ok(self.filter(collected_labels)?.sort())
    }

    fn filter(
        self,
        collected_labels: &HashMap<SelectorTarget, Labels>,
    ) -> Result<Self, FilterError> {
        let empty = Labels::default();
        let mut filtered = Vec::new();
        for convention in self.0 {
            let target_labels = collected_labels
                .get(&convention.selector_target)
                .unwrap_or(&empty);

            // No selectors means an implicit match-all selector. Otherwise
            // selectors are ORed, short-circuiting on the first match.
            let mut matched = convention.selectors.is_empty();
            for selector in &convention.selectors {
                selector.validate().map_err(|source| FilterError {
                    convention: convention.name.clone(),
                    source,
                })?;
                if selector.matches(target_labels) {
                    matched = true;
                    break;
                }
            }
            if matched {
                filtered.push(convention);
            } else {
                debug!(convention = %convention.name, "Convention does not select this workload");
            }
        }
        Ok(Self(filtered))
    }

    fn sort(mut self) -> Self {
        // Early < Normal < Late, then lexicographic by name.
        self.0
            .sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        self
    }

    /// Applies each convention in order. Every call observes the template as
    /// mutated by its predecessors, with image references re-resolved and
    /// pinned before dispatch. Applied-convention identifiers accumulate in
    /// the template annotation; history carried in on the workload is never
    /// dropped.
    pub async fn apply(
        &self,
        intent_name: &str,
        workload: &mut PodTemplateSpec,
        resolver: &ImageResolver,
        timeout: Duration,
        metrics: &PipelineMetrics,
    ) -> Result<(), ApplyError> {
        let mut applied: Vec<String> = annotations(workload)
            .get(APPLIED_CONVENTIONS_ANNOTATION)
            .filter(|v| !v.is_empty())
            .map(|v| v.split('\n').map(String::from).collect())
            .unwrap_or_default();

        for convention in &self.0 {
            let image_config = resolver.resolve_image_metadata(workload).await?;

            let context = PodConventionContext::new(
                format!("{}-{}", intent_name, convention.name),
                workload.clone(),
                image_config,
            );
            let response = match convention.apply(&context, timeout).await {
                Ok(response) => {
                    metrics.webhook_call("ok");
                    response
                }
                Err(source) => {
                    metrics.webhook_call("error");
                    return Err(ApplyError::Convention {
                        name: convention.name.clone(),
                        source,
                    });
                }
            };
            info!(convention = %convention.name, "Applied convention");

            *workload = response.status.template;
            for id in response.status.applied_conventions {
                applied.push(format!("{}/{}", convention.name, id));
            }
            annotations_mut(workload).insert(
                APPLIED_CONVENTIONS_ANNOTATION.to_string(),
                applied.join("\n"),
            );
        }
        Ok(())
    }
}

fn annotations(workload: &PodTemplateSpec) -> &std::collections::BTreeMap<String, String> {
    static EMPTY: std::collections::BTreeMap<String, String> = std::collections::BTreeMap::new();
    workload
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.as_ref())
        .unwrap_or(&EMPTY)
}

fn annotations_mut(workload: &mut PodTemplateSpec) -> &mut std::collections::BTreeMap<String, String> {
    workload
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(Default::default)
}
