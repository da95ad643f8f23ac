use k8s_openapi::api::core::v1::{LocalObjectReference, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declares a pod template to be decorated by the cluster's conventions.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "conventions.carto.run",
    version = "v1alpha1",
    kind = "PodIntent",
    namespaced,
    status = "PodIntentStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PodIntentSpec {
    /// Service account used to authenticate image pulls when it carries
    /// attached pull secrets. Defaults to `default`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Secrets holding registry login information used to resolve image
    /// metadata.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    pub template: PodTemplateSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodIntentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// The decorated template. Set exactly when `ConventionsApplied=True`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

// === impl PodIntent ===

impl PodIntent {
    /// The effective service account name, after defaulting.
    pub fn service_account(&self) -> &str {
        match self.spec.service_account_name.as_deref() {
            Some("") | None => DEFAULT_SERVICE_ACCOUNT,
            Some(name) => name,
        }
    }

    /// Names of the intent's direct image pull secrets.
    pub fn pull_secret_names(&self) -> impl Iterator<Item = &str> {
        self.spec
            .image_pull_secrets
            .iter()
            .map(|s| s.name.as_str())
    }
}
