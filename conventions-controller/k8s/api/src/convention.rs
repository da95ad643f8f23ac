use crate::labels;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster-scoped descriptor of a remote convention server and the workloads
/// it applies to.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "conventions.carto.run",
    version = "v1alpha1",
    kind = "ClusterPodConvention"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPodConventionSpec {
    /// Label selectors gating this convention; empty matches every workload.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<labels::Selector>,

    /// Which object's labels the selectors are evaluated against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_target: Option<SelectorTarget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<Webhook>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema)]
pub enum Priority {
    Early,
    Normal,
    Late,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum SelectorTarget {
    PodIntent,
    PodTemplateSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    /// How to reach the convention server.
    pub client_config: ClientConfig,

    /// A cert-manager certificate whose issued CAs should be trusted when
    /// calling the server, in place of a static `caBundle`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateRef>,
}

/// Mirrors the admission-registration client config: exactly one of `url` and
/// `service` must be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceRef>,

    /// PEM bundle (base64 in the manifest) used to verify the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub ca_bundle: Option<k8s_openapi::ByteString>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRef {
    pub namespace: String,
    pub name: String,
}

pub const DEFAULT_WEBHOOK_PORT: i32 = 443;

// === impl ClusterPodConventionSpec ===

impl ClusterPodConventionSpec {
    /// Applies the same defaults the mutating admission path applies, so the
    /// catalog never observes a partially-defaulted convention.
    pub fn default_values(&mut self) {
        if self.priority.is_none() {
            self.priority = Some(Priority::Normal);
        }
        if self.selector_target.is_none() {
            self.selector_target = Some(SelectorTarget::PodTemplateSpec);
        }
        if let Some(webhook) = self.webhook.as_mut() {
            webhook.default_values();
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority.unwrap_or(Priority::Normal)
    }

    pub fn selector_target(&self) -> SelectorTarget {
        self.selector_target.unwrap_or(SelectorTarget::PodTemplateSpec)
    }
}

// === impl Webhook ===

impl Webhook {
    pub fn default_values(&mut self) {
        if let Some(service) = self.client_config.service.as_mut() {
            if service.port.is_none() {
                service.port = Some(DEFAULT_WEBHOOK_PORT);
            }
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Early => "Early".fmt(f),
            Priority::Normal => "Normal".fmt(f),
            Priority::Late => "Late".fmt(f),
        }
    }
}

impl std::fmt::Display for SelectorTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorTarget::PodIntent => "PodIntent".fmt(f),
            SelectorTarget::PodTemplateSpec => "PodTemplateSpec".fmt(f),
        }
    }
}
