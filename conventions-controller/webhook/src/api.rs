//! The wire schema exchanged with convention servers.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "webhooks.conventions.carto.run/v1alpha1";
pub const KIND: &str = "PodConventionContext";

/// The request/response body of a convention server call. The controller
/// populates `spec`; the server echoes the object back with `status` filled
/// in.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodConventionContext {
    #[serde(default)]
    pub api_version: String,

    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub metadata: ContextMeta,

    #[serde(default)]
    pub spec: PodConventionContextSpec,

    #[serde(default)]
    pub status: PodConventionContextStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ContextMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodConventionContextSpec {
    #[serde(default)]
    pub template: PodTemplateSpec,

    #[serde(default)]
    pub image_config: Vec<ImageConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodConventionContextStatus {
    #[serde(default)]
    pub template: PodTemplateSpec,

    #[serde(default)]
    pub applied_conventions: Vec<String>,
}

/// Resolved metadata for one image reference. `image` is always
/// digest-pinned.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ImageConfig {
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boms: Vec<Bom>,

    pub config: ImageConfiguration,
}

/// A single SBOM file extracted from an image layer. `name` carries a scope
/// prefix (e.g. `cnb-app:<path within the layer>`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Bom {
    pub name: String,

    #[serde(with = "base64_bytes")]
    pub raw: Vec<u8>,
}

impl PodConventionContext {
    pub fn new(name: String, template: PodTemplateSpec, image_config: Vec<ImageConfig>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ContextMeta { name },
            spec: PodConventionContextSpec {
                template,
                image_config,
            },
            status: PodConventionContextStatus::default(),
        }
    }
}

/// Kubernetes serializes `[]byte` as a base64 string.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
