//! Image metadata resolution: every distinct image reference in a template is
//! pinned to its digest and resolved to an [`ImageConfig`] carrying the OCI
//! config file and any SBOM files packed into the image's designated layer.

use crate::cache::BlobCache;
use crate::image::{ImageRef, InvalidReference};
use crate::metrics::PipelineMetrics;
use crate::oci::{OciError, RegistryClient, ResolvedImage};
use crate::registry::Keychain;
use conventions_webhook::{Bom, ImageConfig};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use oci_spec::image::ImageConfiguration;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Label carrying the SBOM layer diff-id directly.
const SBOM_LABEL: &str = "io.buildpacks.app.sbom";

/// Lifecycle metadata label consulted when the direct label is absent.
const LIFECYCLE_METADATA_LABEL: &str = "io.buildpacks.lifecycle.metadata";

/// Scope prefix for SBOM entries extracted from the application layer.
const SBOM_PREFIX: &str = "cnb-app";

/// Inputs for building an [`ImageResolver`]; scoped to a single
/// reconciliation.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub keychain: Keychain,
    pub cache_dir: Option<PathBuf>,
    pub ca_cert_path: Option<PathBuf>,
    pub timeout: Duration,
}

pub struct ImageResolver {
    client: RegistryClient,
    cache: Option<BlobCache>,
    metrics: PipelineMetrics,
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error(transparent)]
    Reference(#[from] InvalidReference),

    #[error(transparent)]
    Registry(#[from] OciError),

    #[error("failed to parse buildpack lifecycle metadata: {0}")]
    LifecycleMetadata(#[source] serde_json::Error),

    #[error("image has no layer with diff id {0}")]
    MissingSbomLayer(String),

    #[error("failed to read SBOM layer: {0}")]
    Layer(#[from] std::io::Error),

    #[error("failed to read registry CA bundle: {0}")]
    CaCert(#[source] std::io::Error),

    #[error("failed to build registry transport: {0}")]
    Transport(#[source] reqwest::Error),
}

/// Per-image failures accumulated across one resolution pass, keyed by the
/// reference as written in the template.
#[derive(Debug)]
pub struct ImageErrors(BTreeMap<String, ImageError>);

// === impl ImageErrors ===

impl std::error::Error for ImageErrors {}

impl std::fmt::Display for ImageErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (image, error) in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "image: {image:?} error: {error}")?;
            first = false;
        }
        Ok(())
    }
}

// === impl ImageResolver ===

impl ImageResolver {
    pub fn new(config: RegistryConfig, metrics: PipelineMetrics) -> Result<Self, ImageError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout);

        if let Some(path) = &config.ca_cert_path {
            let pem = std::fs::read(path).map_err(ImageError::CaCert)?;
            for cert in
                reqwest::Certificate::from_pem_bundle(&pem).map_err(ImageError::Transport)?
            {
                builder = builder.add_root_certificate(cert);
            }
        }

        let http = builder.build().map_err(ImageError::Transport)?;
        Ok(Self {
            client: RegistryClient::new(http, config.keychain),
            cache: config.cache_dir.map(BlobCache::new),
            metrics,
        })
    }

    /// Resolves metadata for every distinct image reference in the template's
    /// init and main containers, then rewrites those references to their
    /// digest-pinned form. Per-image failures are collected; any failure
    /// leaves the template untouched.
    pub async fn resolve_image_metadata(
        &self,
        template: &mut PodTemplateSpec,
    ) -> Result<Vec<ImageConfig>, ImageErrors> {
        let images = collect_images(template);

        let mut configs = Vec::with_capacity(images.len());
        let mut pinned = HashMap::new();
        let mut errors = BTreeMap::new();
        for image in &images {
            match self.resolve_one(image).await {
                Ok(config) => {
                    pinned.insert(image.clone(), config.image.clone());
                    configs.push(config);
                }
                Err(error) => {
                    errors.insert(image.clone(), error);
                }
            }
        }
        if !errors.is_empty() {
            self.metrics.image_resolution("error");
            return Err(ImageErrors(errors));
        }
        self.metrics.image_resolution("ok");

        update_images(template, &pinned);
        Ok(configs)
    }

    async fn resolve_one(&self, image: &str) -> Result<ImageConfig, ImageError> {
        let reference = ImageRef::parse(image)?;
        let resolved = self
            .client
            .resolve(&reference, self.cache.as_ref())
            .await?;

        let boms = match sbom_diff_id(&resolved.config)? {
            Some(diff_id) => self.load_sboms(&reference, &resolved, &diff_id).await?,
            None => Vec::new(),
        };

        let pinned = reference.pinned(&resolved.digest);
        debug!(image = %reference, %pinned, "Resolved image");

        Ok(ImageConfig {
            image: pinned,
            boms,
            config: resolved.config,
        })
    }

    /// Locates the layer whose diff-id matches, fetches it, and extracts
    /// every regular file as an SBOM entry, preserving tar order.
    async fn load_sboms(
        &self,
        reference: &ImageRef,
        resolved: &ResolvedImage,
        diff_id: &str,
    ) -> Result<Vec<Bom>, ImageError> {
        // Layers and diff-ids correspond positionally: diff-ids describe the
        // uncompressed layers in the same order the manifest lists them.
        let index = resolved
            .config
            .rootfs()
            .diff_ids()
            .iter()
            .position(|id| id == diff_id)
            .ok_or_else(|| ImageError::MissingSbomLayer(diff_id.to_string()))?;
        let descriptor = resolved
            .manifest
            .layers()
            .get(index)
            .ok_or_else(|| ImageError::MissingSbomLayer(diff_id.to_string()))?;

        let compressed = self
            .client
            .blob(reference, descriptor.digest().as_str(), self.cache.as_ref())
            .await?;

        let media_type = descriptor.media_type().to_string();
        if media_type.contains("gzip") {
            let decoder = flate2::read::GzDecoder::new(&compressed[..]);
            untar_sboms(decoder, SBOM_PREFIX)
        } else {
            untar_sboms(&compressed[..], SBOM_PREFIX)
        }
    }
}

/// Distinct image references, init containers first, in declaration order.
fn collect_images(template: &PodTemplateSpec) -> Vec<String> {
    let mut images = Vec::new();
    let Some(spec) = template.spec.as_ref() else {
        return images;
    };
    let init = spec.init_containers.iter().flatten();
    for container in init.chain(spec.containers.iter()) {
        if let Some(image) = container.image.as_deref() {
            if !image.is_empty() && !images.iter().any(|i| i == image) {
                images.push(image.to_string());
            }
        }
    }
    images
}

/// Rewrites every occurrence of a resolved reference to its pinned form.
fn update_images(template: &mut PodTemplateSpec, pinned: &HashMap<String, String>) {
    let Some(spec) = template.spec.as_mut() else {
        return;
    };
    let init = spec.init_containers.iter_mut().flatten();
    for container in init.chain(spec.containers.iter_mut()) {
        if let Some(image) = container.image.as_ref() {
            if let Some(resolved) = pinned.get(image) {
                container.image = Some(resolved.clone());
            }
        }
    }
}

/// Finds the diff-id of the SBOM layer, if the image declares one: the
/// shortcut label wins; otherwise the lifecycle metadata's `sbom.sha` (or
/// legacy `bom.sha`) is consulted.
fn sbom_diff_id(config: &ImageConfiguration) -> Result<Option<String>, ImageError> {
    let Some(labels) = config
        .config()
        .as_ref()
        .and_then(|c| c.labels().as_ref())
    else {
        return Ok(None);
    };

    if let Some(diff_id) = labels.get(SBOM_LABEL).filter(|id| !id.is_empty()) {
        return Ok(Some(diff_id.clone()));
    }

    let Some(metadata) = labels
        .get(LIFECYCLE_METADATA_LABEL)
        .filter(|md| !md.is_empty())
    else {
        return Ok(None);
    };

    #[derive(Default, Deserialize)]
    struct Sha {
        #[serde(default)]
        sha: String,
    }
    #[derive(Default, Deserialize)]
    struct LifecycleMetadata {
        #[serde(default)]
        sbom: Sha,

        #[serde(default)]
        bom: Sha,
    }

    let md: LifecycleMetadata =
        serde_json::from_str(metadata).map_err(ImageError::LifecycleMetadata)?;
    let diff_id = if md.sbom.sha.is_empty() {
        md.bom.sha
    } else {
        md.sbom.sha
    };
    Ok(Some(diff_id).filter(|id| !id.is_empty()))
}

/// Emits one [`Bom`] per regular file in the tar stream, in iteration order.
fn untar_sboms(reader: impl Read, prefix: &str) -> Result<Vec<Bom>, ImageError> {
    let mut boms = Vec::new();
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = format!("{}:{}", prefix, entry.path()?.display());
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw)?;
        boms.push(Bom { name, raw });
    }
    Ok(boms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_labels(labels: serde_json::Value) -> ImageConfiguration {
        serde_json::from_value(serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Labels": labels},
            "rootfs": {
                "type": "layers",
                "diff_ids": [
                    "sha256:1111111111111111111111111111111111111111111111111111111111111111",
                    "sha256:2222222222222222222222222222222222222222222222222222222222222222",
                ],
            },
        }))
        .expect("config must parse")
    }

    #[test]
    fn sbom_label_wins() {
        let config = config_with_labels(serde_json::json!({
            "io.buildpacks.app.sbom": "sha256:aaa",
            "io.buildpacks.lifecycle.metadata": r#"{"sbom": {"sha": "sha256:bbb"}}"#,
        }));
        assert_eq!(
            sbom_diff_id(&config).expect("must resolve"),
            Some("sha256:aaa".to_string()),
        );
    }

    #[test]
    fn lifecycle_metadata_fallback_prefers_sbom_over_bom() {
        let config = config_with_labels(serde_json::json!({
            "io.buildpacks.lifecycle.metadata":
                r#"{"sbom": {"sha": "sha256:bbb"}, "bom": {"sha": "sha256:ccc"}}"#,
        }));
        assert_eq!(
            sbom_diff_id(&config).expect("must resolve"),
            Some("sha256:bbb".to_string()),
        );

        let config = config_with_labels(serde_json::json!({
            "io.buildpacks.lifecycle.metadata": r#"{"bom": {"sha": "sha256:ccc"}}"#,
        }));
        assert_eq!(
            sbom_diff_id(&config).expect("must resolve"),
            Some("sha256:ccc".to_string()),
        );
    }

    #[test]
    fn absent_labels_mean_no_sbom() {
        let config = config_with_labels(serde_json::json!({}));
        assert_eq!(sbom_diff_id(&config).expect("must resolve"), None);

        let config = config_with_labels(serde_json::json!({
            "io.buildpacks.lifecycle.metadata": r#"{"sbom": {"sha": ""}}"#,
        }));
        assert_eq!(sbom_diff_id(&config).expect("must resolve"), None);
    }

    #[test]
    fn malformed_lifecycle_metadata_is_an_error() {
        let config = config_with_labels(serde_json::json!({
            "io.buildpacks.lifecycle.metadata": "not json",
        }));
        assert!(matches!(
            sbom_diff_id(&config),
            Err(ImageError::LifecycleMetadata(_)),
        ));
    }

    #[test]
    fn untar_extracts_regular_files_in_order() {
        let mut builder = tar::Builder::new(Vec::new());

        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_path("layers/").expect("path");
        dir.set_size(0);
        dir.set_cksum();
        builder.append(&dir, std::io::empty()).expect("dir");

        for (path, contents) in [
            ("layers/sbom.cdx.json", br#"{"a":1}"#.as_slice()),
            ("layers/sbom.spdx.json", br#"{"b":2}"#.as_slice()),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).expect("path");
            header.set_size(contents.len() as u64);
            header.set_cksum();
            builder.append(&header, contents).expect("file");
        }
        let archive = builder.into_inner().expect("archive");

        let boms = untar_sboms(&archive[..], "cnb-app").expect("untar");
        assert_eq!(boms.len(), 2);
        assert_eq!(boms[0].name, "cnb-app:layers/sbom.cdx.json");
        assert_eq!(boms[0].raw, br#"{"a":1}"#);
        assert_eq!(boms[1].name, "cnb-app:layers/sbom.spdx.json");
    }

    fn template(init: &[&str], main: &[&str]) -> PodTemplateSpec {
        serde_json::from_value(serde_json::json!({
            "spec": {
                "initContainers": init
                    .iter()
                    .enumerate()
                    .map(|(i, image)| serde_json::json!({"name": format!("init-{i}"), "image": image}))
                    .collect::<Vec<_>>(),
                "containers": main
                    .iter()
                    .enumerate()
                    .map(|(i, image)| serde_json::json!({"name": format!("main-{i}"), "image": image}))
                    .collect::<Vec<_>>(),
            },
        }))
        .expect("template must parse")
    }

    #[test]
    fn collects_distinct_images_init_first() {
        let template = template(&["setup", "shared"], &["shared", "app"]);
        assert_eq!(collect_images(&template), vec!["setup", "shared", "app"]);
    }

    #[test]
    fn updates_every_occurrence_of_a_pinned_reference() {
        let mut template = template(&["shared"], &["shared", "app"]);
        let pinned = HashMap::from([(
            "shared".to_string(),
            "index.docker.io/library/shared:latest@sha256:beef".to_string(),
        )]);
        update_images(&mut template, &pinned);

        let spec = template.spec.as_ref().expect("spec");
        let init = spec.init_containers.as_ref().expect("init");
        assert_eq!(
            init[0].image.as_deref(),
            Some("index.docker.io/library/shared:latest@sha256:beef"),
        );
        assert_eq!(
            spec.containers[0].image.as_deref(),
            Some("index.docker.io/library/shared:latest@sha256:beef"),
        );
        assert_eq!(spec.containers[1].image.as_deref(), Some("app"));
    }
}
