//! Field validation for the conventions CRDs. These rules back the admission
//! server; the messages name the offending field path so they surface
//! usefully in `kubectl` output.

use anyhow::{bail, Result};
use conventions_controller_k8s_api::convention::{
    CertificateRef, ClientConfig, ClusterPodConventionSpec, ServiceRef,
};
use conventions_controller_k8s_api::intent::PodIntentSpec;

pub fn validate_pod_intent(spec: &PodIntentSpec) -> Result<()> {
    for (i, secret) in spec.image_pull_secrets.iter().enumerate() {
        if secret.name.as_deref().unwrap_or("").is_empty() {
            bail!("spec.imagePullSecrets[{i}].name: required");
        }
    }
    Ok(())
}

pub fn validate_cluster_convention(spec: &ClusterPodConventionSpec) -> Result<()> {
    for (i, selector) in spec.selectors.iter().enumerate() {
        if let Err(error) = selector.validate() {
            bail!("spec.selectors[{i}]: invalid label selector: {error}");
        }
    }

    let Some(webhook) = spec.webhook.as_ref() else {
        bail!("spec.webhook: required");
    };

    validate_client_config(&webhook.client_config)?;

    if let Some(certificate) = webhook.certificate.as_ref() {
        validate_certificate_ref(certificate)?;
    }

    Ok(())
}

fn validate_client_config(client_config: &ClientConfig) -> Result<()> {
    match (client_config.url.as_ref(), client_config.service.as_ref()) {
        (Some(_), Some(_)) => {
            bail!("spec.webhook.clientConfig.[url, service]: expected exactly one, got both")
        }
        (None, None) => {
            bail!("spec.webhook.clientConfig.[url, service]: expected exactly one, got neither")
        }
        (Some(url), None) => validate_url(url),
        (None, Some(service)) => validate_service(service),
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = match url::Url::parse(url) {
        Ok(parsed) => parsed,
        Err(error) => bail!("spec.webhook.clientConfig.url: invalid URL {url:?}: {error}"),
    };
    if parsed.scheme() != "https" {
        bail!(
            "spec.webhook.clientConfig.url: scheme must be \"https\", got {:?}",
            parsed.scheme(),
        );
    }
    if parsed.host_str().is_none() {
        bail!("spec.webhook.clientConfig.url: host is required");
    }
    Ok(())
}

fn validate_service(service: &ServiceRef) -> Result<()> {
    if service.name.is_empty() {
        bail!("spec.webhook.clientConfig.service.name: required");
    }
    if service.namespace.is_empty() {
        bail!("spec.webhook.clientConfig.service.namespace: required");
    }
    if let Some(port) = service.port {
        if !(1..=65535).contains(&port) {
            bail!("spec.webhook.clientConfig.service.port: must be between 1 and 65535");
        }
    }
    Ok(())
}

fn validate_certificate_ref(certificate: &CertificateRef) -> Result<()> {
    if certificate.namespace.is_empty() {
        bail!("spec.webhook.certificate.namespace: required");
    }
    if certificate.name.is_empty() {
        bail!("spec.webhook.certificate.name: required");
    }
    Ok(())
}
