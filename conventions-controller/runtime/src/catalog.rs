//! Resolution of the cluster's convention catalog: listing, defaulting, and
//! dynamic CA trust-bundle assembly.

use conventions_controller_binding::{ClientConfig, Convention, Conventions, ServiceRef};
use conventions_controller_k8s_api::cert_manager::CertificateRequest;
use conventions_controller_k8s_api::convention::{CertificateRef, ClusterPodConvention};
use conventions_controller_k8s_api::{Api, Client, ListParams, ResourceExt};
use tracing::debug;

/// Certificates roll; trusting the most recent issuances lets a convention
/// server keep serving with a slightly older key while a new one is being
/// established.
const MAX_BUNDLED_CAS: usize = 3;

/// The catalog either resolves, or fails the intent with a terminal condition
/// (listing failures propagate as transient errors instead).
pub enum CatalogOutcome {
    Resolved(Conventions),
    Failed { message: String },
}

#[derive(Debug, thiserror::Error)]
#[error(
    "unable to find valid \"CertificateRequests\" for certificate \"{namespace}/{name}\" \
     configured in convention \"{convention}\""
)]
pub struct NoValidCertificateRequests {
    namespace: String,
    name: String,
    convention: String,
}

/// Lists all cluster conventions, applies defaulting, and resolves each
/// webhook certificate reference into a CA bundle.
pub async fn resolve_conventions(client: &Client) -> Result<CatalogOutcome, kube::Error> {
    let api = Api::<ClusterPodConvention>::all(client.clone());
    let sources = api.list(&ListParams::default()).await?;

    let mut conventions = Vec::with_capacity(sources.items.len());
    for mut source in sources.items {
        source.spec.default_values();
        let name = source.name_any();

        let mut client_config = ClientConfig::default();
        if let Some(webhook) = source.spec.webhook.as_ref() {
            client_config.url = webhook.client_config.url.clone();
            client_config.service = webhook.client_config.service.as_ref().map(|s| ServiceRef {
                namespace: s.namespace.clone(),
                name: s.name.clone(),
                path: s.path.clone(),
                port: s.port.unwrap_or(443),
            });
            client_config.ca_bundle = webhook
                .client_config
                .ca_bundle
                .as_ref()
                .map(|b| b.0.clone())
                .unwrap_or_default();

            if let Some(certificate) = webhook.certificate.as_ref() {
                match ca_bundle(client, certificate, &name).await {
                    Ok(bundle) => client_config.ca_bundle = bundle,
                    Err(TrustBundleError::Kube(error)) => return Err(error),
                    Err(TrustBundleError::NoValidRequests(error)) => {
                        return Ok(CatalogOutcome::Failed {
                            message: format!("failed to authenticate: {error}"),
                        });
                    }
                }
            }
        }

        debug!(convention = %name, "Resolved convention");
        conventions.push(Convention {
            name,
            priority: source.spec.priority(),
            selector_target: source.spec.selector_target(),
            selectors: source.spec.selectors.clone(),
            client_config,
        });
    }

    Ok(CatalogOutcome::Resolved(Conventions(conventions)))
}

#[derive(Debug, thiserror::Error)]
pub enum TrustBundleError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    NoValidRequests(#[from] NoValidCertificateRequests),
}

async fn ca_bundle(
    client: &Client,
    certificate: &CertificateRef,
    convention: &str,
) -> Result<Vec<u8>, TrustBundleError> {
    let api = Api::<CertificateRequest>::namespaced(client.clone(), &certificate.namespace);
    let requests = api.list(&ListParams::default()).await?;
    Ok(assemble_bundle(requests.items, certificate, convention)?)
}

/// Concatenates the CAs of the most recent ready certificate requests issued
/// for the certificate, newest first, at most [`MAX_BUNDLED_CAS`] of them.
/// Every CA blob is newline-terminated in the bundle.
pub fn assemble_bundle(
    requests: Vec<CertificateRequest>,
    certificate: &CertificateRef,
    convention: &str,
) -> Result<Vec<u8>, NoValidCertificateRequests> {
    let mut candidates: Vec<&CertificateRequest> = requests
        .iter()
        .filter(|req| req.certificate_name() == Some(certificate.name.as_str()))
        .filter(|req| req.ca().is_some())
        .filter(|req| req.is_ready())
        .collect();

    if candidates.is_empty() {
        return Err(NoValidCertificateRequests {
            namespace: certificate.namespace.clone(),
            name: certificate.name.clone(),
            convention: convention.to_string(),
        });
    }

    candidates.sort_by(|a, b| {
        b.metadata
            .creation_timestamp
            .cmp(&a.metadata.creation_timestamp)
    });

    let mut bundle = Vec::new();
    for request in candidates.into_iter().take(MAX_BUNDLED_CAS) {
        let ca = request.ca().expect("candidates carry a CA");
        bundle.extend_from_slice(ca);
        if !ca.ends_with(b"\n") {
            bundle.push(b'\n');
        }
    }
    Ok(bundle)
}
