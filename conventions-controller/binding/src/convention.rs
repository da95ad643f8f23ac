//! A single resolved convention and the webhook call that applies it.

use conventions_webhook::PodConventionContext;
use conventions_controller_k8s_api::convention::{Priority, SelectorTarget};
use conventions_controller_k8s_api::labels;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use url::Url;

/// The runtime form of a `ClusterPodConvention`, fully defaulted, with any
/// dynamic CA bundle already resolved.
#[derive(Clone, Debug)]
pub struct Convention {
    pub name: String,
    pub priority: Priority,
    pub selector_target: SelectorTarget,
    pub selectors: Vec<labels::Selector>,
    pub client_config: ClientConfig,
}

#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub url: Option<String>,
    pub service: Option<ServiceRef>,

    /// PEM roots trusted when calling the server. Empty means system roots.
    pub ca_bundle: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
    pub path: Option<String>,
    pub port: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConventionError {
    #[error("client config names neither a url nor a service")]
    MissingEndpoint,

    #[error("invalid endpoint url: {0}")]
    Endpoint(#[from] url::ParseError),

    #[error("invalid CA bundle: {0}")]
    CaBundle(#[source] reqwest::Error),

    #[error("failed to build https client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("server returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("server returned content-type {0:?}, expected \"application/json\"")]
    ContentType(String),

    #[error("failed to decode response: {0}")]
    Decode(#[source] reqwest::Error),
}

// === impl Convention ===

impl Convention {
    /// The URL this convention is dispatched to: the configured `url`, or the
    /// cluster-internal address of the configured service.
    pub fn endpoint(&self) -> Result<Url, ConventionError> {
        if let Some(url) = &self.client_config.url {
            return Ok(Url::parse(url)?);
        }
        let service = self
            .client_config
            .service
            .as_ref()
            .ok_or(ConventionError::MissingEndpoint)?;
        let mut url = Url::parse(&format!(
            "https://{}.{}.svc:{}",
            service.name, service.namespace, service.port,
        ))?;
        if let Some(path) = service.path.as_deref().filter(|p| !p.is_empty()) {
            url.set_path(path);
        }
        Ok(url)
    }

    /// POSTs the context to the convention server and returns the enriched
    /// context. Requires a 2xx response with a JSON content type.
    pub async fn apply(
        &self,
        context: &PodConventionContext,
        timeout: Duration,
    ) -> Result<PodConventionContext, ConventionError> {
        let url = self.endpoint()?;

        let mut builder = reqwest::Client::builder().use_rustls_tls().timeout(timeout);
        if !self.client_config.ca_bundle.is_empty() {
            for cert in reqwest::Certificate::from_pem_bundle(&self.client_config.ca_bundle)
                .map_err(ConventionError::CaBundle)?
            {
                builder = builder.add_root_certificate(cert);
            }
        }
        let client = builder.build().map_err(ConventionError::Client)?;

        let rsp = client
            .post(url)
            .json(context)
            .send()
            .await
            .map_err(ConventionError::Request)?;

        if !rsp.status().is_success() {
            return Err(ConventionError::Status(rsp.status()));
        }

        let content_type = rsp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("application/json") {
            return Err(ConventionError::ContentType(content_type));
        }

        rsp.json().await.map_err(ConventionError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convention(client_config: ClientConfig) -> Convention {
        Convention {
            name: "test".to_string(),
            priority: Priority::Normal,
            selector_target: SelectorTarget::PodTemplateSpec,
            selectors: vec![],
            client_config,
        }
    }

    #[test]
    fn url_endpoint_is_used_directly() {
        let c = convention(ClientConfig {
            url: Some("https://conv.example/apply".to_string()),
            ..ClientConfig::default()
        });
        assert_eq!(
            c.endpoint().expect("endpoint").as_str(),
            "https://conv.example/apply",
        );
    }

    #[test]
    fn service_endpoint_resolves_to_cluster_address() {
        let c = convention(ClientConfig {
            service: Some(ServiceRef {
                namespace: "conv-ns".to_string(),
                name: "conv".to_string(),
                path: Some("/apply".to_string()),
                port: 8443,
            }),
            ..ClientConfig::default()
        });
        assert_eq!(
            c.endpoint().expect("endpoint").as_str(),
            "https://conv.conv-ns.svc:8443/apply",
        );
    }

    #[test]
    fn service_endpoint_defaults_to_root_path() {
        let c = convention(ClientConfig {
            service: Some(ServiceRef {
                namespace: "conv-ns".to_string(),
                name: "conv".to_string(),
                path: None,
                port: 443,
            }),
            ..ClientConfig::default()
        });
        // 443 is the https default, so the parsed URL elides it.
        assert_eq!(
            c.endpoint().expect("endpoint").as_str(),
            "https://conv.conv-ns.svc/",
        );
    }

    #[test]
    fn empty_client_config_has_no_endpoint() {
        let c = convention(ClientConfig::default());
        assert!(matches!(
            c.endpoint(),
            Err(ConventionError::MissingEndpoint),
        ));
    }
}
