//! Read-only view of cert-manager `CertificateRequest` resources, scoped to
//! the fields the trust-bundle assembly consumes. See
//! <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateRequest>.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation linking a request to the certificate it was issued for.
pub const CERTIFICATE_NAME_ANNOTATION: &str = "cert-manager.io/certificate-name";

#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "CertificateRequest",
    namespaced,
    status = "CertificateRequestStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub request: Option<k8s_openapi::ByteString>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// The issued certificate chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub certificate: Option<k8s_openapi::ByteString>,

    /// The CA of the issuer, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub ca: Option<k8s_openapi::ByteString>,
}

// === impl CertificateRequest ===

impl CertificateRequest {
    /// The certificate this request belongs to, per the cert-manager
    /// bookkeeping annotation.
    pub fn certificate_name(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()?
            .get(CERTIFICATE_NAME_ANNOTATION)
            .map(String::as_str)
    }

    pub fn ca(&self) -> Option<&[u8]> {
        self.status
            .as_ref()?
            .ca
            .as_ref()
            .map(|ca| ca.0.as_slice())
            .filter(|ca| !ca.is_empty())
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|status| {
                status
                    .conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn request(
        certificate: Option<&str>,
        ca: Option<&[u8]>,
        ready: bool,
    ) -> CertificateRequest {
        let mut req = CertificateRequest::new("req", CertificateRequestSpec::default());
        if let Some(name) = certificate {
            req.metadata.annotations = Some(
                [(CERTIFICATE_NAME_ANNOTATION.to_string(), name.to_string())]
                    .into_iter()
                    .collect(),
            );
        }
        req.status = Some(CertificateRequestStatus {
            conditions: vec![Condition {
                last_transition_time: Time(chrono::Utc::now()),
                message: String::new(),
                observed_generation: None,
                reason: "Issued".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                type_: "Ready".to_string(),
            }],
            certificate: None,
            ca: ca.map(|ca| k8s_openapi::ByteString(ca.to_vec())),
        });
        req
    }

    #[test]
    fn reads_certificate_annotation() {
        assert_eq!(
            request(Some("conv-cert"), None, true).certificate_name(),
            Some("conv-cert"),
        );
        assert_eq!(request(None, None, true).certificate_name(), None);
    }

    #[test]
    fn empty_ca_is_absent() {
        assert!(request(None, Some(b""), true).ca().is_none());
        assert_eq!(request(None, Some(b"pem"), true).ca(), Some(&b"pem"[..]));
    }

    #[test]
    fn readiness_requires_true_ready_condition() {
        assert!(request(None, None, true).is_ready());
        assert!(!request(None, None, false).is_ready());
    }
}
