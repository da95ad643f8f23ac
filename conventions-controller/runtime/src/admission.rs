use crate::validation;
use anyhow::Result;
use conventions_controller_k8s_api::convention::{ClusterPodConvention, ClusterPodConventionSpec};
use conventions_controller_k8s_api::intent::{PodIntent, PodIntentSpec, DEFAULT_SERVICE_ACCOUNT};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{core::DynamicObject, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Admission {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read admission request body: {0}")]
    Body(#[from] hyper::Error),

    #[error("failed to serialize admission review: {0}")]
    Encode(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

/// Validates a spec and produces the JSON-patch operations that default it.
trait Admit<T> {
    fn validate(&self, spec: &T) -> Result<()>;

    fn default_patch(&self, spec: &T) -> Vec<serde_json::Value>;
}

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        Box::pin(self.clone().handle(req))
    }
}

impl Admission {
    pub fn new() -> Self {
        Self {}
    }

    /// Serves the admission endpoint: reviews POSTed to `/` are admitted;
    /// every other route is not found.
    async fn handle(self, req: Request<hyper::body::Incoming>) -> Result<Response<Body>, Error> {
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            let rsp = Response::builder()
                .status(http::StatusCode::NOT_FOUND)
                .body(Body::default())
                .expect("static response is well-formed");
            return Ok(rsp);
        }

        let body = req.into_body().collect().await?.to_bytes();
        let review = match serde_json::from_slice::<Review>(&body) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "Failed to decode admission review");
                return encode_review(AdmissionResponse::invalid(error).into_review());
            }
        };

        let rsp = match AdmissionRequest::try_from(review) {
            Ok(req) => self.admit(req),
            Err(error) => {
                warn!(%error, "Malformed admission request");
                AdmissionResponse::invalid(error)
            }
        };
        debug!(allowed = rsp.allowed, "Reviewed");
        encode_review(rsp.into_review())
    }

    fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        if is_kind::<PodIntent>(&req) {
            return self.admit_spec::<PodIntentSpec>(req);
        }

        if is_kind::<ClusterPodConvention>(&req) {
            return self.admit_spec::<ClusterPodConventionSpec>(req);
        }

        AdmissionResponse::invalid(format_args!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    fn admit_spec<T>(&self, req: AdmissionRequest) -> AdmissionResponse
    where
        T: DeserializeOwned,
        Self: Admit<T>,
    {
        let rsp = AdmissionResponse::from(&req);
        let kind = req.kind.kind.clone();

        let (obj, spec) = match parse_spec::<T>(req) {
            Ok(parsed) => parsed,
            Err(error) => {
                info!(%kind, %error, "Rejecting unparseable spec");
                return rsp.deny(error);
            }
        };

        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        if let Err(error) = self.validate(&spec) {
            info!(%kind, %namespace, %name, %error, "Denied");
            return rsp.deny(error);
        }

        let operations = self.default_patch(&spec);
        if operations.is_empty() {
            return rsp;
        }
        let patch = match serde_json::from_value(serde_json::Value::Array(operations)) {
            Ok(patch) => patch,
            Err(error) => {
                warn!(%error, %kind, "Failed to build defaulting patch");
                return rsp;
            }
        };
        match rsp.with_patch(patch) {
            Ok(rsp) => rsp,
            Err(error) => {
                warn!(%error, %kind, "Failed to encode defaulting patch");
                AdmissionResponse::invalid(error)
            }
        }
    }
}

impl Admit<PodIntentSpec> for Admission {
    fn validate(&self, spec: &PodIntentSpec) -> Result<()> {
        validation::validate_pod_intent(spec)
    }

    fn default_patch(&self, spec: &PodIntentSpec) -> Vec<serde_json::Value> {
        let mut operations = Vec::new();
        if spec.service_account_name.as_deref().unwrap_or("").is_empty() {
            operations.push(serde_json::json!({
                "op": "add",
                "path": "/spec/serviceAccountName",
                "value": DEFAULT_SERVICE_ACCOUNT,
            }));
        }
        operations
    }
}

impl Admit<ClusterPodConventionSpec> for Admission {
    fn validate(&self, spec: &ClusterPodConventionSpec) -> Result<()> {
        validation::validate_cluster_convention(spec)
    }

    fn default_patch(&self, spec: &ClusterPodConventionSpec) -> Vec<serde_json::Value> {
        let mut operations = Vec::new();
        if spec.priority.is_none() {
            operations.push(serde_json::json!({
                "op": "add",
                "path": "/spec/priority",
                "value": "Normal",
            }));
        }
        if spec.selector_target.is_none() {
            operations.push(serde_json::json!({
                "op": "add",
                "path": "/spec/selectorTarget",
                "value": "PodTemplateSpec",
            }));
        }
        if let Some(service) = spec.webhook.as_ref().and_then(|w| w.client_config.service.as_ref())
        {
            if service.port.is_none() {
                operations.push(serde_json::json!({
                    "op": "add",
                    "path": "/spec/webhook/clientConfig/service/port",
                    "value": 443,
                }));
            }
        }
        operations
    }
}

impl Default for Admission {
    fn default() -> Self {
        Self::new()
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = T::DynamicType::default();
    req.kind.group == T::group(&dt).as_ref() && req.kind.kind == T::kind(&dt).as_ref()
}

fn encode_review(review: Review) -> Result<Response<Body>, Error> {
    let body = serde_json::to_vec(&review)?;
    let rsp = Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("admission review response is well-formed");
    Ok(rsp)
}

fn parse_spec<T: DeserializeOwned>(req: AdmissionRequest) -> Result<(DynamicObject, T)> {
    let obj = req
        .object
        .ok_or_else(|| anyhow::anyhow!("admission request has no object"))?;
    let data = obj
        .data
        .get("spec")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("{} {:?} has no spec", req.kind.kind, obj.name_any()))?;
    let spec = serde_json::from_value(data)?;
    Ok((obj, spec))
}
