//! The convention-server HTTPS endpoint: decodes a [`PodConventionContext`],
//! hands the template and image metadata to the registered convention, and
//! returns the mutated context.

use crate::api::{ImageConfig, PodConventionContext};
use crate::cert::CertWatcher;
use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// A convention mutates the template in place and reports the identifiers of
/// what it applied.
pub trait Convention: Send + Sync + 'static {
    fn apply(
        &self,
        template: &mut PodTemplateSpec,
        images: &[ImageConfig],
    ) -> Result<Vec<String>>;
}

impl<F> Convention for F
where
    F: Fn(&mut PodTemplateSpec, &[ImageConfig]) -> Result<Vec<String>> + Send + Sync + 'static,
{
    fn apply(
        &self,
        template: &mut PodTemplateSpec,
        images: &[ImageConfig],
    ) -> Result<Vec<String>> {
        self(template, images)
    }
}

pub struct ConventionServer {
    addr: SocketAddr,
    certs: Arc<CertWatcher>,
}

// === impl ConventionServer ===

impl ConventionServer {
    pub fn new(addr: SocketAddr, cert_dir: impl AsRef<Path>) -> Self {
        Self {
            addr,
            certs: Arc::new(CertWatcher::new(cert_dir)),
        }
    }

    /// Serves the convention over TLS 1.3 until the shutdown future resolves.
    /// The serving certificate is reloaded on a timer and on file changes.
    pub async fn serve(
        self,
        convention: impl Convention,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<()> {
        self.certs.load()?;

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(());
        tokio::spawn(self.certs.clone().watch(stop_rx));

        let convention: Arc<dyn Convention> = Arc::new(convention);
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Convention server listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            warn!(%error, "Failed to accept connection");
                            continue;
                        }
                    };
                    let config = self
                        .certs
                        .config()
                        .expect("serving config is loaded before accepting");
                    let convention = convention.clone();
                    tokio::spawn(async move {
                        let acceptor = TlsAcceptor::from(config);
                        let tls = match acceptor.accept(stream).await {
                            Ok(tls) => tls,
                            Err(error) => {
                                debug!(%peer, %error, "TLS handshake failed");
                                return;
                            }
                        };
                        let service = service_fn(move |req| {
                            let convention = convention.clone();
                            async move { handle(req, &*convention).await }
                        });
                        if let Err(error) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(tls), service)
                            .await
                        {
                            debug!(%peer, %error, "Connection error");
                        }
                    });
                }
                _ = &mut shutdown => break,
            }
        }

        drop(stop_tx);
        Ok(())
    }
}

async fn handle<B>(
    req: Request<B>,
    convention: &dyn Convention,
) -> std::result::Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body + Unpin,
    B::Error: std::fmt::Display,
{
    if req.method() == Method::GET && req.uri().path() == "/healthz" {
        return Ok(status_response(StatusCode::OK));
    }
    if req.method() != Method::POST {
        return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
    }

    let body = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(error) => {
            warn!(%error, "Failed to read request body");
            return Ok(status_response(StatusCode::BAD_REQUEST));
        }
    };

    let mut context: PodConventionContext = match serde_json::from_slice(&body) {
        Ok(context) => context,
        Err(error) => {
            warn!(%error, "Failed to decode PodConventionContext");
            return Ok(status_response(StatusCode::BAD_REQUEST));
        }
    };

    let mut template = context.spec.template.clone();
    let applied = match convention.apply(&mut template, &context.spec.image_config) {
        Ok(applied) => applied,
        Err(error) => {
            warn!(%error, "Convention failed");
            return Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR));
        }
    };
    context.status.template = template;
    context.status.applied_conventions = applied;

    let body = match serde_json::to_vec(&context) {
        Ok(body) => body,
        Err(error) => {
            warn!(%error, "Failed to encode response");
            return Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR));
        }
    };
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("response must be valid"))
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::default())
        .expect("response must be valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PodConventionContext {
        serde_json::from_value(serde_json::json!({
            "apiVersion": crate::api::API_VERSION,
            "kind": crate::api::KIND,
            "metadata": {"name": "upper-env-var"},
            "spec": {
                "template": {
                    "spec": {"containers": [{"name": "test-workload", "image": "ubuntu"}]},
                },
                "imageConfig": [],
            },
        }))
        .expect("context must parse")
    }

    struct AddEnv;

    impl Convention for AddEnv {
        fn apply(
            &self,
            template: &mut PodTemplateSpec,
            _images: &[ImageConfig],
        ) -> Result<Vec<String>> {
            let spec = template.spec.as_mut().expect("spec");
            let env = spec.containers[0].env.get_or_insert_with(Vec::new);
            env.push(k8s_openapi::api::core::v1::EnvVar {
                name: "KEY".to_string(),
                value: Some("VALUE".to_string()),
                ..Default::default()
            });
            Ok(vec!["default-label".to_string()])
        }
    }

    #[tokio::test]
    async fn applies_the_convention_and_reports_ids() {
        let body = serde_json::to_vec(&context()).expect("encode");
        let req = Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(Full::new(Bytes::from(body)))
            .expect("request");

        let rsp = handle(req, &AddEnv).await.expect("handle");
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(
            rsp.headers()
                .get(hyper::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("application/json"),
        );

        let body = rsp.into_body().collect().await.expect("body").to_bytes();
        let cx: PodConventionContext = serde_json::from_slice(&body).expect("decode");
        assert_eq!(cx.status.applied_conventions, vec!["default-label"]);
        let env = cx.status.template.spec.as_ref().expect("spec").containers[0]
            .env
            .as_ref()
            .expect("env");
        assert_eq!(env[0].name, "KEY");
        assert_eq!(env[0].value.as_deref(), Some("VALUE"));
    }

    #[tokio::test]
    async fn health_probe_returns_ok() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/healthz")
            .body(Full::<Bytes>::default())
            .expect("request");
        let rsp = handle(req, &AddEnv).await.expect("handle");
        assert_eq!(rsp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_undecodable_bodies() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(Full::new(Bytes::from_static(b"not json")))
            .expect("request");
        let rsp = handle(req, &AddEnv).await.expect("handle");
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failing_conventions_surface_a_server_error() {
        struct Failing;
        impl Convention for Failing {
            fn apply(
                &self,
                _template: &mut PodTemplateSpec,
                _images: &[ImageConfig],
            ) -> Result<Vec<String>> {
                anyhow::bail!("nope")
            }
        }

        let body = serde_json::to_vec(&context()).expect("encode");
        let req = Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(Full::new(Bytes::from(body)))
            .expect("request");
        let rsp = handle(req, &Failing).await.expect("handle");
        assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
