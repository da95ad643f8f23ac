#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Library for convention-server authors: the wire schema exchanged with the
//! controller and an HTTPS server that hot-reloads its serving certificate.
//!
//! A convention server mounts `tls.crt`/`tls.key` (typically issued by
//! cert-manager), implements a [`Convention`] over the pod template and its
//! image metadata, and serves it:
//!
//! ```no_run
//! use conventions_webhook::{ConventionServer, ImageConfig};
//! use k8s_openapi::api::core::v1::PodTemplateSpec;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let convention = |template: &mut PodTemplateSpec, _images: &[ImageConfig]| {
//!     if let Some(spec) = template.spec.as_mut() {
//!         for container in spec.containers.iter_mut() {
//!             container.image.get_or_insert_with(|| "ubuntu".to_string());
//!         }
//!     }
//!     Ok::<_, anyhow::Error>(vec!["default-image".to_string()])
//! };
//! ConventionServer::new(([0, 0, 0, 0], 9443).into(), "/config/certs")
//!     .serve(convention, std::future::pending())
//!     .await
//! # }
//! ```

mod api;
mod cert;
mod server;

pub use self::api::{
    Bom, ContextMeta, ImageConfig, PodConventionContext, PodConventionContextSpec,
    PodConventionContextStatus, API_VERSION, KIND,
};
pub use self::cert::CertWatcher;
pub use self::server::{Convention, ConventionServer};

/// Where serving certificates are conventionally mounted.
pub const CERT_MOUNT_PATH: &str = "/config/certs";
