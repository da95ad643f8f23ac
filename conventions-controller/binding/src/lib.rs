#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The PodIntent reconciliation pipeline: convention records resolved against
//! OCI image metadata and dispatched to convention servers.

mod cache;
mod convention;
mod conventions;
mod image;
mod image_config;
mod metrics;
mod oci;
mod registry;

pub use self::cache::BlobCache;
pub use self::convention::{ClientConfig, Convention, ConventionError, ServiceRef};
pub use self::conventions::{ApplyError, Conventions, FilterError};
pub use self::image::{ImageRef, InvalidReference};
pub use self::image_config::{ImageError, ImageErrors, ImageResolver, RegistryConfig};
pub use self::metrics::PipelineMetrics;
pub use self::oci::OciError;
pub use self::registry::{BasicAuth, Keychain};
pub use conventions_webhook::{Bom, ImageConfig, PodConventionContext};
