#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cert_manager;
pub mod condition;
pub mod convention;
pub mod intent;
pub mod labels;

pub use self::labels::Labels;
pub use k8s_openapi::{
    api::core::v1::{
        Container, LocalObjectReference, PodSpec, PodTemplateSpec, Secret, ServiceAccount,
    },
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    ByteString,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    Client, Error,
};

/// API group served by this controller's resources.
pub const API_GROUP: &str = "conventions.carto.run";

/// Annotation recording the conventions applied to a template, one
/// `<convention>/<id>` entry per line.
pub const APPLIED_CONVENTIONS_ANNOTATION: &str = "conventions.carto.run/applied-conventions";
