//! The PodIntent reconciler: resolves the convention catalog, builds registry
//! credentials, filters and orders conventions, dispatches them, and projects
//! the result onto the intent's status.
//!
//! Input-shaped failures (missing service account, bad selector, unresolved
//! certificate, image resolution) are recorded as conditions and do not
//! propagate; only API transport failures bubble up into the work queue's
//! backoff.

use crate::catalog::{self, CatalogOutcome};
use crate::metrics::Metrics;
use crate::tracker::{Key, Kind, Tracker};
use conventions_controller_binding::{ApplyError, ImageResolver, Keychain, RegistryConfig};
use conventions_controller_k8s_api::condition::Conditions;
use conventions_controller_k8s_api::convention::SelectorTarget;
use conventions_controller_k8s_api::intent::{PodIntent, PodIntentStatus};
use conventions_controller_k8s_api::{
    Api, Client, Labels, Patch, PatchParams, PodTemplateSpec, ResourceExt, ServiceAccount,
};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REQUEUE_BACKOFF: Duration = Duration::from_secs(10);

pub struct Context {
    pub client: Client,
    pub tracker: Tracker,
    pub cache_dir: Option<PathBuf>,
    pub registry_ca_cert_path: Option<PathBuf>,
    pub webhook_timeout: Duration,
    pub metrics: Metrics,
}

/// Only transport-level failures; everything input-shaped becomes a
/// condition.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

enum Outcome {
    Applied(PodTemplateSpec),
    Failed {
        reason: &'static str,
        message: String,
        requeue: bool,
    },
}

enum AuthOutcome {
    Keychain(Keychain),
    Failed(String),
}

pub async fn reconcile(intent: Arc<PodIntent>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = intent.namespace().unwrap_or_default();
    let name = intent.name_any();
    let intent_ref = ObjectRef::from_obj(&*intent);

    // Collaborator edges are rebuilt from scratch each pass.
    ctx.tracker.clear(&intent_ref);

    let outcome = run_pipeline(&intent, &intent_ref, &namespace, &name, &ctx).await?;

    let mut conditions = Conditions::initialize(intent.metadata.generation);
    let (template, action, outcome_label) = match outcome {
        Outcome::Applied(template) => {
            info!(%namespace, %name, "Conventions applied");
            conditions.mark_applied();
            (Some(template), Action::await_change(), "applied")
        }
        Outcome::Failed {
            reason,
            message,
            requeue,
        } => {
            warn!(%namespace, %name, %reason, %message, "Conventions not applied");
            conditions.mark_failed(reason, message);
            let action = if requeue {
                Action::requeue(REQUEUE_BACKOFF)
            } else {
                Action::await_change()
            };
            (None, action, "failed")
        }
    };

    let status = PodIntentStatus {
        observed_generation: intent.metadata.generation,
        conditions: conditions.to_conditions(),
        template,
    };
    patch_status(&ctx.client, &namespace, &name, &status).await?;
    ctx.metrics.reconcile_outcome(outcome_label);
    Ok(action)
}

pub fn error_policy(_intent: Arc<PodIntent>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(%error, "Reconciliation failed");
    ctx.metrics.reconcile_outcome("error");
    Action::requeue(REQUEUE_BACKOFF)
}

async fn run_pipeline(
    intent: &PodIntent,
    intent_ref: &ObjectRef<PodIntent>,
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<Outcome, Error> {
    let conventions = match catalog::resolve_conventions(&ctx.client).await? {
        CatalogOutcome::Resolved(conventions) => conventions,
        CatalogOutcome::Failed { message } => {
            return Ok(Outcome::Failed {
                reason: "CABundleResolutionFailed",
                message,
                requeue: false,
            });
        }
    };

    let keychain = match build_registry_auth(intent, intent_ref, namespace, ctx).await? {
        AuthOutcome::Keychain(keychain) => keychain,
        AuthOutcome::Failed(message) => {
            return Ok(Outcome::Failed {
                reason: "ImageResolutionFailed",
                message,
                requeue: false,
            });
        }
    };

    let ordered = match conventions.filter_and_sort(&collected_labels(intent)) {
        Ok(ordered) => ordered,
        Err(error) => {
            return Ok(Outcome::Failed {
                reason: "LabelSelector",
                message: format!("filtering conventions failed: {error}"),
                requeue: false,
            });
        }
    };

    let resolver = match ImageResolver::new(
        RegistryConfig {
            keychain,
            cache_dir: ctx.cache_dir.clone(),
            ca_cert_path: ctx.registry_ca_cert_path.clone(),
            timeout: ctx.webhook_timeout,
        },
        ctx.metrics.pipeline().clone(),
    ) {
        Ok(resolver) => resolver,
        Err(error) => {
            return Ok(Outcome::Failed {
                reason: "ImageResolutionFailed",
                message: error.to_string(),
                requeue: true,
            });
        }
    };

    let mut workload = intent.spec.template.clone();
    match ordered
        .apply(
            name,
            &mut workload,
            &resolver,
            ctx.webhook_timeout,
            ctx.metrics.pipeline(),
        )
        .await
    {
        Ok(()) => Ok(Outcome::Applied(workload)),
        Err(error @ ApplyError::ImageResolution(_)) => Ok(Outcome::Failed {
            reason: "ImageResolutionFailed",
            message: error.to_string(),
            requeue: true,
        }),
        Err(error @ ApplyError::Convention { .. }) => Ok(Outcome::Failed {
            reason: "ConventionsApplied",
            message: error.to_string(),
            requeue: true,
        }),
    }
}

/// Tracks and reads the service account and pull secrets, producing the
/// registry keychain. A missing service account fails the intent; the
/// reconciler re-runs when the tracked account appears.
async fn build_registry_auth(
    intent: &PodIntent,
    intent_ref: &ObjectRef<PodIntent>,
    namespace: &str,
    ctx: &Context,
) -> Result<AuthOutcome, Error> {
    let sa_name = intent.service_account();
    ctx.tracker.track(
        Key::new(Kind::ServiceAccount, namespace, sa_name),
        intent_ref.clone(),
    );

    let mut secret_names: Vec<String> = Vec::new();
    for secret in intent.pull_secret_names() {
        ctx.tracker.track(
            Key::new(Kind::Secret, namespace, secret),
            intent_ref.clone(),
        );
        if !secret_names.iter().any(|s| s == secret) {
            secret_names.push(secret.to_string());
        }
    }

    let api = Api::<ServiceAccount>::namespaced(ctx.client.clone(), namespace);
    let sa = match api.get_opt(sa_name).await? {
        Some(sa) => sa,
        None => {
            return Ok(AuthOutcome::Failed(format!(
                "failed to authenticate: serviceaccounts {sa_name:?} not found",
            )));
        }
    };

    for secret in sa.image_pull_secrets.iter().flatten() {
        if let Some(secret_name) = secret.name.as_deref() {
            ctx.tracker.track(
                Key::new(Kind::Secret, namespace, secret_name),
                intent_ref.clone(),
            );
            if !secret_names.iter().any(|s| s == secret_name) {
                secret_names.push(secret_name.to_string());
            }
        }
    }

    let keychain = Keychain::load(&ctx.client, namespace, &secret_names).await?;
    Ok(AuthOutcome::Keychain(keychain))
}

/// The label sets conventions select against, keyed by selector target.
fn collected_labels(intent: &PodIntent) -> HashMap<SelectorTarget, Labels> {
    let intent_labels: Labels = intent.metadata.labels.clone().into();
    let template_labels: Labels = intent
        .spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .into();
    HashMap::from([
        (SelectorTarget::PodIntent, intent_labels),
        (SelectorTarget::PodTemplateSpec, template_labels),
    ])
}

async fn patch_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &PodIntentStatus,
) -> Result<(), kube::Error> {
    let api = Api::<PodIntent>::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({
        "apiVersion": "conventions.carto.run/v1alpha1",
        "kind": "PodIntent",
        "status": status,
    });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conventions_controller_k8s_api::intent::PodIntentSpec;
    use std::iter::FromIterator;

    #[test]
    fn collects_labels_per_selector_target() {
        let spec: PodIntentSpec = serde_json::from_value(serde_json::json!({
            "template": {"metadata": {"labels": {"x": "y"}}},
        }))
        .expect("spec must parse");
        let mut intent = PodIntent::new("upper", spec);
        intent.metadata.labels =
            Some([("app".to_string(), "web".to_string())].into_iter().collect());

        let collected = collected_labels(&intent);
        assert_eq!(
            collected[&SelectorTarget::PodIntent],
            Labels::from_iter(Some(("app", "web"))),
        );
        assert_eq!(
            collected[&SelectorTarget::PodTemplateSpec],
            Labels::from_iter(Some(("x", "y"))),
        );
    }

    #[test]
    fn status_template_is_present_only_when_applied() {
        let mut conditions = Conditions::initialize(Some(2));
        conditions.mark_applied();
        let status = PodIntentStatus {
            observed_generation: Some(2),
            conditions: conditions.to_conditions(),
            template: Some(PodTemplateSpec::default()),
        };
        let value = serde_json::to_value(&status).expect("serialize");
        assert!(value.get("template").is_some());
        assert_eq!(value["observedGeneration"], 2);

        let mut conditions = Conditions::initialize(Some(2));
        conditions.mark_failed("LabelSelector", "bad selector");
        let status = PodIntentStatus {
            observed_generation: Some(2),
            conditions: conditions.to_conditions(),
            template: None,
        };
        let value = serde_json::to_value(&status).expect("serialize");
        assert!(value.get("template").is_none());
    }
}
