use anyhow::Result;
use conventions_controller_k8s_api::ObjectMeta;
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::{Api, Patch, PatchParams};
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_NAME: &str = "conventions-controller-write";
const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);
const FIELD_MANAGER: &str = "conventions-controller";

/// Ensures the controller's Lease exists and spawns the claim task. The
/// returned receiver observes the current claimant.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    namespace: &str,
    claimant: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    let params = kubert::LeaseParams {
        name: LEASE_NAME.to_string(),
        namespace: namespace.to_string(),
        claimant: claimant.to_string(),
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
        field_manager: Some(FIELD_MANAGER.into()),
    };

    let patch = Patch::Apply(coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            // Specifying a resource version of "0" means that we will only
            // create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            ..Default::default()
        },
        spec: None,
    });
    let patch_params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    let api = Api::<coordv1::Lease>::namespaced(runtime.client(), namespace);

    // An individual request may hit a transient error, so we try a few times
    // with a brief pause.
    let mut tries = 3;
    loop {
        tries -= 1;
        let error: anyhow::Error = match api.patch(LEASE_NAME, &patch_params, &patch).await {
            Ok(lease) => {
                tracing::debug!(?lease, "Created Lease");
                break;
            }
            Err(kube::Error::Api(error)) if error.code < 500 => {
                tracing::debug!(?error, "Lease already exists");
                break;
            }
            Err(error) => error.into(),
        };
        if tries == 0 {
            anyhow::bail!(error);
        }
        tracing::warn!(?error, "Failed to create Lease, retrying in 1s...");
        time::sleep(time::Duration::from_secs(1)).await;
    }

    let (claim, _task) = runtime.spawn_lease(params).await?;
    Ok(claim)
}
