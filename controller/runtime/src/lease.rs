use crate::{
    core::CONTROLLER_NAME,
    k8s::{self, Deployment, Lease, ObjectMeta, Patch, PatchParams, Resource},
};
use anyhow::{Context, Result};
use kubert::lease::Claim;
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const LEASE_NAME: &str = "erie-canal-manager-write";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

/// Whether this process currently holds the write lease.
#[derive(Clone, Debug)]
pub struct Leadership {
    claims: watch::Receiver<Arc<Claim>>,
    hostname: String,
}

pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<Claim>>> {
    // Fetch the manager deployment so that we can use it as an owner reference
    // of the Lease.
    let api = k8s::Api::<Deployment>::namespaced(runtime.client(), ns);
    let deployment = api
        .get(deployment_name)
        .await
        .with_context(|| format!("failed to get Deployment {ns}/{deployment_name}"))?;
    let owner = deployment
        .controller_owner_ref(&())
        .context("Deployment has no name or uid")?;

    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: Some(vec![owner]),
            labels: Some(
                [
                    ("app.kubernetes.io/name".to_string(), "erie-canal".to_string()),
                    ("app.kubernetes.io/component".to_string(), "manager".to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            LEASE_NAME,
            &PatchParams::apply(CONTROLLER_NAME),
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => {
            return Err(error.into());
        }
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

// === impl Leadership ===

impl Leadership {
    pub fn new(claims: watch::Receiver<Arc<Claim>>, hostname: impl Into<String>) -> Self {
        Self {
            claims,
            hostname: hostname.into(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.hostname)
    }

    #[cfg(test)]
    pub(crate) fn fixed(leader: bool) -> Self {
        let holder = if leader { "self" } else { "other" };
        let (tx, claims) = watch::channel(Arc::new(Claim {
            holder: holder.to_string(),
            expiry: chrono::Utc::now() + chrono::Duration::days(1),
        }));
        // Keep the sender alive for the life of the test.
        std::mem::forget(tx);
        Self::new(claims, "self")
    }
}
