use super::resource_id;
use crate::{
    k8s::{
        self, service_import::ServiceImportType, ObjectMeta, OwnerReference, Patch, PatchParams,
        PostParams, Resource, Service, ServiceImport, ServiceSpec,
    },
    lease::Leadership,
};
use anyhow::{Context as _, Result};
use futures::prelude::*;
use kube::runtime::watcher;
use tracing::{debug, info, warn};

/// Maintains a `ClusterIP` Service for every `ClusterSetIP` ServiceImport in
/// the home cluster, so that imported services resolve like local ones.
pub(super) async fn run(client: k8s::Client, leadership: Leadership) {
    let api = k8s::Api::<ServiceImport>::all(client.clone());
    let events = k8s::watch(api, watcher::Config::default(), tracing::Span::current());
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        let (watcher::Event::Apply(import) | watcher::Event::InitApply(import)) = event else {
            continue;
        };
        if !wants_service(&import) || !leadership.is_leader() {
            continue;
        }
        if let Err(error) = ensure_service(&client, &import).await {
            warn!(import = %resource_id(&import), %error, "Failed to derive Service");
        }
    }
}

fn wants_service(import: &ServiceImport) -> bool {
    import.spec.type_ == ServiceImportType::ClusterSetIP
        && import.metadata.deletion_timestamp.is_none()
}

async fn ensure_service(client: &k8s::Client, import: &ServiceImport) -> Result<()> {
    let id = resource_id(import);
    let owner = import
        .owner_ref(&())
        .context("ServiceImport has no name or uid")?;
    let api = k8s::Api::<Service>::namespaced(client.clone(), &id.namespace);

    let service = derived_service(import, owner.clone());
    match api.create(&PostParams::default(), &service).await {
        Ok(_) => info!(service = %id, "Created Service"),
        Err(k8s::Error::Api(e)) if e.code == 409 => {
            let mut existing = api.get(&id.name).await?;
            let owners = existing.metadata.owner_references.get_or_insert_with(Vec::new);
            if !owners.iter().any(|o| o.uid == owner.uid) {
                owners.push(owner);
                api.replace(&id.name, &PostParams::default(), &existing)
                    .await?;
                debug!(service = %id, "Adopted Service");
            }
        }
        Err(error) => return Err(error.into()),
    }

    if !import.spec.ips.is_empty() {
        let ingress = import
            .spec
            .ips
            .iter()
            .map(|ip| serde_json::json!({ "ip": ip }))
            .collect::<Vec<_>>();
        let patch = Patch::Merge(serde_json::json!({
            "status": { "loadBalancer": { "ingress": ingress } },
        }));
        api.patch_status(&id.name, &PatchParams::default(), &patch)
            .await?;
    }
    Ok(())
}

fn derived_service(import: &ServiceImport, owner: OwnerReference) -> Service {
    let ports = import
        .spec
        .ports
        .iter()
        .map(|p| k8s::ServicePort {
            name: p.name.clone(),
            protocol: p.protocol.clone(),
            app_protocol: p.app_protocol.clone(),
            port: i32::from(p.port),
            ..Default::default()
        })
        .collect();
    Service {
        metadata: ObjectMeta {
            namespace: import.metadata.namespace.clone(),
            name: import.metadata.name.clone(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}
