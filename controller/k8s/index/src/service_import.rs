use erie_canal_controller_core::{
    routes::{ServicePortName, Target},
    ClusterKey,
};
use erie_canal_controller_k8s_api::{ResourceExt, ServiceImport};
use std::collections::BTreeMap;

pub type ImportFragment = BTreeMap<ServicePortName, Vec<Target>>;

/// Maps each port of an imported service to the gateways of the clusters
/// exporting it.
pub(crate) fn fragment(import: &ServiceImport) -> ImportFragment {
    let namespace = import.namespace().unwrap_or_default();
    let name = import.name_unchecked();

    let mut fragment = ImportFragment::new();
    for port in &import.spec.ports {
        let targets = fragment
            .entry(ServicePortName::new(
                &namespace,
                &name,
                port.name.clone().unwrap_or_default(),
            ))
            .or_default();
        for ep in &port.endpoints {
            let cluster = match ep.cluster_key.parse::<ClusterKey>() {
                Ok(cluster) => cluster,
                Err(error) => {
                    tracing::warn!(%namespace, %name, %error, "Skipping imported endpoint");
                    continue;
                }
            };
            let host = if ep.target.host.is_empty() {
                &ep.target.ip
            } else {
                &ep.target.host
            };
            targets.push(Target::remote(
                host,
                ep.target.port,
                &ep.target.path,
                &cluster,
            ));
        }
    }

    for targets in fragment.values_mut() {
        targets.sort();
        targets.dedup();
    }
    fragment.retain(|_, targets| !targets.is_empty());
    fragment
}
