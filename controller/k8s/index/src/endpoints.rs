use erie_canal_controller_core::routes::{ServicePortName, Target};
use erie_canal_controller_k8s_api::{Endpoints, ResourceExt};
use std::collections::BTreeMap;

pub type EndpointsFragment = BTreeMap<ServicePortName, Vec<Target>>;

/// Maps each named port of an `Endpoints` object to its ready addresses.
pub(crate) fn fragment(endpoints: &Endpoints) -> EndpointsFragment {
    let namespace = endpoints.namespace().unwrap_or_default();
    let name = endpoints.name_unchecked();

    let mut fragment = EndpointsFragment::new();
    for subset in endpoints.subsets.iter().flatten() {
        for port in subset.ports.iter().flatten() {
            let Ok(number) = u16::try_from(port.port) else {
                continue;
            };
            let targets = fragment
                .entry(ServicePortName::new(
                    &namespace,
                    &name,
                    port.name.clone().unwrap_or_default(),
                ))
                .or_default();
            for addr in subset.addresses.iter().flatten() {
                targets.push(Target::local(
                    &addr.ip,
                    number,
                    addr.node_name.as_deref().unwrap_or_default(),
                    addr.hostname.as_deref().unwrap_or_default(),
                ));
            }
        }
    }

    for targets in fragment.values_mut() {
        targets.sort();
        targets.dedup();
    }
    fragment.retain(|_, targets| !targets.is_empty());
    fragment
}
