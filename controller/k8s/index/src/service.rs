use erie_canal_controller_core::routes::{ServicePortName, Target};
use erie_canal_controller_k8s_api::{
    mesh_config::is_dns_1123_hostname, IntOrString, ResourceExt, Service,
};
use std::{collections::BTreeMap, net::IpAddr};

/// What a single service port contributes to the routing tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePortInfo {
    pub port: u16,
    /// The resolved target of an `ExternalName` service. Unset for
    /// `ClusterIP` services, whose targets come from their endpoints.
    pub external: Option<Target>,
}

pub type ServiceFragment = BTreeMap<ServicePortName, ServicePortInfo>;

#[derive(Debug, PartialEq, Eq)]
enum Type {
    ClusterIp,
    ExternalName(String),
    Other(String),
}

/// Derives the ports a service contributes.
///
/// Only `ClusterIP` and `ExternalName` services contribute; `None` is returned
/// for every other type and for external names that cannot be routed to.
pub(crate) fn fragment(service: &Service) -> Option<ServiceFragment> {
    let namespace = service.namespace().unwrap_or_default();
    let name = service.name_unchecked();
    let spec = service.spec.as_ref()?;

    let ty = match spec.type_.as_deref().unwrap_or("ClusterIP") {
        "ClusterIP" => Type::ClusterIp,
        "ExternalName" => Type::ExternalName(spec.external_name.clone().unwrap_or_default()),
        other => Type::Other(other.to_string()),
    };

    if let Type::Other(ty) = &ty {
        tracing::trace!(%namespace, %name, %ty, "Ignoring service");
        return None;
    }
    if let Type::ExternalName(external) = &ty {
        if let Err(error) = check_external_name(external) {
            tracing::error!(%namespace, %name, external_name = %external, %error, "Invalid ExternalName service");
            return None;
        }
    }

    let mut fragment = ServiceFragment::new();
    for sp in spec.ports.iter().flatten() {
        let Ok(port) = u16::try_from(sp.port) else {
            tracing::warn!(%namespace, %name, port = sp.port, "Ignoring out of range port");
            continue;
        };
        let external = match &ty {
            Type::ExternalName(external) => {
                let target_port = match &sp.target_port {
                    Some(IntOrString::Int(p)) => u16::try_from(*p).unwrap_or(port),
                    _ => port,
                };
                Some(Target::external(external, target_port))
            }
            _ => None,
        };
        fragment.insert(
            ServicePortName::new(&namespace, &name, sp.name.clone().unwrap_or_default()),
            ServicePortInfo { port, external },
        );
    }
    Some(fragment)
}

fn check_external_name(external: &str) -> Result<(), &'static str> {
    if let Ok(ip) = external.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Err("loopback address");
        }
        return Ok(());
    }
    if external.eq_ignore_ascii_case("localhost") {
        return Err("loopback address");
    }
    if !is_dns_1123_hostname(external.trim_end_matches('.')) {
        return Err("not a valid DNS name");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use erie_canal_controller_k8s_api::{ObjectMeta, ServicePort, ServiceSpec};
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn mk_service(ty: &str, external_name: Option<&str>, ports: &[(&str, i32, i32)]) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some("demo".to_string()),
                name: Some("api".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(ty.to_string()),
                external_name: external_name.map(Into::into),
                ports: Some(
                    ports
                        .iter()
                        .map(|(name, port, target)| ServicePort {
                            name: Some(name.to_string()),
                            port: *port,
                            target_port: Some(IntOrString::Int(*target)),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn cluster_ip_ports() {
        let svc = mk_service("ClusterIP", None, &[("http", 80, 8080), ("grpc", 9090, 9090)]);
        assert_eq!(
            fragment(&svc),
            Some(btreemap! {
                ServicePortName::new("demo", "api", "grpc") => ServicePortInfo { port: 9090, external: None },
                ServicePortName::new("demo", "api", "http") => ServicePortInfo { port: 80, external: None },
            })
        );
    }

    #[test]
    fn external_name_targets_the_target_port() {
        let svc = mk_service("ExternalName", Some("api.example.com"), &[("http", 80, 8080)]);
        assert_eq!(
            fragment(&svc),
            Some(btreemap! {
                ServicePortName::new("demo", "api", "http") => ServicePortInfo {
                    port: 80,
                    external: Some(Target::external("api.example.com", 8080)),
                },
            })
        );
    }

    #[rstest]
    #[case("NodePort", None)]
    #[case("LoadBalancer", None)]
    #[case("ExternalName", Some("127.0.0.1"))]
    #[case("ExternalName", Some("localhost"))]
    #[case("ExternalName", Some("not a host"))]
    fn ignored(#[case] ty: &str, #[case] external_name: Option<&str>) {
        let svc = mk_service(ty, external_name, &[("http", 80, 80)]);
        assert_eq!(fragment(&svc), None);
    }
}
