use crate::{
    clusters::Clusters,
    core::ClusterKey,
    k8s::{mesh_config::is_dns_1123_hostname, ClusterSpec, ResourceExt, ServiceExportSpec},
};
use anyhow::{bail, ensure, Context, Result};
use std::net::{Ipv4Addr, SocketAddr};

/// Checks a Cluster against its previous version, the other Clusters and
/// the key of the home cluster.
pub(crate) fn cluster(
    name: &str,
    spec: &ClusterSpec,
    old: Option<&ClusterSpec>,
    clusters: &Clusters,
    home: &ClusterKey,
) -> Result<()> {
    if let Some(old) = old {
        ensure!(
            old.is_in_cluster == spec.is_in_cluster,
            "isInCluster cannot be changed"
        );
    }
    ensure!(spec.gateway_port != Some(0), "gatewayPort must be within [1, 65535]");

    if spec.is_in_cluster {
        if let Some(other) = clusters.in_cluster().filter(|c| c.name_unchecked() != name) {
            bail!(
                "Cluster {} is already the in-cluster member, only one is allowed",
                other.name_unchecked()
            );
        }
        return Ok(());
    }

    let key = spec.key(name);
    ensure!(key != *home, "Cluster key {key} is the key of the in-cluster member");
    if let Some(other) = clusters.by_key(&key).filter(|c| c.name_unchecked() != name) {
        bail!("Cluster {} already has the key {key}", other.name_unchecked());
    }
    ensure!(
        spec.gateway_host.as_deref().is_some_and(|h| !h.is_empty()),
        "gatewayHost is required for clusters other than the in-cluster member"
    );
    ensure!(
        spec.kubeconfig.as_deref().is_some_and(|k| !k.is_empty()),
        "kubeconfig is required for clusters other than the in-cluster member"
    );
    Ok(())
}

/// Checks that peers can reach the gateway at `host`: a routable IPv4
/// address, or a DNS name resolving to one.
pub(crate) async fn gateway_host(host: &str, port: u16) -> Result<()> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return routable(ip);
    }
    ensure!(
        is_dns_1123_hostname(host),
        "gatewayHost {host:?} is neither an IPv4 address nor a DNS name"
    );
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("gatewayHost {host} cannot be resolved"))?;
    for addr in addrs {
        if let SocketAddr::V4(addr) = addr {
            return routable(*addr.ip());
        }
    }
    bail!("gatewayHost {host} has no IPv4 address")
}

fn routable(ip: Ipv4Addr) -> Result<()> {
    ensure!(!ip.is_loopback(), "gatewayHost {ip} is a loopback address");
    ensure!(!ip.is_unspecified(), "gatewayHost {ip} is unspecified");
    Ok(())
}

pub(crate) fn service_export(spec: &ServiceExportSpec) -> Result<()> {
    ensure!(!spec.rules.is_empty(), "at least one rule is required");
    for rule in &spec.rules {
        ensure!(
            rule.path.starts_with('/'),
            "path {:?} must start with '/'",
            rule.path
        );
    }
    for target in &spec.target_clusters {
        target
            .parse::<ClusterKey>()
            .with_context(|| format!("invalid target cluster {target:?}"))?;
    }
    if let Some(rewrite) = &spec.path_rewrite {
        if !rewrite.from.is_empty() {
            ensure!(
                rewrite.from.starts_with('/'),
                "pathRewrite.from {:?} must start with '/'",
                rewrite.from
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        k8s::service_export::PathRewrite,
        tests::{mk_cluster, mk_export},
    };
    use kubert::index::IndexClusterResource;
    use rstest::rstest;

    fn mk_clusters(names: &[(&str, bool)]) -> Clusters {
        let (tx, _) = tokio::sync::mpsc::unbounded_channel();
        let shared = Clusters::shared(tx);
        let mut clusters = std::sync::Arc::try_unwrap(shared)
            .expect("index must not be shared")
            .into_inner();
        for (name, in_cluster) in names {
            clusters.apply(mk_cluster(name, *in_cluster));
        }
        clusters
    }

    fn home() -> ClusterKey {
        ClusterKey::new("", "", "", "home")
    }

    #[test]
    fn one_in_cluster_member() {
        let clusters = mk_clusters(&[("home", true)]);
        let spec = mk_cluster("other", true).spec;
        let error = cluster("other", &spec, None, &clusters, &home()).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Cluster home is already the in-cluster member, only one is allowed"
        );

        // Updating the member itself is fine.
        let spec = mk_cluster("home", true).spec;
        cluster("home", &spec, Some(&spec), &clusters, &home()).expect("update must be allowed");
    }

    #[test]
    fn in_cluster_is_immutable() {
        let clusters = mk_clusters(&[]);
        let old = mk_cluster("b", false).spec;
        let mut spec = old.clone();
        spec.is_in_cluster = true;
        let error = cluster("b", &spec, Some(&old), &clusters, &home()).unwrap_err();
        assert_eq!(error.to_string(), "isInCluster cannot be changed");
    }

    #[test]
    fn peers_do_not_reuse_the_home_key() {
        let clusters = mk_clusters(&[("b", false)]);
        let spec = mk_cluster("home", false).spec;
        let error = cluster("home", &spec, None, &clusters, &home()).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Cluster key default/default/default/home is the key of the in-cluster member"
        );

        let mut spec = mk_cluster("home", false).spec;
        spec.region = Some("east".to_string());
        cluster("home", &spec, None, &clusters, &home()).expect("keys differ by region");

        // A cluster does not collide with itself.
        let spec = mk_cluster("b", false).spec;
        cluster("b", &spec, Some(&spec), &clusters, &home()).expect("update must be allowed");
    }

    #[rstest]
    #[case::no_gateway(None, Some("kubeconfig"), "gatewayHost is required")]
    #[case::no_kubeconfig(Some("10.0.0.1"), None, "kubeconfig is required")]
    #[case::empty_kubeconfig(Some("10.0.0.1"), Some(""), "kubeconfig is required")]
    fn peers_need_a_gateway_and_credentials(
        #[case] gateway_host: Option<&str>,
        #[case] kubeconfig: Option<&str>,
        #[case] expected: &str,
    ) {
        let clusters = mk_clusters(&[]);
        let spec = ClusterSpec {
            gateway_host: gateway_host.map(Into::into),
            kubeconfig: kubeconfig.map(Into::into),
            ..ClusterSpec::default()
        };
        let error = cluster("b", &spec, None, &clusters, &home()).unwrap_err();
        assert!(error.to_string().starts_with(expected), "{error}");
    }

    #[test]
    fn gateway_port_zero_is_invalid() {
        let mut spec = mk_cluster("b", false).spec;
        spec.gateway_port = Some(0);
        assert!(cluster("b", &spec, None, &mk_clusters(&[]), &home()).is_err());
    }

    #[rstest]
    #[case("10.0.0.1", true)]
    #[case("127.0.0.1", false)]
    #[case("0.0.0.0", false)]
    #[case("Not_A_Host", false)]
    #[case("gateway-.example.com", false)]
    #[tokio::test]
    async fn gateway_hosts(#[case] host: &str, #[case] ok: bool) {
        assert_eq!(gateway_host(host, 80).await.is_ok(), ok, "{host}");
    }

    #[test]
    fn exports_need_rules() {
        let export = mk_export("demo", "api", &[]);
        assert_eq!(
            service_export(&export.spec).unwrap_err().to_string(),
            "at least one rule is required"
        );
    }

    #[rstest]
    #[case::relative_path(&[(80, "api")], &[], false)]
    #[case::absolute_path(&[(80, "/api")], &[], true)]
    #[case::keyed_target(&[(80, "/api")], &["r/z/g/b"], true)]
    #[case::bare_target(&[(80, "/api")], &["b"], false)]
    fn export_rules_and_targets(
        #[case] rules: &[(u16, &str)],
        #[case] targets: &[&str],
        #[case] ok: bool,
    ) {
        let mut export = mk_export("demo", "api", rules);
        export.spec.target_clusters = targets.iter().map(ToString::to_string).collect();
        assert_eq!(service_export(&export.spec).is_ok(), ok);
    }

    #[test]
    fn rewrites_must_be_absolute() {
        let mut export = mk_export("demo", "api", &[(80, "/api")]);
        export.spec.path_rewrite = Some(PathRewrite {
            from: "api".to_string(),
            to: "/".to_string(),
        });
        assert!(service_export(&export.spec).is_err());
    }
}
