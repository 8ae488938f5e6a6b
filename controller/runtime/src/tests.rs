use crate::{
    broker::{Broker, BrokerMetrics},
    clusters::Clusters,
    connector::{Context, Settings},
    core::{ClusterInfo, ClusterKey},
    events::ServiceExportEvent,
    index::ServiceInfo,
    k8s::{
        self,
        service_export::{
            PathType, ServiceExportRule, ServiceExportStatus, CONDITION_CONFLICT, CONDITION_VALID,
        },
        service_import::{Endpoint, ServiceImportSpec, Target},
        Cluster, ClusterSpec, Condition, MeshConfig, EndpointAddress, EndpointPort, EndpointSubset, Endpoints,
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, ObjectMeta, Service, ServiceBackendPort,
        ServiceExport, ServiceExportSpec, ServiceImport, ServiceSpec, Time,
    },
    lease::Leadership,
    publish::PublishMetrics,
    status,
};
use prometheus_client::registry::Registry;
use std::{net::Ipv4Addr, num::NonZeroU16, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};

fn meta(ns: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(ns.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

/// A client for code paths that never reach the API server.
pub(crate) fn mk_client() -> k8s::Client {
    let config = kube::Config::new("http://127.0.0.1:6443".parse().expect("valid uri"));
    k8s::Client::try_from(config).expect("client must build")
}

/// A leader's context in the home cluster `home`, with a running broker.
///
/// Must be called within a runtime.
pub(crate) fn mk_context() -> (Context, mpsc::Receiver<status::Update>) {
    let mut mesh = MeshConfig::default();
    mesh.cluster.name = "home".to_string();
    let (_, mesh) = watch::channel(Arc::new(mesh));

    let (broker, dispatcher) = Broker::new(BrokerMetrics::register(&mut Registry::default()));
    let (signal, shutdown) = drain::channel();
    tokio::spawn(dispatcher.run(shutdown));
    // The dispatcher runs for the rest of the test.
    std::mem::forget(signal);

    let (clusters_tx, _) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = mpsc::channel(16);
    let ctx = Context {
        settings: Arc::new(Settings {
            controller_namespace: "erie-canal".to_string(),
            manager_deployment_name: "erie-canal-manager".to_string(),
            mesh_config_name: "erie-canal-mesh-config".to_string(),
            ingress_class: "pipy".to_string(),
            resync_period: Duration::from_secs(900),
        }),
        home: mk_client(),
        broker,
        status: status_tx,
        mesh,
        leadership: Leadership::fixed(true),
        clusters: Clusters::shared(clusters_tx),
        ready: Arc::new(watch::channel(false).0),
        publish_metrics: PublishMetrics::register(&mut Registry::default()),
    };
    (ctx, status_rx)
}

pub(crate) fn mk_key(name: &str) -> ClusterKey {
    ClusterKey::new("", "", "", name)
}

/// A member cluster reached through a gateway at 10.0.0.1:8091.
pub(crate) fn mk_info(name: &str) -> ClusterInfo {
    ClusterInfo {
        key: mk_key(name),
        gateway_host: "gw.example.com".to_string(),
        gateway_ip: Some(Ipv4Addr::new(10, 0, 0, 1)),
        gateway_port: 8091,
        in_cluster: false,
        control_plane_uid: "cp-1".to_string(),
    }
}

pub(crate) fn mk_cluster(name: &str, in_cluster: bool) -> Cluster {
    let mut cluster = Cluster::new(
        name,
        ClusterSpec {
            is_in_cluster: in_cluster,
            gateway_host: Some("10.0.0.1".to_string()),
            kubeconfig: (!in_cluster).then(|| "apiVersion: v1".to_string()),
            ..ClusterSpec::default()
        },
    );
    cluster.metadata.uid = Some(format!("uid-{name}"));
    cluster
}

pub(crate) fn mk_service(ns: &str, name: &str, ports: &[(&str, i32)]) -> Service {
    Service {
        metadata: meta(ns, name),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| k8s::ServicePort {
                        name: Some(name.to_string()),
                        protocol: Some("TCP".to_string()),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn mk_endpoints(ns: &str, name: &str, port: (&str, i32), ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: meta(ns, name),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        node_name: Some("node-0".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                name: Some(port.0.to_string()),
                port: port.1,
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

/// An unclassed Ingress routing `host` and the `path` prefix to a service
/// port, created `created` seconds after the epoch.
pub(crate) fn mk_ingress(
    ns: &str,
    name: &str,
    host: &str,
    path: &str,
    (service, port): (&str, i32),
    created: i64,
) -> Ingress {
    let mut metadata = meta(ns, name);
    metadata.creation_timestamp = Some(Time(
        chrono::DateTime::<chrono::Utc>::from_timestamp(created, 0).expect("valid timestamp"),
    ));
    Ingress {
        metadata,
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: (!host.is_empty()).then(|| host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(path.to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(port),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn mk_export(ns: &str, name: &str, rules: &[(u16, &str)]) -> ServiceExport {
    let mut export = ServiceExport::new(
        name,
        ServiceExportSpec {
            rules: rules
                .iter()
                .map(|(port, path)| ServiceExportRule {
                    port_number: NonZeroU16::new(*port).expect("port must be non-zero"),
                    path: path.to_string(),
                    path_type: PathType::Prefix,
                })
                .collect(),
            ..Default::default()
        },
    );
    export.metadata.namespace = Some(ns.to_string());
    export
}

fn condition(type_: &str, status: &str) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: "Success".to_string(),
        message: String::new(),
        observed_generation: None,
        last_transition_time: Time(chrono::DateTime::<chrono::Utc>::MIN_UTC),
    }
}

fn with_conditions(mut export: ServiceExport, conditions: Vec<Condition>) -> ServiceExport {
    export.status = Some(ServiceExportStatus { conditions });
    export
}

/// Marks `export` as passing validation in its own cluster.
pub(crate) fn valid(export: ServiceExport) -> ServiceExport {
    with_conditions(export, vec![condition(CONDITION_VALID, "True")])
}

/// Marks `export` as failing validation in its own cluster.
pub(crate) fn invalid(export: ServiceExport) -> ServiceExport {
    with_conditions(export, vec![condition(CONDITION_VALID, "False")])
}

/// Marks `export` as accepted by the cluster set.
pub(crate) fn accepted(export: ServiceExport) -> ServiceExport {
    with_conditions(
        export,
        vec![
            condition(CONDITION_VALID, "True"),
            condition(CONDITION_CONFLICT, "False"),
        ],
    )
}

/// Marks `export` as conflicting with an accepted export.
pub(crate) fn conflicting(export: ServiceExport) -> ServiceExport {
    with_conditions(
        export,
        vec![
            condition(CONDITION_VALID, "True"),
            condition(CONDITION_CONFLICT, "True"),
        ],
    )
}

/// A valid export of `ns/name` on port 80, from the cluster named
/// `cluster_name`.
pub(crate) fn mk_event(cluster_name: &str, ns: &str, name: &str) -> ServiceExportEvent {
    let service = mk_service(ns, name, &[("http", 80)]);
    ServiceExportEvent {
        geo: mk_info(cluster_name),
        export: valid(mk_export(ns, name, &[(80, "/api")])),
        service: Some(ServiceInfo {
            type_: "ClusterIP".to_string(),
            deleting: false,
            ports: service.spec.and_then(|s| s.ports).unwrap_or_default(),
        }),
        error: None,
    }
}

pub(crate) fn mk_import(ns: &str, name: &str, clusters: &[&str]) -> ServiceImport {
    let mut import = ServiceImport::new(
        name,
        ServiceImportSpec {
            ports: vec![k8s::service_import::ServicePort {
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                app_protocol: None,
                port: 80,
                endpoints: clusters
                    .iter()
                    .map(|key| Endpoint {
                        cluster_key: key.to_string(),
                        target: Target {
                            host: "gw.example.com".to_string(),
                            ip: "10.0.0.1".to_string(),
                            port: 8091,
                            path: "/api".to_string(),
                        },
                    })
                    .collect(),
            }],
            ..Default::default()
        },
    );
    import.metadata.namespace = Some(ns.to_string());
    import
}

/// A valid MeshConfig document pointing at the repo served at `root_url`.
pub(crate) fn mesh_config_json(root_url: &str) -> serde_json::Value {
    serde_json::json!({
        "isManaged": false,
        "repo": { "rootURL": root_url },
        "images": {
            "repository": "flomesh",
            "pipyImage": "pipy:0.90.0",
            "proxyInitImage": "erie-canal-proxy-init:latest",
            "klipperLbImage": "mirrored-klipper-lb:v0.3.5",
        },
        "webhook": { "serviceName": "erie-canal-webhook-service" },
        "ingress": {
            "enabled": true,
            "namespaced": false,
            "http": { "enabled": true, "bind": 80, "listen": 8000, "nodePort": 30508 },
            "tls": {
                "enabled": true,
                "bind": 443,
                "listen": 8443,
                "nodePort": 30607,
                "mTLS": false,
                "sslPassthrough": { "enabled": false, "upstreamPort": 443 },
            },
        },
        "gatewayApi": { "enabled": false },
        "certificate": { "manager": "archon" },
        "cluster": {
            "uid": "uid-home",
            "region": "default",
            "zone": "default",
            "group": "default",
            "name": "home",
            "controlPlaneUID": "",
        },
    })
}

pub(crate) fn mk_mesh_config_map(json: &serde_json::Value) -> k8s::ConfigMap {
    k8s::ConfigMap {
        metadata: meta("erie-canal", "erie-canal-mesh-config"),
        data: Some(
            [(
                k8s::mesh_config::MESH_CONFIG_KEY.to_string(),
                json.to_string(),
            )]
            .into_iter()
            .collect(),
        ),
        ..Default::default()
    }
}
