use crate::{
    endpoints::EndpointsFragment,
    ingress::{BackendPort, DeclaredRoute, IngressKey},
    secrets::SecretLookup,
    service::ServicePortInfo,
    Trackers,
};
use erie_canal_controller_core::{
    routes::{
        IngressRoute, IngressSnapshot, ServicePortName, ServiceRoute, ServiceSnapshot, Target,
        TlsSpec, UpstreamSpec,
    },
    tracker::apply_changes,
    ResourceId,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// Builds routing snapshots from the changes recorded by an [`Index`].
///
/// The compiler owns the canonical service, endpoint, import and ingress maps.
/// Each call to [`Compiler::compile`] first folds every pending change into
/// them.
///
/// [`Index`]: crate::Index
#[derive(Debug)]
pub struct Compiler {
    trackers: Arc<Trackers>,
    services: BTreeMap<ServicePortName, ServicePortInfo>,
    endpoints: EndpointsFragment,
    imports: BTreeMap<ServicePortName, Vec<Target>>,
    ingresses: BTreeMap<IngressKey, DeclaredRoute>,
}

#[derive(Clone, Debug, Default)]
pub struct Options {
    /// When set, TLS routes are passed through to this upstream port rather
    /// than terminated by the proxy.
    pub ssl_passthrough: Option<u16>,
}

#[derive(Clone, Debug)]
pub struct Compiled {
    pub services: ServiceSnapshot,
    pub ingress: IngressSnapshot,
    pub collisions: Vec<PathCollision>,
}

/// Two Ingresses declare the same host and path. Only the older Ingress's
/// route is emitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathCollision {
    pub host: String,
    pub path: String,
    pub winner: ResourceId,
    pub loser: ResourceId,
}

// === impl Compiler ===

impl Compiler {
    pub(crate) fn new(trackers: Arc<Trackers>) -> Self {
        Self {
            trackers,
            services: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            imports: BTreeMap::new(),
            ingresses: BTreeMap::new(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.trackers.is_empty()
    }

    pub fn compile<S: SecretLookup + ?Sized>(&mut self, secrets: &S, options: &Options) -> Compiled {
        self.apply_pending();

        let services = self.service_snapshot();
        let (ingress, collisions) = self.ingress_snapshot(secrets, options);
        for PathCollision {
            host,
            path,
            winner,
            loser,
        } in &collisions
        {
            tracing::warn!(%host, %path, %winner, %loser, "Path is already routed by another Ingress");
        }
        Compiled {
            services,
            ingress,
            collisions,
        }
    }

    fn apply_pending(&mut self) {
        apply_changes(&mut self.services, self.trackers.services.checkout());
        apply_changes(&mut self.endpoints, self.trackers.endpoints.checkout());
        apply_changes(&mut self.imports, self.trackers.imports.checkout());
        apply_changes(&mut self.ingresses, self.trackers.ingresses.checkout());
    }

    fn service_snapshot(&self) -> ServiceSnapshot {
        let names = self
            .services
            .keys()
            .chain(self.imports.keys())
            .collect::<BTreeSet<_>>();

        let routes = names
            .into_iter()
            .map(|spn| {
                let mut targets = self.local_targets(spn);
                targets.extend(self.imports.get(spn).into_iter().flatten().cloned());
                ServiceRoute {
                    name: spn.name.clone(),
                    namespace: spn.namespace.clone(),
                    port_name: spn.port.clone(),
                    targets,
                }
            })
            .collect();
        ServiceSnapshot::new(routes)
    }

    fn local_targets(&self, spn: &ServicePortName) -> Vec<Target> {
        match self.services.get(spn) {
            None => vec![],
            Some(ServicePortInfo {
                external: Some(target),
                ..
            }) => vec![target.clone()],
            Some(ServicePortInfo { external: None, .. }) => {
                self.endpoints.get(spn).cloned().unwrap_or_default()
            }
        }
    }

    /// Finds the service port an Ingress backend refers to. Numbered backends
    /// are resolved through the service's port list.
    fn resolve(&self, service: &ResourceId, port: &BackendPort) -> Option<ServicePortName> {
        match port {
            BackendPort::Name(name) => {
                let spn = ServicePortName::new(&service.namespace, &service.name, name);
                self.services.contains_key(&spn).then_some(spn)
            }
            BackendPort::Number(number) => {
                let first = ServicePortName::new(&service.namespace, &service.name, "");
                self.services
                    .range(first..)
                    .take_while(|(spn, _)| {
                        spn.namespace == service.namespace && spn.name == service.name
                    })
                    .find(|(_, info)| info.port == *number)
                    .map(|(spn, _)| spn.clone())
            }
        }
    }

    fn ingress_snapshot<S: SecretLookup + ?Sized>(
        &self,
        secrets: &S,
        options: &Options,
    ) -> (IngressSnapshot, Vec<PathCollision>) {
        let mut by_host_path = BTreeMap::<(&str, &str), Vec<(&IngressKey, &DeclaredRoute)>>::new();
        for (key, route) in &self.ingresses {
            by_host_path
                .entry(key.host_path())
                .or_default()
                .push((key, route));
        }

        let mut routes = Vec::new();
        let mut collisions = Vec::new();
        for ((host, path), candidates) in by_host_path {
            // Ingresses whose backend does not resolve never claim a path.
            let mut candidates = candidates
                .into_iter()
                .filter_map(|(key, route)| {
                    match self.resolve(&route.service, &route.port) {
                        Some(service) => Some((key, route, service)),
                        None => {
                            tracing::debug!(ingress = %key.ingress, service = %route.service, port = ?route.port, "Backend does not resolve to a service port");
                            None
                        }
                    }
                })
                .collect::<Vec<_>>();
            candidates.sort_by(|(ka, ra, _), (kb, rb, _)| {
                (&ra.created, &ka.ingress).cmp(&(&rb.created, &kb.ingress))
            });
            let mut candidates = candidates.into_iter();
            let Some((winner_key, winner, service)) = candidates.next() else {
                continue;
            };
            for (key, _, _) in candidates {
                collisions.push(PathCollision {
                    host: host.to_string(),
                    path: path.to_string(),
                    winner: winner_key.ingress.clone(),
                    loser: key.ingress.clone(),
                });
            }

            let upstream_endpoints = self
                .local_targets(&service)
                .into_iter()
                .map(|t| t.address)
                .collect();

            let (tls, ssl_passthrough) = match (&winner.tls, options.ssl_passthrough) {
                (None, _) => (None, None),
                (Some(tls), Some(port)) => (
                    Some(TlsSpec {
                        is_tls: true,
                        is_wildcard_host: tls.is_wildcard_host,
                        ..TlsSpec::default()
                    }),
                    Some(port),
                ),
                (Some(tls), None) => {
                    let certificate = tls
                        .secret
                        .as_ref()
                        .and_then(|s| secrets.certificate(&s.namespace, &s.name))
                        .filter(|c| !c.cert.is_empty() && !c.key.is_empty());
                    let trusted_ca = match tls.trusted_ca.as_ref() {
                        Some(s) => secrets.certificate(&s.namespace, &s.name),
                        None => certificate.clone().filter(|c| !c.ca.is_empty()),
                    };
                    (
                        Some(TlsSpec {
                            is_tls: true,
                            is_wildcard_host: tls.is_wildcard_host,
                            verify_client: tls.verify_client,
                            verify_depth: tls.verify_depth,
                            certificate,
                            trusted_ca,
                        }),
                        None,
                    )
                }
            };

            let upstream = {
                let u = &winner.upstream;
                let ssl_cert = u
                    .ssl_secret
                    .as_ref()
                    .and_then(|s| secrets.certificate(&s.namespace, &s.name));
                (u.ssl_name.is_some() || ssl_cert.is_some() || u.ssl_verify).then(|| UpstreamSpec {
                    ssl_name: u.ssl_name.clone(),
                    ssl_cert,
                    ssl_verify: u.ssl_verify,
                })
            };

            routes.push(IngressRoute {
                host: host.to_string(),
                path: path.to_string(),
                service,
                rewrite: winner.rewrite.clone(),
                balancer: winner.balancer,
                sticky: winner.sticky,
                tls,
                upstream,
                upstream_endpoints,
                ssl_passthrough,
            });
        }

        (IngressSnapshot::new(routes), collisions)
    }
}
