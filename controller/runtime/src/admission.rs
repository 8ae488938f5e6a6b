use super::validation;
use crate::{
    clusters::SharedClusters,
    k8s::{Cluster, ClusterSpec, ConfigMap, MeshConfig, ServiceExport, ServiceExportSpec},
};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{
    core::{admission::Operation, DynamicObject},
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

#[derive(Clone)]
pub struct Admission {
    clusters: SharedClusters,
    mesh: watch::Receiver<Arc<MeshConfig>>,
    controller_namespace: Arc<str>,
    mesh_config_name: Arc<str>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

#[async_trait::async_trait]
trait Validate<T> {
    async fn validate(self, name: &str, spec: T, old: Option<T>) -> Result<()>;
}

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(not_found()));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(
        clusters: SharedClusters,
        mesh: watch::Receiver<Arc<MeshConfig>>,
        controller_namespace: &str,
        mesh_config_name: &str,
    ) -> Self {
        Self {
            clusters,
            mesh,
            controller_namespace: controller_namespace.into(),
            mesh_config_name: mesh_config_name.into(),
        }
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        if is_kind::<ConfigMap>(&req) {
            return self.admit_mesh_config(req);
        }

        // Only creations and updates carry an object to validate.
        if matches!(req.operation, Operation::Delete | Operation::Connect) {
            return AdmissionResponse::from(&req);
        }

        if is_kind::<Cluster>(&req) {
            return self.admit_spec::<ClusterSpec>(req).await;
        }

        if is_kind::<ServiceExport>(&req) {
            return self.admit_spec::<ServiceExportSpec>(req).await;
        }

        AdmissionResponse::invalid(format_args!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    async fn admit_spec<T>(self, req: AdmissionRequest) -> AdmissionResponse
    where
        T: DeserializeOwned,
        Self: Validate<T>,
    {
        let rsp = AdmissionResponse::from(&req);

        let kind = req.kind.kind.clone();
        let (obj, spec, old) = match parse_spec::<T>(req) {
            Ok(spec) => spec,
            Err(error) => {
                info!(%error, "Failed to parse {} spec", kind);
                return rsp.deny(error);
            }
        };

        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();

        if let Err(error) = self.validate(&name, spec, old).await {
            info!(%error, %ns, %name, %kind, "Denied");
            return rsp.deny(error);
        }

        rsp
    }

    /// The MeshConfig may be updated with a valid configuration but never
    /// deleted. Other ConfigMaps are not our concern.
    fn admit_mesh_config(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let ns = req.namespace.as_deref().unwrap_or_default();
        if ns != &*self.controller_namespace || req.name != &*self.mesh_config_name {
            return rsp;
        }

        match req.operation {
            Operation::Delete => {
                info!(%ns, name = %req.name, "Denied MeshConfig deletion");
                rsp.deny(format!("MeshConfig {ns}/{} cannot be deleted", req.name))
            }
            Operation::Create | Operation::Update => {
                let result = req
                    .object
                    .ok_or_else(|| anyhow!("admission request missing 'object'"))
                    .and_then(|obj| Ok(serde_json::from_value::<ConfigMap>(obj.data)?))
                    .and_then(|cm| Ok(MeshConfig::from_config_map(&cm)?));
                match result {
                    Ok(_) => rsp,
                    Err(error) => {
                        info!(%error, %ns, name = %req.name, "Denied MeshConfig");
                        rsp.deny(error)
                    }
                }
            }
            Operation::Connect => rsp,
        }
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn not_found() -> Response<Body> {
    let mut rsp = Response::new(Body::default());
    *rsp.status_mut() = http::StatusCode::NOT_FOUND;
    rsp
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    let mut rsp = Response::new(Body::from(bytes));
    rsp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    Ok(rsp)
}

fn parse_spec<T: DeserializeOwned>(
    req: AdmissionRequest,
) -> Result<(DynamicObject, T, Option<T>)> {
    fn spec_of<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T> {
        let data = obj
            .data
            .get("spec")
            .cloned()
            .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
        Ok(serde_json::from_value(data)?)
    }

    let obj = req
        .object
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;
    let spec = spec_of(&obj)?;
    let old = req.old_object.as_ref().map(spec_of).transpose()?;
    Ok((obj, spec, old))
}

#[async_trait::async_trait]
impl Validate<ClusterSpec> for Admission {
    async fn validate(self, name: &str, spec: ClusterSpec, old: Option<ClusterSpec>) -> Result<()> {
        let home = self.mesh.borrow().cluster_key();
        validation::cluster(name, &spec, old.as_ref(), &self.clusters.read(), &home)?;

        if let Some(host) = spec.gateway_host.as_deref().filter(|h| !h.is_empty()) {
            validation::gateway_host(host, spec.gateway_port()).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Validate<ServiceExportSpec> for Admission {
    async fn validate(self, _name: &str, spec: ServiceExportSpec, _old: Option<ServiceExportSpec>) -> Result<()> {
        validation::service_export(&spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clusters::Clusters, tests::mesh_config_json};
    use kube::core::admission::AdmissionReview;
    use tokio::sync::mpsc;

    fn mk_admission(clusters: &[crate::k8s::Cluster]) -> Admission {
        let (tx, _) = mpsc::unbounded_channel();
        let shared = Clusters::shared(tx);
        for cluster in clusters {
            kubert::index::IndexClusterResource::apply(&mut *shared.write(), cluster.clone());
        }
        let mesh = serde_json::from_value::<MeshConfig>(mesh_config_json("http://repo:6060"))
            .expect("config must parse");
        let (_, mesh) = watch::channel(Arc::new(mesh));
        Admission::new(shared, mesh, "erie-canal", "erie-canal-mesh-config")
    }

    fn request(
        (group, kind): (&str, &str),
        operation: &str,
        namespace: Option<&str>,
        name: &str,
        object: Option<serde_json::Value>,
        old_object: Option<serde_json::Value>,
    ) -> AdmissionRequest {
        let version = if group.is_empty() { "v1" } else { "v1alpha1" };
        let review = serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "4c1a2d1e-0000-0000-0000-000000000000",
                "kind": { "group": group, "version": version, "kind": kind },
                "resource": { "group": group, "version": version, "resource": kind.to_lowercase() },
                "name": name,
                "namespace": namespace,
                "operation": operation,
                "userInfo": {},
                "object": object,
                "oldObject": old_object,
                "dryRun": false,
            },
        });
        serde_json::from_value::<AdmissionReview<DynamicObject>>(review)
            .expect("review must parse")
            .try_into()
            .expect("review must carry a request")
    }

    fn cluster_obj(name: &str, spec: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "flomesh.io/v1alpha1",
            "kind": "Cluster",
            "metadata": { "name": name },
            "spec": spec,
        })
    }

    fn mesh_config_obj(json: &serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "erie-canal-mesh-config", "namespace": "erie-canal" },
            "data": { "mesh_config.json": json.to_string() },
        })
    }

    const CLUSTER: (&str, &str) = ("flomesh.io", "Cluster");
    const CONFIG_MAP: (&str, &str) = ("", "ConfigMap");

    #[tokio::test]
    async fn admits_peers_with_routable_gateways() {
        let admission = mk_admission(&[]);
        let obj = cluster_obj(
            "b",
            serde_json::json!({ "gatewayHost": "10.0.0.1", "kubeconfig": "apiVersion: v1" }),
        );
        let rsp = admission
            .clone()
            .admit(request(CLUSTER, "CREATE", None, "b", Some(obj), None))
            .await;
        assert!(rsp.allowed, "{}", rsp.result.message);

        let obj = cluster_obj(
            "b",
            serde_json::json!({ "gatewayHost": "127.0.0.1", "kubeconfig": "apiVersion: v1" }),
        );
        let rsp = admission
            .admit(request(CLUSTER, "CREATE", None, "b", Some(obj), None))
            .await;
        assert!(!rsp.allowed);
        assert_eq!(rsp.result.message, "gatewayHost 127.0.0.1 is a loopback address");
    }

    #[tokio::test]
    async fn denies_flipping_in_cluster() {
        let admission = mk_admission(&[]);
        let old = cluster_obj("home", serde_json::json!({ "isInCluster": true }));
        let obj = cluster_obj(
            "home",
            serde_json::json!({ "gatewayHost": "10.0.0.1", "kubeconfig": "apiVersion: v1" }),
        );
        let rsp = admission
            .admit(request(CLUSTER, "UPDATE", None, "home", Some(obj), Some(old)))
            .await;
        assert!(!rsp.allowed);
        assert_eq!(rsp.result.message, "isInCluster cannot be changed");
    }

    #[tokio::test]
    async fn denies_a_second_in_cluster_member() {
        let admission = mk_admission(&[crate::tests::mk_cluster("home", true)]);
        let obj = cluster_obj("local", serde_json::json!({ "isInCluster": true }));
        let rsp = admission
            .admit(request(CLUSTER, "CREATE", None, "local", Some(obj), None))
            .await;
        assert!(!rsp.allowed);
    }

    #[tokio::test]
    async fn denies_exports_without_rules() {
        let admission = mk_admission(&[]);
        let obj = serde_json::json!({
            "apiVersion": "flomesh.io/v1alpha1",
            "kind": "ServiceExport",
            "metadata": { "name": "api", "namespace": "demo" },
            "spec": { "rules": [] },
        });
        let rsp = admission
            .admit(request(
                ("flomesh.io", "ServiceExport"),
                "CREATE",
                Some("demo"),
                "api",
                Some(obj),
                None,
            ))
            .await;
        assert!(!rsp.allowed);
        assert_eq!(rsp.result.message, "at least one rule is required");
    }

    #[tokio::test]
    async fn mesh_config_must_be_valid_and_cannot_be_deleted() {
        let admission = mk_admission(&[]);
        let json = mesh_config_json("http://repo:6060");
        let ns = Some("erie-canal");
        let name = "erie-canal-mesh-config";

        let rsp = admission.clone().admit(request(
            CONFIG_MAP,
            "UPDATE",
            ns,
            name,
            Some(mesh_config_obj(&json)),
            None,
        ))
        .await;
        assert!(rsp.allowed, "{}", rsp.result.message);

        let mut invalid = json.clone();
        invalid["repo"]["rootURL"] = "not a url".into();
        let rsp = admission.clone().admit(request(
            CONFIG_MAP,
            "UPDATE",
            ns,
            name,
            Some(mesh_config_obj(&invalid)),
            None,
        ))
        .await;
        assert!(!rsp.allowed);

        let rsp = admission
            .clone()
            .admit(request(CONFIG_MAP, "DELETE", ns, name, None, Some(mesh_config_obj(&json))))
            .await;
        assert!(!rsp.allowed);
        assert_eq!(
            rsp.result.message,
            "MeshConfig erie-canal/erie-canal-mesh-config cannot be deleted"
        );

        // Other ConfigMaps are admitted as they are.
        let rsp = admission
            .admit(request(CONFIG_MAP, "DELETE", ns, "other", None, None))
            .await;
        assert!(rsp.allowed);
    }
}
