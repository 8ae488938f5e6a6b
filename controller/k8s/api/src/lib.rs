#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod mesh_config;
pub mod service_export;
pub mod service_import;
mod watch;

pub use self::{
    cluster::{Cluster, ClusterSpec, ClusterStatus},
    mesh_config::MeshConfig,
    service_export::{ServiceExport, ServiceExportSpec, ServiceExportStatus},
    service_import::{ServiceImport, ServiceImportSpec, ServiceImportStatus},
    watch::watch,
};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::Deployment,
        coordination::v1::Lease,
        core::v1::{
            ConfigMap, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Secret, Service,
            ServicePort, ServiceSpec,
        },
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressClass,
            IngressRule, IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
        },
    },
    apimachinery::{
        self,
        pkg::{
            apis::meta::v1::{Condition, OwnerReference, Time},
            util::intstr::IntOrString,
        },
    },
};
pub use kube::{
    api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    runtime::watcher,
    Client, CustomResourceExt, Error, Resource,
};

/// The API group of the cluster-set resources.
pub const GROUP: &str = "flomesh.io";
