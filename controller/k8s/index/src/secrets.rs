use ahash::AHashMap as HashMap;
use erie_canal_controller_core::{routes::CertificateSpec, ResourceId};
use erie_canal_controller_k8s_api::{ResourceExt, Secret};
use parking_lot::RwLock;
use std::sync::Arc;

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";

/// Resolves TLS material by secret reference.
pub trait SecretLookup {
    fn certificate(&self, namespace: &str, name: &str) -> Option<CertificateSpec>;
}

pub type SharedSecrets = Arc<RwLock<Secrets>>;

/// Indexes the PEM material of every secret that carries any.
///
/// Secret changes are never dispatched to the route compiler; the material is
/// looked up when routes are compiled.
#[derive(Debug, Default)]
pub struct Secrets {
    by_id: HashMap<ResourceId, CertificateSpec>,
}

// === impl Secrets ===

impl Secrets {
    pub fn shared() -> SharedSecrets {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl kubert::index::IndexNamespacedResource<Secret> for Secrets {
    fn apply(&mut self, secret: Secret) {
        let id = ResourceId::new(
            secret.namespace().unwrap_or_default(),
            secret.name_unchecked(),
        );
        let data = secret.data.unwrap_or_default();
        let pem = |key: &str| {
            data.get(key)
                .and_then(|b| String::from_utf8(b.0.clone()).ok())
                .unwrap_or_default()
        };
        let spec = CertificateSpec {
            cert: pem(TLS_CERT_KEY),
            key: pem(TLS_PRIVATE_KEY),
            ca: pem(CA_CERT_KEY),
        };

        if spec.cert.is_empty() && spec.key.is_empty() && spec.ca.is_empty() {
            self.by_id.remove(&id);
            return;
        }
        self.by_id.insert(id, spec);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.by_id.remove(&ResourceId::new(namespace, name));
    }
}

impl SecretLookup for Secrets {
    fn certificate(&self, namespace: &str, name: &str) -> Option<CertificateSpec> {
        let namespace = if namespace.is_empty() {
            tracing::warn!(%name, "Secret namespace is empty; assuming default");
            "default"
        } else {
            namespace
        };
        self.by_id
            .get(&ResourceId::new(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

impl<L: SecretLookup> SecretLookup for RwLock<L> {
    fn certificate(&self, namespace: &str, name: &str) -> Option<CertificateSpec> {
        self.read().certificate(namespace, name)
    }
}

impl<L: SecretLookup + ?Sized> SecretLookup for Arc<L> {
    fn certificate(&self, namespace: &str, name: &str) -> Option<CertificateSpec> {
        (**self).certificate(namespace, name)
    }
}
