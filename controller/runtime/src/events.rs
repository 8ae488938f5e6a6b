use crate::{
    core::{ClusterInfo, ClusterKey, ResourceId},
    index::ServiceInfo,
    k8s::{ResourceExt, ServiceExport},
};
use std::{fmt, sync::Arc};

/// The lifecycle of a ServiceExport as seen by the cluster set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// An export was created or changed in a member cluster.
    ServiceExportCreated,
    /// An export was removed from a member cluster.
    ServiceExportDeleted,
    /// The control plane admitted an export into the cluster set.
    ServiceExportAccepted,
    /// The control plane refused an export because it conflicts with one
    /// already accepted.
    ServiceExportRejected,
}

#[derive(Clone, Debug)]
pub struct Message {
    pub topic: Topic,
    pub event: Arc<ServiceExportEvent>,
}

/// An export and the context needed to act on it in any cluster.
#[derive(Clone, Debug)]
pub struct ServiceExportEvent {
    /// The cluster in which the export lives.
    pub geo: ClusterInfo,
    pub export: ServiceExport,
    pub service: Option<ServiceInfo>,
    /// Why the export was rejected.
    pub error: Option<String>,
}

/// Deduplicates messages in the broker's backoff.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageKey {
    topic: Topic,
    cluster: ClusterKey,
    export: ResourceId,
}

// === impl Topic ===

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceExportCreated => "service.export.created",
            Self::ServiceExportDeleted => "service.export.deleted",
            Self::ServiceExportAccepted => "service.export.accepted",
            Self::ServiceExportRejected => "service.export.rejected",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Message ===

impl Message {
    pub fn new(topic: Topic, event: ServiceExportEvent) -> Self {
        Self {
            topic,
            event: Arc::new(event),
        }
    }

    /// Re-publishes the event under another topic.
    pub fn with_topic(&self, topic: Topic, error: Option<String>) -> Self {
        let mut event = (*self.event).clone();
        event.error = error;
        Self::new(topic, event)
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            topic: self.topic,
            cluster: self.event.geo.key.clone(),
            export: self.event.export_id(),
        }
    }
}

// === impl ServiceExportEvent ===

impl ServiceExportEvent {
    pub fn export_id(&self) -> ResourceId {
        ResourceId::new(
            self.export.namespace().unwrap_or_default(),
            self.export.name_unchecked(),
        )
    }

    #[allow(dead_code)]
    pub fn cluster_key(&self) -> &ClusterKey {
        &self.geo.key
    }
}
