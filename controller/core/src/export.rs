use crate::ClusterKey;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PathType {
    Exact,
    Prefix,
}

/// The structural signature of a service export.
///
/// Two exports of the same service are compatible iff their signatures are
/// equal: they expose the same set of ports through the same set of
/// `(path, pathType)` rules.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportShape {
    pub ports: BTreeSet<u16>,
    pub paths: BTreeSet<(String, PathType)>,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Conflict {
    #[error("conflicts with the export in cluster {cluster}: port set {theirs} does not match {ours}")]
    Ports {
        cluster: ClusterKey,
        ours: PortSet,
        theirs: PortSet,
    },

    #[error("conflicts with the export in cluster {cluster}: paths {theirs} do not match {ours}")]
    Paths {
        cluster: ClusterKey,
        ours: PathSet,
        theirs: PathSet,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSet(pub BTreeSet<u16>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathSet(pub BTreeSet<(String, PathType)>);

// === impl ExportShape ===

impl ExportShape {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = (u16, S, PathType)>,
        S: Into<String>,
    {
        let mut shape = Self::default();
        for (port, path, path_type) in rules {
            shape.ports.insert(port);
            shape.paths.insert((path.into(), path_type));
        }
        shape
    }

    /// Checks this export against one accepted in `cluster`.
    pub fn check_compatible(&self, accepted: &Self, cluster: &ClusterKey) -> Result<(), Conflict> {
        if self.ports != accepted.ports {
            return Err(Conflict::Ports {
                cluster: cluster.clone(),
                ours: PortSet(self.ports.clone()),
                theirs: PortSet(accepted.ports.clone()),
            });
        }

        if self.paths != accepted.paths {
            return Err(Conflict::Paths {
                cluster: cluster.clone(),
                ours: PathSet(self.paths.clone()),
                theirs: PathSet(accepted.paths.clone()),
            });
        }

        Ok(())
    }
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => "Exact".fmt(f),
            Self::Prefix => "Prefix".fmt(f),
        }
    }
}

impl fmt::Display for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ports = self.0.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        write!(f, "[{}]", ports.join(", "))
    }
}

impl fmt::Display for PathSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let paths = self
            .0
            .iter()
            .map(|(path, path_type)| format!("{path} ({path_type})"))
            .collect::<Vec<_>>();
        write!(f, "[{}]", paths.join(", "))
    }
}
