use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, net::Ipv4Addr, str::FromStr};

const DEFAULT_LOCALITY: &str = "default";

/// Identifies a member of the cluster set by its locality.
///
/// Keys render as `region/zone/group/name`. Empty locality segments fall back
/// to `default`, so a key is a pure function of the four inputs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterKey {
    pub region: String,
    pub zone: String,
    pub group: String,
    pub name: String,
}

/// Describes how a member cluster is reached by its peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterInfo {
    pub key: ClusterKey,

    /// The FQDN or IPv4 address of the cluster's gateway.
    pub gateway_host: String,

    /// The resolved gateway address, when the host resolves to IPv4.
    pub gateway_ip: Option<Ipv4Addr>,

    pub gateway_port: u16,

    /// Set for the home cluster, i.e. the cluster running this process.
    pub in_cluster: bool,

    /// The UID of the control plane that manages this cluster.
    pub control_plane_uid: String,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid cluster key {0:?}: expected region/zone/group/name")]
pub struct InvalidClusterKey(String);

// === impl ClusterKey ===

impl ClusterKey {
    pub fn new(
        region: impl Into<String>,
        zone: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        fn or_default(s: String) -> String {
            if s.is_empty() {
                DEFAULT_LOCALITY.to_string()
            } else {
                s
            }
        }

        Self {
            region: or_default(region.into()),
            zone: or_default(zone.into()),
            group: or_default(group.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.region, self.zone, self.group, self.name)
    }
}

impl FromStr for ClusterKey {
    type Err = InvalidClusterKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.split('/').collect::<Vec<_>>();
        match parts.as_slice() {
            [region, zone, group, name]
                if [region, zone, group, name].iter().all(|p| !p.is_empty()) =>
            {
                Ok(Self::new(*region, *zone, *group, *name))
            }
            _ => Err(InvalidClusterKey(s.to_string())),
        }
    }
}

impl Serialize for ClusterKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClusterKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// === impl ClusterInfo ===

impl ClusterInfo {
    /// The address peers use to reach exports of this cluster.
    pub fn gateway_addr(&self) -> String {
        format!("{}:{}", self.gateway_host, self.gateway_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_pure() {
        let a = ClusterKey::new("east", "z1", "g", "c0");
        let b = ClusterKey::new("east", "z1", "g", "c0");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "east/z1/g/c0");
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn empty_locality_defaults() {
        let key = ClusterKey::new("", "", "", "c0");
        assert_eq!(key.to_string(), "default/default/default/c0");
        assert_eq!(key, ClusterKey::new("default", "default", "default", "c0"));
    }

    #[test]
    fn parse_roundtrip() {
        let key = "r/z/g/n".parse::<ClusterKey>().unwrap();
        assert_eq!(key, ClusterKey::new("r", "z", "g", "n"));
        assert!("r/z/g".parse::<ClusterKey>().is_err());
        assert!("r/z//n".parse::<ClusterKey>().is_err());
        assert!("r/z/g/n/x".parse::<ClusterKey>().is_err());
    }

    #[test]
    fn serializes_as_string() {
        let key = ClusterKey::new("r", "z", "g", "n");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"r/z/g/n\"");
        assert_eq!(serde_json::from_str::<ClusterKey>(&json).unwrap(), key);
    }
}
