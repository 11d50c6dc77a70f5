use core::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An axis of the evaluation context.
///
/// Stored data may name dimensions this build does not know about. Those
/// parse into [`Dimension::Unknown`] so the record survives a round trip, and
/// any condition on them evaluates as non-matching.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dimension {
    Hostname,
    ZoneId,
    Environment,
    ApplicationId,
    InstanceId,
    TenantId,
    NodeType,
    ClusterType,
    ClusterId,
    VespaVersion,
    Unknown(String),
}

impl Dimension {
    /// Every dimension this build knows, in canonical order.
    pub const KNOWN: [Dimension; 10] = [
        Dimension::Hostname,
        Dimension::ZoneId,
        Dimension::Environment,
        Dimension::ApplicationId,
        Dimension::InstanceId,
        Dimension::TenantId,
        Dimension::NodeType,
        Dimension::ClusterType,
        Dimension::ClusterId,
        Dimension::VespaVersion,
    ];

    pub fn wire_name(&self) -> &str {
        match self {
            Dimension::Hostname => "hostname",
            Dimension::ZoneId => "zone",
            Dimension::Environment => "environment",
            Dimension::ApplicationId => "application",
            Dimension::InstanceId => "instance",
            Dimension::TenantId => "tenant",
            Dimension::NodeType => "node-type",
            Dimension::ClusterType => "cluster-type",
            Dimension::ClusterId => "cluster-id",
            Dimension::VespaVersion => "vespa-version",
            Dimension::Unknown(name) => name,
        }
    }

    /// Never fails: names outside [`Dimension::KNOWN`] become `Unknown`.
    pub fn from_wire(name: &str) -> Self {
        Self::KNOWN
            .iter()
            .find(|d| d.wire_name() == name)
            .cloned()
            .unwrap_or_else(|| Dimension::Unknown(name.to_string()))
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Dimension::Unknown(_))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

impl Serialize for Dimension {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.wire_name())
    }
}

impl<'de> Deserialize<'de> for Dimension {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Dimension::from_wire(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names_round_trip() {
        for d in Dimension::KNOWN.iter() {
            assert_eq!(Dimension::from_wire(d.wire_name()), *d);
            assert!(d.is_known());
        }
    }

    #[test]
    fn test_unknown_name_is_kept() {
        let d = Dimension::from_wire("cloud-account");
        assert_eq!(d, Dimension::Unknown("cloud-account".to_string()));
        assert_eq!(d.to_string(), "cloud-account");
        assert!(!d.is_known());
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&Dimension::ZoneId).unwrap();
        assert_eq!(json, r#""zone""#);
        let d: Dimension = serde_json::from_str(r#""node-type""#).unwrap();
        assert_eq!(d, Dimension::NodeType);
    }
}
