//! Volume descriptors and the request shapes handed to an EC2 backend.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote state string of an unattached, usable volume.
pub const STATE_AVAILABLE: &str = "available";

/// Remote state string of an attached volume.
pub const STATE_IN_USE: &str = "in-use";

/// Tag key that carries a volume's identity.
pub const NAME_TAG: &str = "Name";

/// Snapshot state accepted when restoring from a label.
pub const SNAPSHOT_COMPLETED: &str = "completed";

/// Desired or observed lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ensure {
    #[default]
    Present,
    Absent,
}

impl fmt::Display for Ensure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ensure::Present => write!(f, "present"),
            Ensure::Absent => write!(f, "absent"),
        }
    }
}

/// Lifecycle state derived from a remote volume state.
///
/// An `available` volume is reported absent so that declaring it present
/// attaches it; every other state is present.
pub fn volume_ensure(state: &str) -> Ensure {
    if state == STATE_AVAILABLE {
        Ensure::Absent
    } else {
        Ensure::Present
    }
}

/// A volume attachment as observed remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub instance_id: String,
    pub device: String,
    #[serde(default)]
    pub delete_on_termination: bool,
}

/// Local view of one remote volume for the current reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub name: String,
    pub volume_id: Option<String>,
    pub size: Option<i32>,
    pub iops: Option<i32>,
    pub volume_type: Option<String>,
    pub availability_zone: Option<String>,
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attach: Vec<AttachmentDescriptor>,
    pub ensure: Ensure,
    pub state: Option<String>,
    pub region: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl VolumeDescriptor {
    /// Descriptor for a volume that has not been observed.
    pub fn absent(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            ensure: Ensure::Absent,
            ..Default::default()
        }
    }

    pub fn is_attached(&self) -> bool {
        !self.attach.is_empty()
    }
}

/// Raw volume as returned by `DescribeVolumes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVolume {
    pub volume_id: String,
    pub size: Option<i32>,
    pub iops: Option<i32>,
    pub volume_type: Option<String>,
    pub availability_zone: Option<String>,
    pub snapshot_id: Option<String>,
    pub state: String,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// Raw snapshot as returned by `DescribeSnapshots`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    #[serde(default)]
    pub description: String,
    pub state: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Value of the `Name` tag, if present and non-empty.
pub fn name_from_tags(tags: &[Tag]) -> Option<String> {
    tags.iter()
        .find(|t| t.key == NAME_TAG)
        .map(|t| t.value.clone())
        .filter(|v| !v.is_empty())
}

/// Describe-call filter: `name` matches any of `values`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Parameters of `CreateVolume`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateVolumeRequest {
    pub size: Option<i32>,
    pub availability_zone: String,
    pub volume_type: Option<String>,
    pub iops: Option<i32>,
    pub encrypted: Option<bool>,
    pub kms_key_id: Option<String>,
    pub snapshot_id: Option<String>,
}

/// Parameters of `AttachVolume`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachVolumeRequest {
    pub volume_id: String,
    pub instance_id: String,
    pub device: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_ensure() {
        assert_eq!(volume_ensure("available"), Ensure::Absent);
        assert_eq!(volume_ensure("in-use"), Ensure::Present);
        assert_eq!(volume_ensure("creating"), Ensure::Present);
        assert_eq!(volume_ensure("deleting"), Ensure::Present);
        assert_eq!(volume_ensure(""), Ensure::Present);
    }

    #[test]
    fn test_name_from_tags() {
        let tags = vec![Tag::new("env", "prod"), Tag::new("Name", "db-data")];
        assert_eq!(name_from_tags(&tags), Some("db-data".to_string()));
        assert_eq!(name_from_tags(&[Tag::new("Name", "")]), None);
        assert_eq!(name_from_tags(&[Tag::new("name", "lower")]), None);
        assert_eq!(name_from_tags(&[]), None);
    }

    #[test]
    fn test_ensure_serde() {
        let e: Ensure = serde_json::from_str("\"absent\"").unwrap();
        assert_eq!(e, Ensure::Absent);
        assert_eq!(serde_json::to_string(&Ensure::Present).unwrap(), "\"present\"");
    }
}
