//! Desired-state catalog.
//!
//! A catalog is a JSON document listing the volumes that should (or should
//! not) exist:
//!
//! ```json
//! {
//!   "volumes": [
//!     {
//!       "name": "db-data",
//!       "region": "eu-west-1",
//!       "availability_zone": "eu-west-1a",
//!       "size": 100,
//!       "volume_type": "gp3",
//!       "attach": { "instance_id": "i-0abc", "device": "/dev/sdf" },
//!       "tags": { "team": "storage" }
//!     }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Ensure, NAME_TAG, Tag};

/// Volume types that accept a provisioned IOPS value.
const IOPS_VOLUME_TYPES: &[&str] = &["io1", "io2", "gp3"];

/// Declared attachment of a volume to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachSpec {
    pub instance_id: String,
    pub device: String,
    /// Only written to the instance when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_on_termination: Option<bool>,
}

/// One declared volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeResource {
    pub name: String,
    #[serde(default)]
    pub ensure: Ensure,
    pub region: String,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub size: Option<i32>,
    #[serde(default)]
    pub iops: Option<i32>,
    #[serde(default)]
    pub volume_type: Option<String>,
    #[serde(default)]
    pub encrypted: Option<bool>,
    #[serde(default)]
    pub kms_key_id: Option<String>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    /// Restore from the latest completed snapshot with this description.
    #[serde(default)]
    pub snapshot_label: Option<String>,
    #[serde(default)]
    pub attach: Option<AttachSpec>,
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
}

impl VolumeResource {
    /// A present volume with nothing else declared.
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ensure: Ensure::Present,
            region: region.into(),
            availability_zone: None,
            size: None,
            iops: None,
            volume_type: None,
            encrypted: None,
            kms_key_id: None,
            snapshot_id: None,
            snapshot_label: None,
            attach: None,
            tags: None,
        }
    }

    /// Tags to write on a newly created volume; always carries `Name`.
    pub fn tags_for_resource(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self
            .tags
            .iter()
            .flatten()
            .filter(|(k, _)| k.as_str() != NAME_TAG)
            .map(|(k, v)| Tag::new(k.clone(), v.clone()))
            .collect();
        tags.push(Tag::new(NAME_TAG, self.name.clone()));
        tags
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(Error::invalid_resource(&self.name, reason));

        if self.name.trim().is_empty() {
            return Err(Error::invalid_resource("<unnamed>", "name must not be empty"));
        }
        if self.region.trim().is_empty() {
            return invalid("region must not be empty");
        }
        if let Some(size) = self.size {
            if size <= 0 {
                return invalid("size must be positive");
            }
        }
        if let Some(iops) = self.iops {
            let accepted = self
                .volume_type
                .as_deref()
                .is_some_and(|t| IOPS_VOLUME_TYPES.contains(&t));
            if !accepted {
                return invalid("iops requires volume_type io1, io2 or gp3");
            }
            if iops <= 0 {
                return invalid("iops must be positive");
            }
        }
        if let Some(attach) = &self.attach {
            if attach.instance_id.trim().is_empty() {
                return invalid("attach.instance_id must not be empty");
            }
            if attach.device.trim().is_empty() {
                return invalid("attach.device must not be empty");
            }
        }
        if self.ensure == Ensure::Present {
            if self.availability_zone.as_deref().is_none_or(str::is_empty) {
                return invalid("availability_zone is required when ensure is present");
            }
            if self.size.is_none() && self.snapshot_id.is_none() && self.snapshot_label.is_none()
            {
                return invalid("one of size, snapshot_id or snapshot_label is required");
            }
        }
        Ok(())
    }
}

/// The full set of declared volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub volumes: Vec<VolumeResource>,
}

impl Catalog {
    pub fn parse(json: &str) -> Result<Self> {
        let catalog: Catalog =
            serde_json::from_str(json).map_err(|e| Error::Catalog(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Catalog(format!("reading {}: {}", path.display(), e)))?;
        Self::parse(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for volume in &self.volumes {
            volume.validate()?;
            if !seen.insert(volume.name.as_str()) {
                return Err(Error::invalid_resource(&volume.name, "declared more than once"));
            }
        }
        Ok(())
    }

    /// Distinct regions named by the catalog, sorted.
    pub fn regions(&self) -> Vec<String> {
        self.volumes
            .iter()
            .map(|v| v.region.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn by_name(&self) -> HashMap<String, VolumeResource> {
        self.volumes
            .iter()
            .map(|v| (v.name.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(name: &str) -> VolumeResource {
        VolumeResource {
            availability_zone: Some("us-east-1a".into()),
            size: Some(10),
            ..VolumeResource::new(name, "us-east-1")
        }
    }

    #[test]
    fn test_parse_catalog() {
        let catalog = Catalog::parse(
            r#"{
                "volumes": [
                    {
                        "name": "db-data",
                        "region": "eu-west-1",
                        "availability_zone": "eu-west-1a",
                        "size": 100,
                        "volume_type": "gp3",
                        "iops": 3000,
                        "attach": {
                            "instance_id": "i-0abc",
                            "device": "/dev/sdf",
                            "delete_on_termination": false
                        },
                        "tags": { "team": "storage" }
                    },
                    { "name": "old", "region": "us-east-1", "ensure": "absent" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(catalog.volumes.len(), 2);
        let db = &catalog.volumes[0];
        assert_eq!(db.ensure, Ensure::Present);
        assert_eq!(db.attach.as_ref().unwrap().delete_on_termination, Some(false));
        assert_eq!(catalog.volumes[1].ensure, Ensure::Absent);
        assert_eq!(catalog.regions(), vec!["eu-west-1", "us-east-1"]);
        assert!(catalog.by_name().contains_key("old"));
    }

    #[test]
    fn test_parse_rejects_bad_json() {
        let err = Catalog::parse("{ not json").unwrap_err();
        assert!(matches!(err, Error::Catalog(_)));
    }

    #[test]
    fn test_validate_rules() {
        assert!(present("ok").validate().is_ok());

        let mut v = present("no-zone");
        v.availability_zone = None;
        assert!(v.validate().is_err());

        let mut v = present("no-size");
        v.size = None;
        assert!(v.validate().is_err());
        v.snapshot_label = Some("nightly".into());
        assert!(v.validate().is_ok());

        let mut v = present("iops-gp2");
        v.iops = Some(100);
        v.volume_type = Some("gp2".into());
        assert!(v.validate().is_err());
        v.volume_type = Some("io1".into());
        assert!(v.validate().is_ok());

        let mut v = present("bad-attach");
        v.attach = Some(AttachSpec {
            instance_id: "".into(),
            device: "/dev/sdf".into(),
            delete_on_termination: None,
        });
        assert!(v.validate().is_err());

        // absent volumes need no sizing
        let mut v = VolumeResource::new("gone", "us-east-1");
        v.ensure = Ensure::Absent;
        assert!(v.validate().is_ok());

        assert!(VolumeResource::new("", "us-east-1").validate().is_err());
        assert!(present("x").validate().is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let catalog = Catalog {
            volumes: vec![present("dup"), present("dup")],
        };
        let err = catalog.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_tags_for_resource_adds_name() {
        let mut v = present("web");
        assert_eq!(v.tags_for_resource(), vec![Tag::new("Name", "web")]);

        let mut tags = BTreeMap::new();
        tags.insert("env".to_string(), "prod".to_string());
        tags.insert("Name".to_string(), "ignored".to_string());
        v.tags = Some(tags);
        assert_eq!(
            v.tags_for_resource(),
            vec![Tag::new("env", "prod"), Tag::new("Name", "web")]
        );
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        tokio::fs::write(
            &path,
            r#"{"volumes":[{"name":"a","region":"us-east-1","availability_zone":"us-east-1a","size":1}]}"#,
        )
        .await
        .unwrap();

        let catalog = Catalog::load(&path).await.unwrap();
        assert_eq!(catalog.volumes[0].name, "a");

        let err = Catalog::load(&dir.path().join("missing.json")).await.unwrap_err();
        assert!(matches!(err, Error::Catalog(_)));
    }
}
