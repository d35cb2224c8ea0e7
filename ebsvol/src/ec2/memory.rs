//! In-memory EC2 backend.
//!
//! Volumes change state instantly: a created volume is `available`, an
//! attached one `in-use`. Every call is recorded in order so callers can
//! check what was issued, and failures can be injected per operation.
//! Region state can be seeded from and written back to a JSON file, which
//! is how `ebsvol --backend memory` simulates a pass.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{Ec2Api, Ec2ClientFactory};
use crate::error::{ApiError, Error, Result};
use crate::model::{
    AttachVolumeRequest, AttachmentDescriptor, CreateVolumeRequest, Filter, RemoteVolume, Snapshot,
    STATE_AVAILABLE, STATE_IN_USE, Tag,
};

/// EC2 operations, named as the API names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    DescribeVolumes,
    DescribeSnapshots,
    CreateVolume,
    CreateTags,
    AttachVolume,
    DetachVolume,
    DeleteVolume,
    WaitUntilVolumeAvailable,
    ModifyInstanceAttribute,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::DescribeVolumes => "DescribeVolumes",
            Operation::DescribeSnapshots => "DescribeSnapshots",
            Operation::CreateVolume => "CreateVolume",
            Operation::CreateTags => "CreateTags",
            Operation::AttachVolume => "AttachVolume",
            Operation::DetachVolume => "DetachVolume",
            Operation::DeleteVolume => "DeleteVolume",
            Operation::WaitUntilVolumeAvailable => "WaitUntilVolumeAvailable",
            Operation::ModifyInstanceAttribute => "ModifyInstanceAttribute",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    DescribeVolumes,
    DescribeSnapshots { filters: Vec<Filter> },
    CreateVolume(CreateVolumeRequest),
    CreateTags { resource_ids: Vec<String>, tags: Vec<Tag> },
    AttachVolume(AttachVolumeRequest),
    DetachVolume { volume_id: String, force: bool },
    DeleteVolume { volume_id: String },
    WaitUntilVolumeAvailable { volume_id: String },
    ModifyInstanceAttribute {
        instance_id: String,
        device: String,
        delete_on_termination: bool,
    },
}

impl Call {
    pub fn operation(&self) -> Operation {
        match self {
            Call::DescribeVolumes => Operation::DescribeVolumes,
            Call::DescribeSnapshots { .. } => Operation::DescribeSnapshots,
            Call::CreateVolume(_) => Operation::CreateVolume,
            Call::CreateTags { .. } => Operation::CreateTags,
            Call::AttachVolume(_) => Operation::AttachVolume,
            Call::DetachVolume { .. } => Operation::DetachVolume,
            Call::DeleteVolume { .. } => Operation::DeleteVolume,
            Call::WaitUntilVolumeAvailable { .. } => Operation::WaitUntilVolumeAvailable,
            Call::ModifyInstanceAttribute { .. } => Operation::ModifyInstanceAttribute,
        }
    }
}

/// Persistable contents of one region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionState {
    #[serde(default)]
    pub volumes: Vec<RemoteVolume>,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
}

struct InjectedFailure {
    operation: Operation,
    code: String,
    remaining: u32,
}

#[derive(Default)]
struct Inner {
    state: RegionState,
    calls: Vec<Call>,
    failures: Vec<InjectedFailure>,
}

impl Inner {
    fn record(&mut self, call: Call) -> Result<()> {
        let operation = call.operation();
        self.calls.push(call);
        if let Some(failure) = self
            .failures
            .iter_mut()
            .find(|f| f.operation == operation && f.remaining > 0)
        {
            failure.remaining -= 1;
            return Err(ApiError::new(
                operation.as_str(),
                failure.code.clone(),
                "injected failure",
            )
            .into());
        }
        Ok(())
    }

    fn volume_mut(&mut self, operation: Operation, volume_id: &str) -> Result<&mut RemoteVolume> {
        self.state
            .volumes
            .iter_mut()
            .find(|v| v.volume_id == volume_id)
            .ok_or_else(|| not_found(operation, volume_id))
    }
}

fn not_found(operation: Operation, volume_id: &str) -> Error {
    ApiError::new(
        operation.as_str(),
        "InvalidVolume.NotFound",
        format!("The volume '{volume_id}' does not exist."),
    )
    .into()
}

fn incorrect_state(operation: Operation, volume: &RemoteVolume) -> Error {
    ApiError::new(
        operation.as_str(),
        "IncorrectState",
        format!("Volume '{}' is in the '{}' state.", volume.volume_id, volume.state),
    )
    .into()
}

/// In-memory EC2 for one region.
pub struct MemoryEc2 {
    region: String,
    inner: Mutex<Inner>,
}

impl MemoryEc2 {
    pub fn new(region: impl Into<String>) -> Self {
        Self::with_state(region, RegionState::default())
    }

    pub fn with_state(region: impl Into<String>, state: RegionState) -> Self {
        Self {
            region: region.into(),
            inner: Mutex::new(Inner {
                state,
                ..Default::default()
            }),
        }
    }

    pub async fn add_volume(&self, volume: RemoteVolume) {
        self.inner.lock().await.state.volumes.push(volume);
    }

    pub async fn add_snapshot(&self, snapshot: Snapshot) {
        self.inner.lock().await.state.snapshots.push(snapshot);
    }

    /// Fail the next `times` calls of `operation` with API error `code`.
    pub async fn fail_next(&self, operation: Operation, code: &str, times: u32) {
        self.inner.lock().await.failures.push(InjectedFailure {
            operation,
            code: code.to_string(),
            remaining: times,
        });
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.inner.lock().await.calls.clone()
    }

    /// Recorded operations, ignoring arguments.
    pub async fn operations(&self) -> Vec<Operation> {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .map(Call::operation)
            .collect()
    }

    pub async fn volume(&self, volume_id: &str) -> Option<RemoteVolume> {
        self.inner
            .lock()
            .await
            .state
            .volumes
            .iter()
            .find(|v| v.volume_id == volume_id)
            .cloned()
    }

    pub async fn state(&self) -> RegionState {
        self.inner.lock().await.state.clone()
    }
}

#[async_trait]
impl Ec2Api for MemoryEc2 {
    async fn describe_volumes(&self) -> Result<Vec<RemoteVolume>> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::DescribeVolumes)?;
        Ok(inner.state.volumes.clone())
    }

    async fn describe_snapshots(&self, filters: &[Filter]) -> Result<Vec<Snapshot>> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::DescribeSnapshots {
            filters: filters.to_vec(),
        })?;

        let mut matched = Vec::new();
        for snapshot in &inner.state.snapshots {
            let mut keep = true;
            for filter in filters {
                let field = match filter.name.as_str() {
                    "description" => &snapshot.description,
                    "status" => &snapshot.state,
                    "snapshot-id" => &snapshot.snapshot_id,
                    other => {
                        return Err(ApiError::new(
                            Operation::DescribeSnapshots.as_str(),
                            "InvalidParameterValue",
                            format!("The filter '{other}' is invalid"),
                        )
                        .into());
                    }
                };
                keep &= filter.values.iter().any(|v| v == field);
            }
            if keep {
                matched.push(snapshot.clone());
            }
        }
        Ok(matched)
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<String> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::CreateVolume(request.clone()))?;

        let size = match (&request.snapshot_id, request.size) {
            (Some(snapshot_id), size) => {
                if !inner
                    .state
                    .snapshots
                    .iter()
                    .any(|s| &s.snapshot_id == snapshot_id)
                {
                    return Err(ApiError::new(
                        Operation::CreateVolume.as_str(),
                        "InvalidSnapshot.NotFound",
                        format!("The snapshot '{snapshot_id}' does not exist."),
                    )
                    .into());
                }
                size
            }
            (None, Some(size)) => Some(size),
            (None, None) => {
                return Err(ApiError::new(
                    Operation::CreateVolume.as_str(),
                    "MissingParameter",
                    "The request must contain the parameter size or snapshotId",
                )
                .into());
            }
        };

        let volume_id = format!("vol-{}", &Uuid::new_v4().simple().to_string()[..17]);
        debug!(region = %self.region, volume_id = %volume_id, "Creating in-memory volume");
        inner.state.volumes.push(RemoteVolume {
            volume_id: volume_id.clone(),
            size,
            iops: request.iops,
            volume_type: Some(
                request
                    .volume_type
                    .clone()
                    .unwrap_or_else(|| "gp2".to_string()),
            ),
            availability_zone: Some(request.availability_zone.clone()),
            snapshot_id: request.snapshot_id.clone(),
            state: STATE_AVAILABLE.to_string(),
            encrypted: request.encrypted.unwrap_or(false),
            attachments: Vec::new(),
            tags: Vec::new(),
        });
        Ok(volume_id)
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::CreateTags {
            resource_ids: resource_ids.to_vec(),
            tags: tags.to_vec(),
        })?;

        for id in resource_ids {
            let volume = inner.volume_mut(Operation::CreateTags, id)?;
            for tag in tags {
                match volume.tags.iter_mut().find(|t| t.key == tag.key) {
                    Some(existing) => existing.value = tag.value.clone(),
                    None => volume.tags.push(tag.clone()),
                }
            }
        }
        Ok(())
    }

    async fn attach_volume(&self, request: &AttachVolumeRequest) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::AttachVolume(request.clone()))?;

        let volume = inner.volume_mut(Operation::AttachVolume, &request.volume_id)?;
        if volume.state != STATE_AVAILABLE {
            return Err(incorrect_state(Operation::AttachVolume, volume));
        }
        volume.attachments = vec![AttachmentDescriptor {
            instance_id: request.instance_id.clone(),
            device: request.device.clone(),
            delete_on_termination: false,
        }];
        volume.state = STATE_IN_USE.to_string();
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, force: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::DetachVolume {
            volume_id: volume_id.to_string(),
            force,
        })?;

        let volume = inner.volume_mut(Operation::DetachVolume, volume_id)?;
        if volume.attachments.is_empty() {
            return Err(incorrect_state(Operation::DetachVolume, volume));
        }
        volume.attachments.clear();
        volume.state = STATE_AVAILABLE.to_string();
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::DeleteVolume {
            volume_id: volume_id.to_string(),
        })?;

        let volume = inner.volume_mut(Operation::DeleteVolume, volume_id)?;
        if volume.state != STATE_AVAILABLE {
            return Err(ApiError::new(
                Operation::DeleteVolume.as_str(),
                "VolumeInUse",
                format!("Volume {volume_id} is currently attached"),
            )
            .into());
        }
        inner.state.volumes.retain(|v| v.volume_id != volume_id);
        Ok(())
    }

    async fn wait_until_volume_available(&self, volume_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::WaitUntilVolumeAvailable {
            volume_id: volume_id.to_string(),
        })?;

        let volume = inner.volume_mut(Operation::WaitUntilVolumeAvailable, volume_id)?;
        if volume.state != STATE_AVAILABLE {
            return Err(ApiError::new(
                Operation::WaitUntilVolumeAvailable.as_str(),
                "ResourceNotReady",
                format!("Volume {volume_id} did not become available"),
            )
            .into());
        }
        Ok(())
    }

    async fn modify_instance_attribute(
        &self,
        instance_id: &str,
        device: &str,
        delete_on_termination: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::ModifyInstanceAttribute {
            instance_id: instance_id.to_string(),
            device: device.to_string(),
            delete_on_termination,
        })?;

        let attachment = inner
            .state
            .volumes
            .iter_mut()
            .flat_map(|v| v.attachments.iter_mut())
            .find(|a| a.instance_id == instance_id && a.device == device)
            .ok_or_else(|| {
                Error::from(ApiError::new(
                    Operation::ModifyInstanceAttribute.as_str(),
                    "InvalidInstanceAttributeValue",
                    format!("No device {device} mapped on instance {instance_id}"),
                ))
            })?;
        attachment.delete_on_termination = delete_on_termination;
        Ok(())
    }
}

/// Region-keyed set of [`MemoryEc2`] clients.
#[derive(Default)]
pub struct MemoryEc2Factory {
    regions: Mutex<BTreeMap<String, Arc<MemoryEc2>>>,
}

impl MemoryEc2Factory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: BTreeMap<String, RegionState>) -> Self {
        let regions = state
            .into_iter()
            .map(|(region, s)| {
                let client = Arc::new(MemoryEc2::with_state(region.clone(), s));
                (region, client)
            })
            .collect();
        Self {
            regions: Mutex::new(regions),
        }
    }

    /// Load region state from a JSON file. A missing file is an empty world.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Self::from_state(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let state = self.state().await;
        let json = serde_json::to_vec_pretty(&state)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Client for `region`, created empty on first use.
    pub async fn region(&self, region: &str) -> Arc<MemoryEc2> {
        let mut regions = self.regions.lock().await;
        Arc::clone(
            regions
                .entry(region.to_string())
                .or_insert_with(|| Arc::new(MemoryEc2::new(region))),
        )
    }

    pub async fn state(&self) -> BTreeMap<String, RegionState> {
        let regions: Vec<(String, Arc<MemoryEc2>)> = self
            .regions
            .lock()
            .await
            .iter()
            .map(|(r, c)| (r.clone(), Arc::clone(c)))
            .collect();

        let mut out = BTreeMap::new();
        for (region, client) in regions {
            out.insert(region, client.state().await);
        }
        out
    }
}

#[async_trait]
impl Ec2ClientFactory for MemoryEc2Factory {
    async fn client(&self, region: &str) -> Result<Arc<dyn Ec2Api>> {
        let client: Arc<dyn Ec2Api> = self.region(region).await;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn request(size: i32) -> CreateVolumeRequest {
        CreateVolumeRequest {
            size: Some(size),
            availability_zone: "us-east-1a".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_volume_lifecycle() {
        let ec2 = MemoryEc2::new("us-east-1");
        let id = ec2.create_volume(&request(10)).await.unwrap();
        assert!(id.starts_with("vol-"));

        let vol = ec2.volume(&id).await.unwrap();
        assert_eq!(vol.state, STATE_AVAILABLE);
        assert_eq!(vol.size, Some(10));

        ec2.attach_volume(&AttachVolumeRequest {
            volume_id: id.clone(),
            instance_id: "i-123".to_string(),
            device: "/dev/sdf".to_string(),
        })
        .await
        .unwrap();
        assert_eq!(ec2.volume(&id).await.unwrap().state, STATE_IN_USE);

        // attached volumes cannot be deleted
        let err = ec2.delete_volume(&id).await.unwrap_err();
        assert_eq!(err.api_code(), Some("VolumeInUse"));

        ec2.detach_volume(&id, true).await.unwrap();
        ec2.delete_volume(&id).await.unwrap();
        assert!(ec2.volume(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let ec2 = MemoryEc2::new("us-east-1");
        ec2.fail_next(Operation::DescribeVolumes, "RequestLimitExceeded", 2)
            .await;

        assert!(ec2.describe_volumes().await.is_err());
        assert!(ec2.describe_volumes().await.is_err());
        assert!(ec2.describe_volumes().await.is_ok());
        assert_eq!(ec2.operations().await.len(), 3);
    }

    #[tokio::test]
    async fn test_snapshot_filters() {
        let ec2 = MemoryEc2::new("us-east-1");
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ec2.add_snapshot(Snapshot {
            snapshot_id: "snap-1".into(),
            description: "nightly".into(),
            state: "completed".into(),
            start_time: at,
        })
        .await;
        ec2.add_snapshot(Snapshot {
            snapshot_id: "snap-2".into(),
            description: "nightly".into(),
            state: "pending".into(),
            start_time: at,
        })
        .await;

        let found = ec2
            .describe_snapshots(&[
                Filter::new("description", &["nightly"]),
                Filter::new("status", &["completed"]),
            ])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].snapshot_id, "snap-1");

        let err = ec2
            .describe_snapshots(&[Filter::new("owner-alias", &["amazon"])])
            .await
            .unwrap_err();
        assert_eq!(err.api_code(), Some("InvalidParameterValue"));
    }

    #[tokio::test]
    async fn test_create_requires_size_or_snapshot() {
        let ec2 = MemoryEc2::new("us-east-1");
        let err = ec2
            .create_volume(&CreateVolumeRequest {
                availability_zone: "us-east-1a".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.api_code(), Some("MissingParameter"));
    }

    #[tokio::test]
    async fn test_factory_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let factory = MemoryEc2Factory::new();
        let id = factory
            .region("eu-west-1")
            .await
            .create_volume(&request(5))
            .await
            .unwrap();
        factory.save(&path).await.unwrap();

        let loaded = MemoryEc2Factory::load(&path).await.unwrap();
        let vol = loaded.region("eu-west-1").await.volume(&id).await;
        assert_eq!(vol.map(|v| v.size), Some(Some(5)));

        let empty = MemoryEc2Factory::load(&dir.path().join("missing.json"))
            .await
            .unwrap();
        assert!(empty.state().await.is_empty());
    }
}
