//! EC2 backend on the AWS SDK.
//!
//! Credentials come from the SDK's default provider chain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::Client;
use aws_sdk_ec2::client::Waiters;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    EbsInstanceBlockDeviceSpecification, Filter as Ec2Filter,
    InstanceBlockDeviceMappingSpecification, Tag as Ec2Tag, VolumeType,
};
use chrono::DateTime;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Ec2Api, Ec2ClientFactory};
use crate::error::{ApiError, Error, Result};
use crate::model::{
    AttachVolumeRequest, AttachmentDescriptor, CreateVolumeRequest, Filter, RemoteVolume, Snapshot,
    Tag,
};

/// How long to wait for a volume to become available.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

fn api_error<E, R>(operation: &str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = err.code().unwrap_or_default().to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    ApiError::new(operation, code, message).into()
}

fn remote_volume(volume: &aws_sdk_ec2::types::Volume) -> RemoteVolume {
    RemoteVolume {
        volume_id: volume.volume_id().unwrap_or_default().to_string(),
        size: volume.size(),
        iops: volume.iops(),
        volume_type: volume.volume_type().map(|t| t.as_str().to_string()),
        availability_zone: volume.availability_zone().map(str::to_string),
        snapshot_id: volume
            .snapshot_id()
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        state: volume
            .state()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        encrypted: volume.encrypted().unwrap_or(false),
        attachments: volume
            .attachments()
            .iter()
            .map(|a| AttachmentDescriptor {
                instance_id: a.instance_id().unwrap_or_default().to_string(),
                device: a.device().unwrap_or_default().to_string(),
                delete_on_termination: a.delete_on_termination().unwrap_or(false),
            })
            .collect(),
        tags: volume
            .tags()
            .iter()
            .map(|t| {
                Tag::new(
                    t.key().unwrap_or_default(),
                    t.value().unwrap_or_default(),
                )
            })
            .collect(),
    }
}

fn snapshot(snapshot: &aws_sdk_ec2::types::Snapshot) -> Option<Snapshot> {
    let started = snapshot.start_time()?;
    Some(Snapshot {
        snapshot_id: snapshot.snapshot_id()?.to_string(),
        description: snapshot.description().unwrap_or_default().to_string(),
        state: snapshot
            .state()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        start_time: DateTime::from_timestamp(started.secs(), started.subsec_nanos())?,
    })
}

/// EC2 client for one region.
pub struct AwsEc2 {
    client: Client,
    wait_timeout: Duration,
}

impl AwsEc2 {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

#[async_trait]
impl Ec2Api for AwsEc2 {
    async fn describe_volumes(&self) -> Result<Vec<RemoteVolume>> {
        let mut volumes = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .client
                .describe_volumes()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| api_error("DescribeVolumes", e))?;

            volumes.extend(output.volumes().iter().map(remote_volume));
            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(volumes)
    }

    async fn describe_snapshots(&self, filters: &[Filter]) -> Result<Vec<Snapshot>> {
        let filters: Vec<Ec2Filter> = filters
            .iter()
            .map(|f| {
                Ec2Filter::builder()
                    .name(f.name.clone())
                    .set_values(Some(f.values.clone()))
                    .build()
            })
            .collect();

        let output = self
            .client
            .describe_snapshots()
            .set_filters(Some(filters))
            .send()
            .await
            .map_err(|e| api_error("DescribeSnapshots", e))?;
        Ok(output.snapshots().iter().filter_map(snapshot).collect())
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<String> {
        let output = self
            .client
            .create_volume()
            .availability_zone(request.availability_zone.clone())
            .set_size(request.size)
            .set_volume_type(request.volume_type.as_deref().map(VolumeType::from))
            .set_iops(request.iops)
            .set_encrypted(request.encrypted)
            .set_kms_key_id(request.kms_key_id.clone())
            .set_snapshot_id(request.snapshot_id.clone())
            .send()
            .await
            .map_err(|e| api_error("CreateVolume", e))?;

        output.volume_id().map(str::to_string).ok_or_else(|| {
            ApiError::new("CreateVolume", "", "response carried no volume id").into()
        })
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<()> {
        let tags: Vec<Ec2Tag> = tags
            .iter()
            .map(|t| {
                Ec2Tag::builder()
                    .key(t.key.clone())
                    .value(t.value.clone())
                    .build()
            })
            .collect();

        self.client
            .create_tags()
            .set_resources(Some(resource_ids.to_vec()))
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|e| api_error("CreateTags", e))?;
        Ok(())
    }

    async fn attach_volume(&self, request: &AttachVolumeRequest) -> Result<()> {
        self.client
            .attach_volume()
            .volume_id(request.volume_id.clone())
            .instance_id(request.instance_id.clone())
            .device(request.device.clone())
            .send()
            .await
            .map_err(|e| api_error("AttachVolume", e))?;
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, force: bool) -> Result<()> {
        self.client
            .detach_volume()
            .volume_id(volume_id)
            .force(force)
            .send()
            .await
            .map_err(|e| api_error("DetachVolume", e))?;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.client
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(|e| api_error("DeleteVolume", e))?;
        Ok(())
    }

    async fn wait_until_volume_available(&self, volume_id: &str) -> Result<()> {
        debug!(volume_id = %volume_id, "Waiting for volume to become available");
        self.client
            .wait_until_volume_available()
            .volume_ids(volume_id)
            .wait(self.wait_timeout)
            .await
            .map_err(|e| {
                Error::from(ApiError::new(
                    "WaitUntilVolumeAvailable",
                    "ResourceNotReady",
                    DisplayErrorContext(&e).to_string(),
                ))
            })?;
        Ok(())
    }

    async fn modify_instance_attribute(
        &self,
        instance_id: &str,
        device: &str,
        delete_on_termination: bool,
    ) -> Result<()> {
        let mapping = InstanceBlockDeviceMappingSpecification::builder()
            .device_name(device)
            .ebs(
                EbsInstanceBlockDeviceSpecification::builder()
                    .delete_on_termination(delete_on_termination)
                    .build(),
            )
            .build();

        self.client
            .modify_instance_attribute()
            .instance_id(instance_id)
            .block_device_mappings(mapping)
            .send()
            .await
            .map_err(|e| api_error("ModifyInstanceAttribute", e))?;
        Ok(())
    }
}

/// Builds one SDK client per region, lazily.
pub struct AwsEc2Factory {
    clients: Mutex<HashMap<String, Arc<AwsEc2>>>,
    wait_timeout: Duration,
}

impl AwsEc2Factory {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            wait_timeout,
        }
    }
}

impl Default for AwsEc2Factory {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT_TIMEOUT)
    }
}

#[async_trait]
impl Ec2ClientFactory for AwsEc2Factory {
    async fn client(&self, region: &str) -> Result<Arc<dyn Ec2Api>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(region) {
            let client: Arc<dyn Ec2Api> = client.clone();
            return Ok(client);
        }

        debug!(region = %region, "Loading AWS configuration");
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        let client =
            Arc::new(AwsEc2::new(Client::new(&config)).with_wait_timeout(self.wait_timeout));
        clients.insert(region.to_string(), Arc::clone(&client));
        Ok(client)
    }
}
