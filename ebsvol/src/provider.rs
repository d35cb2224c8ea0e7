//! Volume provider - the lifecycle operations for one declared volume.
//!
//! A provider pairs a catalog resource (desired state) with the descriptor
//! fetched for it (observed state, or an absent placeholder) and converges
//! them through EC2 calls, each wrapped in the retry executor.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::catalog::VolumeResource;
use crate::ec2::Ec2Api;
use crate::error::{Error, REQUEST_LIMIT_EXCEEDED, Result};
use crate::model::{
    AttachVolumeRequest, AttachmentDescriptor, CreateVolumeRequest, Ensure, Filter,
    SNAPSHOT_COMPLETED, STATE_AVAILABLE, STATE_IN_USE, Snapshot, VolumeDescriptor,
};
use crate::retry::RetryPolicy;

/// Filters selecting completed snapshots whose description is `label`.
pub fn snapshot_filters(label: &str) -> Vec<Filter> {
    vec![
        Filter::new("description", &[label]),
        Filter::new("status", &[SNAPSHOT_COMPLETED]),
    ]
}

/// The candidate with the latest start time.
pub fn select_latest(snapshots: &[Snapshot]) -> Option<&Snapshot> {
    snapshots.iter().max_by_key(|s| s.start_time)
}

/// Lifecycle operations for one volume.
pub struct VolumeProvider {
    resource: VolumeResource,
    property: VolumeDescriptor,
    client: Arc<dyn Ec2Api>,
    policy: RetryPolicy,
    /// Volume was created by this provider during the current pass.
    created: bool,
    /// Set once a volume was created here but not yet tagged.
    untagged: bool,
    /// Detach was issued but the volume has not been seen available yet.
    detaching: bool,
}

impl VolumeProvider {
    /// `observed` is the prefetched descriptor; `None` means nothing was found.
    pub fn new(
        resource: VolumeResource,
        observed: Option<VolumeDescriptor>,
        client: Arc<dyn Ec2Api>,
        policy: RetryPolicy,
    ) -> Self {
        let property = observed
            .unwrap_or_else(|| VolumeDescriptor::absent(&resource.name, &resource.region));
        Self {
            resource,
            property,
            client,
            policy,
            created: false,
            untagged: false,
            detaching: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.resource.name
    }

    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.property
    }

    pub fn into_descriptor(self) -> VolumeDescriptor {
        self.property
    }

    pub fn exists(&self) -> bool {
        debug!(
            volume = %self.resource.name,
            region = %self.resource.region,
            "Checking if EC2 volume {} exists in region {}",
            self.resource.name,
            self.resource.region
        );
        self.property.ensure == Ensure::Present
    }

    /// Create the volume, or attach it if its id is already known.
    pub async fn create(&mut self) -> Result<()> {
        let policy = self.policy.clone();
        let mut attempts = policy.attempts("creating ebs volume");
        loop {
            attempts.next_attempt();
            match self.create_once().await {
                Ok(()) => return Ok(()),
                Err(e) => attempts.backoff(e).await?,
            }
        }
    }

    async fn create_once(&mut self) -> Result<()> {
        debug!(
            volume = %self.resource.name,
            region = %self.resource.region,
            "Creating Volume {} in region {}",
            self.resource.name,
            self.resource.region
        );

        if let Some(volume_id) = self.property.volume_id.clone() {
            if self.untagged {
                self.tag(&volume_id).await?;
            }
            if self.resource.attach.is_some() {
                self.attach_instance(&volume_id).await?;
            } else if self.created {
                self.property.ensure = Ensure::Present;
            } else {
                info!(
                    volume = %self.resource.name,
                    volume_id = %volume_id,
                    "Volume exists but no attachment is declared"
                );
            }
            return Ok(());
        }

        let availability_zone = self.resource.availability_zone.clone().ok_or_else(|| {
            Error::invalid_resource(&self.resource.name, "availability_zone is required")
        })?;
        let request = CreateVolumeRequest {
            size: self.resource.size,
            availability_zone,
            volume_type: self.resource.volume_type.clone(),
            iops: self.resource.iops,
            encrypted: self.resource.encrypted,
            kms_key_id: self.resource.kms_key_id.clone(),
            snapshot_id: self.latest_snapshot().await?,
        };

        let volume_id = self.client.create_volume(&request).await?;
        info!(
            volume = %self.resource.name,
            volume_id = %volume_id,
            "Created volume"
        );
        self.property.volume_id = Some(volume_id.clone());
        self.property.size = request.size;
        self.property.iops = request.iops;
        self.property.volume_type = request.volume_type;
        self.property.availability_zone = Some(request.availability_zone);
        self.property.snapshot_id = request.snapshot_id;
        self.property.state = Some(STATE_AVAILABLE.to_string());
        self.created = true;
        self.untagged = true;

        self.tag(&volume_id).await?;
        if self.resource.attach.is_some() {
            self.attach_instance(&volume_id).await?;
        }
        self.property.ensure = Ensure::Present;
        Ok(())
    }

    async fn tag(&mut self, volume_id: &str) -> Result<()> {
        let tags = self.resource.tags_for_resource();
        self.client
            .create_tags(&[volume_id.to_string()], &tags)
            .await?;
        self.property.tags = tags.into_iter().map(|t| (t.key, t.value)).collect();
        self.untagged = false;
        Ok(())
    }

    /// Attach `volume_id` as declared, once it is available.
    pub async fn attach_instance(&mut self, volume_id: &str) -> Result<()> {
        let Some(attach) = self.resource.attach.clone() else {
            return Ok(());
        };

        let client = Arc::clone(&self.client);
        let request = AttachVolumeRequest {
            volume_id: volume_id.to_string(),
            instance_id: attach.instance_id.clone(),
            device: attach.device.clone(),
        };
        let request = &request;
        let client = &client;
        let attach_ref = &attach;

        self.policy
            .run("attaching ebs volume", move |_| async move {
                info!(
                    volume_id = %request.volume_id,
                    instance_id = %request.instance_id,
                    "Attaching Volume {} to ec2 instance {}",
                    request.volume_id,
                    request.instance_id
                );
                client.wait_until_volume_available(&request.volume_id).await?;
                client.attach_volume(request).await?;

                if let Some(delete_on_termination) = attach_ref.delete_on_termination {
                    info!(
                        "Modifying instance attribute delete_on_termination={} for {} on ec2 instance {}",
                        delete_on_termination, request.device, request.instance_id
                    );
                    client
                        .modify_instance_attribute(
                            &request.instance_id,
                            &request.device,
                            delete_on_termination,
                        )
                        .await?;
                }
                Ok::<(), Error>(())
            })
            .await?;

        self.property.attach = vec![AttachmentDescriptor {
            instance_id: attach.instance_id,
            device: attach.device,
            delete_on_termination: attach.delete_on_termination.unwrap_or(false),
        }];
        self.property.state = Some(STATE_IN_USE.to_string());
        self.property.ensure = Ensure::Present;
        Ok(())
    }

    /// Detach (if attached) and delete the volume.
    pub async fn destroy(&mut self) -> Result<()> {
        let volume_id = self
            .property
            .volume_id
            .clone()
            .ok_or_else(|| Error::MissingVolumeId {
                name: self.resource.name.clone(),
            })?;

        let policy = self.policy.clone();
        let mut attempts = policy.attempts("destroying ebs volume");
        loop {
            attempts.next_attempt();
            match self.destroy_once(&volume_id).await {
                Ok(()) => return Ok(()),
                Err(e) => attempts.backoff(e).await?,
            }
        }
    }

    async fn destroy_once(&mut self, volume_id: &str) -> Result<()> {
        debug!(
            volume = %self.resource.name,
            region = %self.resource.region,
            "Deleting Volume {} in region {}",
            self.resource.name,
            self.resource.region
        );

        if self.property.is_attached() && !self.detaching {
            info!(volume_id = %volume_id, "Detaching volume before delete");
            self.client.detach_volume(volume_id, true).await?;
            self.detaching = true;
        }
        if self.detaching {
            self.client.wait_until_volume_available(volume_id).await?;
            self.detaching = false;
            self.property.attach.clear();
            self.property.state = None;
        }
        self.client.delete_volume(volume_id).await?;

        info!(volume = %self.resource.name, volume_id = %volume_id, "Deleted volume");
        self.property.volume_id = None;
        self.property.state = None;
        self.property.ensure = Ensure::Absent;
        Ok(())
    }

    /// Snapshot to restore from: the explicit id, else the latest completed
    /// snapshot carrying the declared label.
    pub async fn latest_snapshot(&self) -> Result<Option<String>> {
        if let Some(snapshot_id) = &self.resource.snapshot_id {
            return Ok(Some(snapshot_id.clone()));
        }
        let Some(label) = &self.resource.snapshot_label else {
            return Ok(None);
        };

        let snapshots = self.find_snapshots(label).await?;
        let latest = select_latest(&snapshots).ok_or_else(|| Error::SnapshotNotFound {
            label: label.clone(),
        })?;
        info!(
            "Restoring volume from snapshot {} taken {}",
            latest.snapshot_id, latest.start_time
        );
        Ok(Some(latest.snapshot_id.clone()))
    }

    /// Completed snapshots labelled `label`. Only throttling is retried.
    pub async fn find_snapshots(&self, label: &str) -> Result<Vec<Snapshot>> {
        let filters = snapshot_filters(label);
        let filters = &filters;
        let client = &self.client;
        let policy = self.policy.only(&[REQUEST_LIMIT_EXCEEDED]);

        let snapshots = policy
            .run("fetching snapshots", move |_| async move {
                client.describe_snapshots(filters).await
            })
            .await?;
        if snapshots.is_empty() {
            warn!(label = %label, "No completed snapshot matches label");
        }
        Ok(snapshots)
    }
}
