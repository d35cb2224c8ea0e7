//! EC2 backends.
//!
//! The provider talks to EC2 only through [`Ec2Api`], one client per region:
//! - `memory`: in-process volumes and snapshots (tests, simulation)
//! - `aws`: the AWS SDK (feature `aws`)

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{AttachVolumeRequest, CreateVolumeRequest, Filter, RemoteVolume, Snapshot, Tag};

#[cfg(feature = "aws")]
pub mod aws;
pub mod memory;

#[cfg(feature = "aws")]
pub use aws::{AwsEc2, AwsEc2Factory};
pub use memory::{MemoryEc2, MemoryEc2Factory};

/// Volume-related EC2 operations for a single region.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// List every volume in the region.
    async fn describe_volumes(&self) -> Result<Vec<RemoteVolume>>;

    /// List snapshots matching all `filters`.
    async fn describe_snapshots(&self, filters: &[Filter]) -> Result<Vec<Snapshot>>;

    /// Create a volume and return its id.
    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<String>;

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<()>;

    async fn attach_volume(&self, request: &AttachVolumeRequest) -> Result<()>;

    async fn detach_volume(&self, volume_id: &str, force: bool) -> Result<()>;

    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    /// Block until the volume reports `available`.
    async fn wait_until_volume_available(&self, volume_id: &str) -> Result<()>;

    /// Set `DeleteOnTermination` on the block device mapping of `device`.
    async fn modify_instance_attribute(
        &self,
        instance_id: &str,
        device: &str,
        delete_on_termination: bool,
    ) -> Result<()>;
}

/// Hands out a client per region.
#[async_trait]
pub trait Ec2ClientFactory: Send + Sync {
    async fn client(&self, region: &str) -> Result<Arc<dyn Ec2Api>>;
}
