//! Inventory fetcher and matcher.
//!
//! `instances` lists volumes region by region and turns them into
//! descriptors; `prefetch` binds those descriptors to catalog resources by
//! name and region.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::catalog::VolumeResource;
use crate::ec2::Ec2ClientFactory;
use crate::error::{Error, Result};
use crate::model::{RemoteVolume, VolumeDescriptor, name_from_tags, volume_ensure};
use crate::retry::RetryPolicy;

/// Convert a remote volume into a descriptor. `None` when it has no name.
pub fn volume_to_descriptor(region: &str, volume: &RemoteVolume) -> Option<VolumeDescriptor> {
    let name = name_from_tags(&volume.tags)?;
    Some(VolumeDescriptor {
        name,
        volume_id: Some(volume.volume_id.clone()),
        size: volume.size,
        iops: volume.iops,
        volume_type: volume.volume_type.clone(),
        availability_zone: volume.availability_zone.clone(),
        snapshot_id: volume.snapshot_id.clone(),
        attach: volume.attachments.clone(),
        ensure: volume_ensure(&volume.state),
        state: Some(volume.state.clone()),
        region: region.to_string(),
        tags: volume
            .tags
            .iter()
            .map(|t| (t.key.clone(), t.value.clone()))
            .collect(),
    })
}

/// List every named volume in `regions`.
///
/// A failing region aborts the whole listing with [`Error::FetchFailed`].
pub async fn instances(
    factory: &dyn Ec2ClientFactory,
    regions: &[String],
) -> Result<Vec<VolumeDescriptor>> {
    let mut descriptors = Vec::new();
    for region in regions {
        let client = factory
            .client(region)
            .await
            .map_err(|e| Error::fetch_failed(region, e.to_string()))?;
        let volumes = client
            .describe_volumes()
            .await
            .map_err(|e| Error::fetch_failed(region, e.to_string()))?;

        let before = descriptors.len();
        descriptors.extend(
            volumes
                .iter()
                .filter_map(|v| volume_to_descriptor(region, v)),
        );
        debug!(
            region = %region,
            total = volumes.len(),
            named = descriptors.len() - before,
            "Fetched volumes"
        );
    }
    Ok(descriptors)
}

/// Bind fetched descriptors to catalog resources.
///
/// A descriptor matches a resource with the same name in the same region.
/// The whole listing is retried under `policy`.
pub async fn prefetch(
    factory: &dyn Ec2ClientFactory,
    regions: &[String],
    resources: &HashMap<String, VolumeResource>,
    policy: &RetryPolicy,
) -> Result<HashMap<String, VolumeDescriptor>> {
    let found = policy
        .run("prefetch ebs volume", move |_| instances(factory, regions))
        .await?;

    let mut bound: HashMap<String, VolumeDescriptor> = HashMap::new();
    for descriptor in found {
        let Some(resource) = resources.get(&descriptor.name) else {
            continue;
        };
        if resource.region != descriptor.region {
            continue;
        }
        if let Some(previous) = bound.get(&descriptor.name) {
            warn!(
                volume = %descriptor.name,
                region = %descriptor.region,
                previous = ?previous.volume_id,
                current = ?descriptor.volume_id,
                "Several volumes share this name, using the last one"
            );
        }
        bound.insert(descriptor.name.clone(), descriptor);
    }

    info!(
        fetched_regions = regions.len(),
        matched = bound.len(),
        "Prefetched ebs volumes"
    );
    Ok(bound)
}
