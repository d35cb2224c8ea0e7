//! Catalog application - prefetches once, then converges each declared
//! volume in catalog order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::catalog::{Catalog, VolumeResource};
use crate::config::ProviderConfig;
use crate::ec2::Ec2ClientFactory;
use crate::error::Result;
use crate::fetch::prefetch;
use crate::model::{Ensure, VolumeDescriptor};
use crate::provider::VolumeProvider;

/// What happened to one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    Created,
    Attached,
    Destroyed,
    Unchanged,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Created => write!(f, "created"),
            Change::Attached => write!(f, "attached"),
            Change::Destroyed => write!(f, "destroyed"),
            Change::Unchanged => write!(f, "unchanged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceOutcome {
    pub name: String,
    pub region: String,
    pub change: Change,
    pub volume_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceFailure {
    pub name: String,
    pub region: String,
    pub error: String,
}

/// Result of one apply pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub outcomes: Vec<ResourceOutcome>,
    pub failures: Vec<ResourceFailure>,
}

impl ApplyReport {
    pub fn changed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.change != Change::Unchanged)
            .count()
    }

    pub fn unchanged(&self) -> usize {
        self.outcomes.len() - self.changed()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn outcome(&self, name: &str) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

/// Drives a catalog against EC2.
pub struct Applier {
    factory: Arc<dyn Ec2ClientFactory>,
    config: ProviderConfig,
}

impl Applier {
    pub fn new(factory: Arc<dyn Ec2ClientFactory>, config: ProviderConfig) -> Self {
        Self { factory, config }
    }

    /// Converge every volume in `catalog`.
    ///
    /// A prefetch failure aborts the pass; a failing volume is recorded in
    /// the report and the remaining volumes are still applied.
    pub async fn apply(&self, catalog: &Catalog) -> Result<ApplyReport> {
        catalog.validate()?;
        let regions = self.config.regions_with(&catalog.regions());
        let resources = catalog.by_name();

        info!(
            volumes = catalog.volumes.len(),
            regions = regions.len(),
            "Applying catalog"
        );

        let mut bound: HashMap<String, VolumeDescriptor> = prefetch(
            self.factory.as_ref(),
            &regions,
            &resources,
            &self.config.retry,
        )
        .await?;

        let mut report = ApplyReport::default();
        for resource in &catalog.volumes {
            let observed = bound.remove(&resource.name);
            match self.apply_one(resource, observed).await {
                Ok(outcome) => {
                    if outcome.change != Change::Unchanged {
                        info!(
                            volume = %outcome.name,
                            region = %outcome.region,
                            volume_id = ?outcome.volume_id,
                            "Volume {}",
                            outcome.change
                        );
                    }
                    report.outcomes.push(outcome);
                }
                Err(e) => {
                    error!(
                        volume = %resource.name,
                        region = %resource.region,
                        "Volume reconciliation failed: {}",
                        e
                    );
                    report.failures.push(ResourceFailure {
                        name: resource.name.clone(),
                        region: resource.region.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            changed = report.changed(),
            unchanged = report.unchanged(),
            failed = report.failures.len(),
            "Catalog applied"
        );
        Ok(report)
    }

    async fn apply_one(
        &self,
        resource: &VolumeResource,
        observed: Option<VolumeDescriptor>,
    ) -> Result<ResourceOutcome> {
        let client = self.factory.client(&resource.region).await?;
        let known_id = observed.as_ref().and_then(|d| d.volume_id.clone());
        let mut provider =
            VolumeProvider::new(resource.clone(), observed, client, self.config.retry.clone());

        let change = match (resource.ensure, provider.exists()) {
            // known but unattached, and no attachment declared
            (Ensure::Present, false) if known_id.is_some() && resource.attach.is_none() => {
                Change::Unchanged
            }
            (Ensure::Present, false) => {
                provider.create().await?;
                if known_id.is_some() {
                    Change::Attached
                } else {
                    Change::Created
                }
            }
            (Ensure::Absent, true) => {
                provider.destroy().await?;
                Change::Destroyed
            }
            _ => Change::Unchanged,
        };

        let name = provider.name().to_string();
        let descriptor = provider.into_descriptor();
        Ok(ResourceOutcome {
            name,
            region: resource.region.clone(),
            change,
            volume_id: descriptor.volume_id.or(known_id),
        })
    }
}
