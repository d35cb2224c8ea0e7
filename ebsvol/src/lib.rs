//! ebsvol: EBS volume reconciliation.
//!
//! This library lists EBS volumes across regions and converges them
//! towards a declared catalog, creating, attaching and destroying volumes
//! with bounded retries around every EC2 call.

pub mod apply;
pub mod catalog;
pub mod config;
pub mod ec2;
pub mod error;
pub mod fetch;
pub mod model;
pub mod provider;
pub mod retry;

pub use apply::{Applier, ApplyReport, Change};
pub use catalog::{AttachSpec, Catalog, VolumeResource};
pub use config::ProviderConfig;
pub use error::{Error, Result};
pub use model::{Ensure, VolumeDescriptor};
pub use provider::VolumeProvider;
pub use retry::RetryPolicy;
