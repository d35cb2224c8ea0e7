//! Provider configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Settings shared by every resource in an apply or list pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Regions listed in addition to the ones a catalog names.
    pub regions: Vec<String>,
    pub retry: RetryPolicy,
}

impl ProviderConfig {
    pub fn new(regions: Vec<String>) -> Self {
        Self {
            regions,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(
        mut self,
        max_tries: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self> {
        if max_tries == 0 {
            return Err(Error::Config("max tries must be at least 1".to_string()));
        }
        if base_delay > max_delay {
            return Err(Error::Config(format!(
                "base delay ({}s) exceeds max delay ({}s)",
                base_delay.as_secs(),
                max_delay.as_secs()
            )));
        }
        self.retry = RetryPolicy {
            max_tries,
            base_delay,
            max_delay,
            ..self.retry
        };
        Ok(self)
    }

    /// Configured regions merged with `extra`, deduplicated, order kept.
    pub fn regions_with(&self, extra: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for region in self.regions.iter().chain(extra) {
            if !region.is_empty() && !out.contains(region) {
                out.push(region.clone());
            }
        }
        out
    }
}
