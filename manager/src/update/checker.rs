//! Image update checker

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::with_timeout;
use crate::models::image::{is_numeric_version, ImageRef};
use crate::runtime::RegistryClient;

/// Result of comparing a base image against its registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateCheck {
    UpToDate {
        current: Option<String>,
    },
    Available {
        current: Option<String>,
        latest: String,
        new_image: String,
    },
    /// The registry could not be queried; never reported as up to date
    Failed {
        reason: String,
    },
}

impl UpdateCheck {
    pub fn is_available(&self) -> bool {
        matches!(self, UpdateCheck::Available { .. })
    }
}

/// Compares base images against the latest published tag
#[derive(Clone)]
pub struct ImageUpdateChecker {
    registry: Arc<dyn RegistryClient>,
    timeout: Duration,
}

impl ImageUpdateChecker {
    pub fn new(registry: Arc<dyn RegistryClient>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub async fn check(&self, base_image: &str) -> UpdateCheck {
        let image = ImageRef::parse(base_image);
        let current = image.version().map(str::to_string);

        let latest = match with_timeout(
            "registry lookup",
            self.timeout,
            self.registry.latest_tag(&image.repository),
        )
        .await
        {
            Ok(tag) => tag.trim().trim_start_matches('v').to_string(),
            Err(e) => {
                warn!("Update check for {} failed: {}", base_image, e);
                return UpdateCheck::Failed {
                    reason: e.to_string(),
                };
            }
        };

        if latest.is_empty() {
            return UpdateCheck::Failed {
                reason: format!("registry returned an empty tag for {}", image.repository),
            };
        }

        let newer = match &current {
            Some(current) => compare_versions(&latest, current) == Ordering::Greater,
            None => true,
        };

        debug!(
            "{}: current {:?}, latest {}, newer {}",
            image.repository, current, latest, newer
        );

        if newer {
            UpdateCheck::Available {
                current,
                new_image: image.with_tag(&latest).to_string(),
                latest,
            }
        } else {
            UpdateCheck::UpToDate { current }
        }
    }
}

/// Numeric component-wise comparison; anything non-numeric falls back to string inequality
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    if !is_numeric_version(a) || !is_numeric_version(b) {
        return if a == b { Ordering::Equal } else { Ordering::Greater };
    }

    let parts = |v: &str| -> Vec<u64> { v.split('.').map(|p| p.parse().unwrap_or(0)).collect() };
    let (mut a, mut b) = (parts(a), parts(b));
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    a.cmp(&b)
}
