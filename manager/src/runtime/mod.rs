//! External collaborators: container runtime, image builder, registry and token issuer

pub mod docker;
pub mod github;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::config::schema::TimeoutSettings;
use crate::errors::ManagerError;

/// Per-call budgets for external collaborators
#[derive(Debug, Clone, Copy)]
pub struct ExternalTimeouts {
    pub registry: Duration,
    pub build: Duration,
    pub runtime: Duration,
    pub token: Duration,
}

impl Default for ExternalTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutSettings::default())
    }
}

impl From<&TimeoutSettings> for ExternalTimeouts {
    fn from(settings: &TimeoutSettings) -> Self {
        Self {
            registry: Duration::from_secs(settings.registry),
            build: Duration::from_secs(settings.build),
            runtime: Duration::from_secs(settings.runtime),
            token: Duration::from_secs(settings.token),
        }
    }
}

/// Opaque reference to a started container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub name: String,

    /// Whether an existing container was restarted rather than created
    #[serde(default)]
    pub reused: bool,
}

/// What to run for one runner instance
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub command: String,
}

/// Observed container state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Running,
    Exited,
    Missing,
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start `spec.name`, creating the container if it does not exist
    async fn start_container(&self, spec: &RunSpec) -> Result<ContainerHandle, ManagerError>;

    async fn stop_container(&self, handle: &ContainerHandle) -> Result<(), ManagerError>;

    /// Deregister the runner and delete the container
    async fn remove_container(&self, handle: &ContainerHandle) -> Result<(), ManagerError>;

    async fn inspect(&self, handle: &ContainerHandle) -> Result<RuntimeState, ManagerError>;

    /// Names of existing containers starting with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ManagerError>;
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build and tag an image, returning the tag
    async fn build(&self, request: &BuildRequest) -> Result<String, ManagerError>;

    /// Fetch `image` so runners without a Dockerfile can start on it
    async fn pull(&self, image: &str) -> Result<String, ManagerError>;
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Latest published tag of `image_repo`
    async fn latest_tag(&self, image_repo: &str) -> Result<String, ManagerError>;
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue_registration_token(
        &self,
        org_url: &str,
        credential: &SecretString,
    ) -> Result<SecretString, ManagerError>;
}
