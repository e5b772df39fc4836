//! Runner group definitions

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::schema::FullConfig;
use crate::errors::ManagerError;
use crate::models::image::ImageRef;
use crate::runtime::BuildRequest;

/// Declarative description of a runner group, read-only for one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name_prefix: String,
    pub labels: Vec<String>,
    pub nb: u32,
    pub build_image: Option<String>,
    pub base_image: String,
    pub techno: Option<String>,
    pub techno_version: Option<String>,
    pub org_url: String,
    pub image_namespace: String,
}

impl AgentDefinition {
    /// Container name of the instance in `slot` (1-based)
    pub fn instance_name(&self, slot: u32) -> String {
        format!("{}-{}", self.name_prefix, slot)
    }

    /// Slot encoded in a container name of this group, if any
    pub fn slot_of(&self, name: &str) -> Option<u32> {
        name.strip_prefix(&self.name_prefix)?
            .strip_prefix('-')?
            .parse()
            .ok()
    }

    pub fn base(&self) -> ImageRef {
        ImageRef::parse(&self.base_image)
    }

    /// Tag of the image built from `build_image` on the current base
    pub fn build_tag(&self) -> Result<String, ManagerError> {
        self.build_tag_for(&self.base())
    }

    pub fn build_tag_for(&self, base: &ImageRef) -> Result<String, ManagerError> {
        match (&self.techno, &self.techno_version) {
            (Some(techno), Some(version)) => Ok(format!(
                "{}/{}:{}-{}",
                self.image_namespace,
                techno,
                version,
                base.runner_version()
            )),
            _ => Err(ManagerError::ConfigError(format!(
                "{}: missing techno or techno_version",
                self.name_prefix
            ))),
        }
    }

    /// Image the containers of this group run
    pub fn runtime_image(&self) -> String {
        if self.build_image.is_some() {
            if let Ok(tag) = self.build_tag() {
                return tag;
            }
            return format!("{}:latest", self.name_prefix);
        }
        self.base_image.clone()
    }

    /// Build of this group's Dockerfile on top of `base_image`
    pub fn build_request(&self, base_image: &str) -> Result<BuildRequest, ManagerError> {
        let dockerfile = self.build_image.as_ref().ok_or_else(|| {
            ManagerError::ConfigError(format!("{}: no build_image specified", self.name_prefix))
        })?;
        let tag = self.build_tag_for(&ImageRef::parse(base_image))?;

        let dockerfile = PathBuf::from(dockerfile);
        let context = match dockerfile.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut build_args = BTreeMap::new();
        build_args.insert("BASE_IMAGE".to_string(), base_image.to_string());

        Ok(BuildRequest {
            dockerfile,
            context,
            tag,
            build_args,
        })
    }

    /// Whether this group runs on top of `base_image` (compared by repository)
    pub fn is_bound_to(&self, base_image: &str) -> bool {
        self.base().repository == ImageRef::parse(base_image).repository
    }
}

/// Resolve every runner group against the defaults and validate identities.
pub fn definitions_from_config(config: &FullConfig) -> Result<Vec<AgentDefinition>, ManagerError> {
    let defaults = &config.runners_defaults;
    let mut ids = HashSet::new();
    let mut prefixes = HashSet::new();
    let mut definitions = Vec::with_capacity(config.runners.len());

    for runner in &config.runners {
        if !ids.insert(runner.id.clone()) {
            return Err(ManagerError::ConfigError(format!("Duplicate runner id: {}", runner.id)));
        }
        if !prefixes.insert(runner.name_prefix.clone()) {
            return Err(ManagerError::ConfigError(format!(
                "Duplicate name_prefix: {}",
                runner.name_prefix
            )));
        }

        definitions.push(AgentDefinition {
            id: runner.id.clone(),
            name_prefix: runner.name_prefix.clone(),
            labels: runner.labels.clone(),
            nb: runner.nb,
            build_image: runner.build_image.clone(),
            base_image: runner
                .base_image
                .clone()
                .unwrap_or_else(|| defaults.base_image.clone()),
            techno: runner.techno.clone(),
            techno_version: runner.techno_version.clone(),
            org_url: runner
                .org_url
                .clone()
                .unwrap_or_else(|| defaults.org_url.clone()),
            image_namespace: defaults.image_namespace.clone(),
        });
    }

    Ok(definitions)
}
