//! Docker CLI driver

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::ManagerError;
use crate::runtime::{BuildRequest, ContainerHandle, ContainerRuntime, ImageBuilder, RunSpec, RuntimeState};

const DEREGISTER_COMMAND: &str = "./config.sh remove --token $RUNNER_TOKEN || true";

/// Drives the local docker daemon through the `docker` binary
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run a docker subcommand, returning trimmed stdout
    async fn docker(&self, operation: &str, args: &[&str]) -> Result<String, ManagerError> {
        debug!("{} {} ({})", self.binary, args.first().unwrap_or(&""), operation);

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ManagerError::external(operation, format!("failed to run docker: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ManagerError::external(operation, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn container_state(&self, name: &str) -> Result<RuntimeState, ManagerError> {
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.Running}}", name])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ManagerError::external("docker inspect", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Ok(RuntimeState::Missing);
            }
            return Err(ManagerError::external("docker inspect", stderr.trim()));
        }

        match String::from_utf8_lossy(&output.stdout).trim() {
            "true" => Ok(RuntimeState::Running),
            _ => Ok(RuntimeState::Exited),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn start_container(&self, spec: &RunSpec) -> Result<ContainerHandle, ManagerError> {
        match self.container_state(&spec.name).await? {
            RuntimeState::Running => {
                debug!("Container {} already running", spec.name);
                return Ok(ContainerHandle {
                    name: spec.name.clone(),
                    reused: true,
                });
            }
            RuntimeState::Exited => {
                self.docker("docker start", &["start", &spec.name]).await?;
                info!("Restarted container {}", spec.name);
                return Ok(ContainerHandle {
                    name: spec.name.clone(),
                    reused: true,
                });
            }
            RuntimeState::Missing => {}
        }

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let mut args = vec!["run", "-d", "--name", spec.name.as_str(), "--restart", "always"];
        for pair in &env {
            args.push("-e");
            args.push(pair);
        }
        args.push(&spec.image);
        if !spec.command.is_empty() {
            args.extend(["/bin/bash", "-c", spec.command.as_str()]);
        }

        self.docker("docker run", &args).await?;
        info!("Started container {} from {}", spec.name, spec.image);

        Ok(ContainerHandle {
            name: spec.name.clone(),
            reused: false,
        })
    }

    async fn stop_container(&self, handle: &ContainerHandle) -> Result<(), ManagerError> {
        self.docker("docker stop", &["stop", &handle.name]).await?;
        Ok(())
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> Result<(), ManagerError> {
        let name = handle.name.as_str();
        match self.container_state(name).await? {
            RuntimeState::Missing => return Ok(()),
            RuntimeState::Exited => {
                self.docker("docker start", &["start", name]).await?;
            }
            RuntimeState::Running => {}
        }

        // Deregistration failures must not keep the container alive
        if let Err(e) = self
            .docker("runner deregistration", &["exec", name, "bash", "-c", DEREGISTER_COMMAND])
            .await
        {
            warn!("Could not deregister runner {}: {}", name, e);
        }

        self.docker("docker rm", &["rm", "-f", name]).await?;
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<RuntimeState, ManagerError> {
        self.container_state(&handle.name).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ManagerError> {
        let filter = format!("name={}", prefix);
        let stdout = self
            .docker("docker ps", &["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"])
            .await?;

        // docker's name filter is a substring match
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl ImageBuilder for DockerCli {
    async fn build(&self, request: &BuildRequest) -> Result<String, ManagerError> {
        let dockerfile = request.dockerfile.to_string_lossy().to_string();
        let context = request.context.to_string_lossy().to_string();
        let build_args: Vec<String> = request
            .build_args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut args = vec!["build", "--rm", "-f", dockerfile.as_str(), "-t", request.tag.as_str()];
        for arg in &build_args {
            args.push("--build-arg");
            args.push(arg);
        }
        args.push(&context);

        info!("Building image {} from {}", request.tag, dockerfile);
        self.docker("docker build", &args).await?;
        Ok(request.tag.clone())
    }

    async fn pull(&self, image: &str) -> Result<String, ManagerError> {
        info!("Pulling image {}", image);
        self.docker("docker pull", &["pull", "--quiet", image]).await?;
        Ok(image.to_string())
    }
}
