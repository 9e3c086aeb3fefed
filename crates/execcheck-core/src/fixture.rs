//! Shared container fixture.
//!
//! Creates the long-running container the harness execs into, and removes
//! it again. The container runs `sleep 600` so it stays up for the whole
//! run without doing anything itself.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use crate::runtime::{DockerTask, Task};

/// Default image; it ships `/bin/echo` and `/bin/sh`.
pub const DEFAULT_IMAGE: &str = "docker.io/library/busybox:latest";

/// Configuration for the container fixture.
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    /// Docker binary to invoke.
    pub docker: String,
    /// Image to run.
    pub image: String,
    /// Container name; generated when `None`.
    pub name: Option<String>,
    /// Pull the image before creating the container.
    pub pull: bool,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            name: None,
            pull: true,
        }
    }
}

/// A running container owned by this process.
///
/// Call [`Fixture::teardown`] on every path once setup has succeeded.
#[derive(Debug)]
pub struct Fixture {
    docker: String,
    container_id: String,
    name: String,
    task: Arc<DockerTask>,
}

/// Generate a container name: `execcheck-<8 hex chars>`.
pub fn container_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("execcheck-{}", &id[..8])
}

async fn docker(docker: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(docker)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run {docker} {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{docker} {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn remove_container(docker_bin: &str, container: &str) -> Result<()> {
    match docker(docker_bin, &["rm", "-f", container]).await {
        Ok(_) => Ok(()),
        // Already gone is fine.
        Err(e) if e.to_string().contains("No such container") => Ok(()),
        Err(e) => Err(e),
    }
}

impl Fixture {
    /// Pull, create and start the container.
    ///
    /// If anything fails after the container was created, it is removed
    /// before the error is returned.
    pub async fn setup(config: &FixtureConfig) -> Result<Self> {
        let name = config.name.clone().unwrap_or_else(container_name);

        if config.pull {
            info!(image = %config.image, "pulling image");
            docker(&config.docker, &["pull", &config.image])
                .await
                .with_context(|| format!("failed to pull image {}", config.image))?;
        }

        let container_id = docker(
            &config.docker,
            &["create", "--name", &name, &config.image, "sleep", "600"],
        )
        .await
        .with_context(|| format!("failed to create container {name}"))?;

        if let Err(e) = docker(&config.docker, &["start", &container_id]).await {
            if let Err(rm_err) = remove_container(&config.docker, &container_id).await {
                warn!(container_id = %container_id, error = %rm_err, "failed to remove container after start failure");
            }
            return Err(e.context(format!("failed to start container {name}")));
        }

        let task = match DockerTask::connect(config.docker.clone(), container_id.clone()).await {
            Ok(task) => task,
            Err(e) => {
                if let Err(rm_err) = remove_container(&config.docker, &container_id).await {
                    warn!(container_id = %container_id, error = %rm_err, "failed to remove container after connect failure");
                }
                return Err(anyhow::Error::new(e)
                    .context(format!("container {name} is not usable as a task")));
            }
        };

        info!(container_id = %container_id, name = %name, image = %config.image, "container ready");

        Ok(Self {
            docker: config.docker.clone(),
            container_id,
            name,
            task: Arc::new(task),
        })
    }

    /// The container as a task handle for the harness.
    pub fn task(&self) -> Arc<dyn Task> {
        self.task.clone()
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Force-remove the container.
    pub async fn teardown(self) -> Result<()> {
        info!(container_id = %self.container_id, "removing container");
        remove_container(&self.docker, &self.container_id)
            .await
            .with_context(|| format!("failed to remove container {}", self.name))
    }
}
