//! Shared test utilities for execcheck integration tests.
//!
//! Two task backends:
//! - [`FakeTask`]: in-memory and scriptable, with a journal of every call.
//! - [`busybox_task`]: a real busybox container started through
//!   testcontainers and driven by [`DockerTask`]. Requires a docker daemon.

mod fake;

use std::sync::Arc;

use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

use execcheck_core::runtime::{DockerTask, Task};

pub use fake::{FakeTask, Journal, interpret};

/// Start a busybox container that idles for ten minutes.
pub async fn busybox_container() -> ContainerAsync<GenericImage> {
    let container = GenericImage::new("busybox", "latest")
        .with_cmd(["sleep", "600"])
        .start()
        .await
        .expect("failed to start busybox container");
    tracing::debug!(container_id = %container.id(), "busybox container started");
    container
}

/// A busybox container wrapped as a task.
///
/// Keep the returned container alive for as long as the task is used;
/// dropping it removes the container.
pub async fn busybox_task() -> (ContainerAsync<GenericImage>, Arc<dyn Task>) {
    let container = busybox_container().await;
    let task = DockerTask::connect("docker", container.id())
        .await
        .expect("busybox container should be running");
    (container, Arc::new(task))
}
