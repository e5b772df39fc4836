//! Runner image builds

use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::errors::{with_timeout, ManagerError};
use crate::models::definition::AgentDefinition;
use crate::notify::dispatcher::Notifier;
use crate::notify::events::{EventKind, NotificationEvent};
use crate::runtime::ImageBuilder;

/// Build the image of `definition` on top of `base_image`, publishing
/// `build_started` then `build_completed` or `build_failed`.
pub async fn build_runner_image(
    builder: &dyn ImageBuilder,
    notifier: &Notifier,
    timeout: Duration,
    definition: &AgentDefinition,
    base_image: &str,
) -> Result<String, ManagerError> {
    let request = match definition.build_request(base_image) {
        Ok(request) => request,
        Err(e) => {
            notifier.publish(
                NotificationEvent::new(EventKind::BuildFailed)
                    .with("id", definition.id.clone())
                    .with("image_name", definition.name_prefix.clone())
                    .with("error_message", e.to_string()),
            );
            return Err(e);
        }
    };
    let dockerfile = request.dockerfile.display().to_string();

    notifier.publish(
        NotificationEvent::new(EventKind::BuildStarted)
            .with("id", definition.id.clone())
            .with("image_name", request.tag.clone())
            .with("dockerfile", dockerfile.clone())
            .with("base_image", base_image),
    );

    let started = Instant::now();
    match with_timeout("docker build", timeout, builder.build(&request)).await {
        Ok(tag) => {
            let duration = started.elapsed().as_secs_f64();
            info!("Image {} built from {} in {:.1}s", tag, dockerfile, duration);
            notifier.publish(
                NotificationEvent::new(EventKind::BuildCompleted)
                    .with("id", definition.id.clone())
                    .with("image_name", tag.clone())
                    .with("dockerfile", dockerfile)
                    .with("duration", (duration * 10.0).round() / 10.0),
            );
            Ok(tag)
        }
        Err(e) => {
            error!("Build of {} failed: {}", request.tag, e);
            notifier.publish(
                NotificationEvent::new(EventKind::BuildFailed)
                    .with("id", definition.id.clone())
                    .with("image_name", request.tag.clone())
                    .with("error_message", e.to_string()),
            );
            Err(e)
        }
    }
}

/// Pull `image` for the groups in `ids` that run it without a Dockerfile,
/// publishing the same build events as a Dockerfile build.
pub async fn pull_base_image(
    builder: &dyn ImageBuilder,
    notifier: &Notifier,
    timeout: Duration,
    ids: &[&str],
    image: &str,
) -> Result<String, ManagerError> {
    let ids = ids.join(", ");
    notifier.publish(
        NotificationEvent::new(EventKind::BuildStarted)
            .with("id", ids.clone())
            .with("image_name", image)
            .with("base_image", image),
    );

    let started = Instant::now();
    match with_timeout("docker pull", timeout, builder.pull(image)).await {
        Ok(tag) => {
            let duration = started.elapsed().as_secs_f64();
            info!("Image {} pulled for {} in {:.1}s", tag, ids, duration);
            notifier.publish(
                NotificationEvent::new(EventKind::BuildCompleted)
                    .with("id", ids)
                    .with("image_name", tag.clone())
                    .with("duration", (duration * 10.0).round() / 10.0),
            );
            Ok(tag)
        }
        Err(e) => {
            error!("Pull of {} failed: {}", image, e);
            notifier.publish(
                NotificationEvent::new(EventKind::BuildFailed)
                    .with("id", ids)
                    .with("image_name", image)
                    .with("error_message", e.to_string()),
            );
            Err(e)
        }
    }
}
