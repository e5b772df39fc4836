//! `build-runners-images` and `check-base-image-update`

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Result};
use clap::Args;
use serde::Serialize;

use crate::cli::context::Session;
use crate::cli::output;
use crate::config::store::ImageUpdate;
use crate::lifecycle::fleet::RunnerRef;
use crate::models::definition::AgentDefinition;
use crate::models::image::ImageRef;
use crate::notify::events::{EventKind, NotificationEvent};
use crate::update::build::build_runner_image;
use crate::update::checker::UpdateCheck;

#[derive(Debug, Default, Args)]
pub struct CheckArgs {
    /// Rewrite base_image in the configuration and rebuild the runner images
    #[arg(long)]
    pub apply: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct BuildReport {
    pub built: Vec<BuiltImage>,
    pub skipped: Vec<RunnerRef>,
    pub errors: Vec<RunnerRef>,
}

#[derive(Debug, Serialize)]
pub struct BuiltImage {
    pub id: String,
    pub image: String,
    pub dockerfile: String,
}

async fn build_all<'a>(
    session: &Session,
    definitions: impl Iterator<Item = &'a AgentDefinition>,
    base_image: Option<&str>,
) -> BuildReport {
    let mut report = BuildReport::default();
    let timeout = session.loaded.timeouts().build;

    for definition in definitions {
        let Some(dockerfile) = definition.build_image.clone() else {
            report.skipped.push(RunnerRef {
                name: definition.id.clone(),
                reason: Some("no build_image specified".to_string()),
            });
            continue;
        };

        let base = base_image.unwrap_or(&definition.base_image);
        match build_runner_image(
            session.state.builder.as_ref(),
            &session.state.notifier,
            timeout,
            definition,
            base,
        )
        .await
        {
            Ok(image) => report.built.push(BuiltImage {
                id: definition.id.clone(),
                image,
                dockerfile,
            }),
            Err(e) => report.errors.push(RunnerRef {
                name: definition.id.clone(),
                reason: Some(e.to_string()),
            }),
        }
    }
    report
}

fn print_build_report(report: &BuildReport) {
    for built in &report.built {
        output::success(&format!(
            "[SUCCESS] Image {} built from {}",
            built.image, built.dockerfile
        ));
    }
    for skipped in &report.skipped {
        output::info(&format!(
            "[INFO] No image to build for {} ({})",
            skipped.name,
            skipped.reason.as_deref().unwrap_or("skipped")
        ));
    }
    for error in &report.errors {
        output::error(&format!(
            "{}: {}",
            error.name,
            error.reason.as_deref().unwrap_or("unknown reason")
        ));
    }
}

pub async fn build(config: &Path, json: bool) -> Result<()> {
    let session = Session::open(config).await?;
    let report = build_all(&session, session.definitions().iter(), None).await;
    session.close().await?;

    if json {
        output::json(&report)?;
    } else {
        print_build_report(&report);
    }
    if !report.errors.is_empty() {
        bail!("{} image build(s) failed", report.errors.len());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CheckReport {
    image: String,
    #[serde(flatten)]
    check: UpdateCheck,
    applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    build: Option<BuildReport>,
}

pub async fn check(config: &Path, args: &CheckArgs, json: bool) -> Result<()> {
    let session = Session::open(config).await?;
    let result = check_all(&session, args, json).await;
    session.close().await?;
    result
}

async fn check_all(session: &Session, args: &CheckArgs, json: bool) -> Result<()> {
    let images: BTreeSet<String> = session
        .definitions()
        .iter()
        .map(|d| d.base_image.clone())
        .collect();

    let mut reports = Vec::new();
    let mut failed = 0;

    for image in images {
        let check = session.state.checker.check(&image).await;
        let repository = ImageRef::parse(&image).repository;
        let mut report = CheckReport {
            image: image.clone(),
            check: check.clone(),
            applied: false,
            build: None,
        };

        match check {
            UpdateCheck::UpToDate { current } => {
                if !json {
                    output::success(&format!(
                        "{} is already up to date: {}",
                        repository,
                        current.as_deref().unwrap_or("latest")
                    ));
                }
            }
            UpdateCheck::Failed { reason } => {
                failed += 1;
                if !json {
                    output::error(&format!("{}: {}", image, reason));
                }
                session.state.notifier.publish(
                    NotificationEvent::new(EventKind::UpdateError)
                        .with("runner_type", "base")
                        .with("image_name", image.clone())
                        .with("error_message", reason),
                );
            }
            UpdateCheck::Available {
                current,
                latest,
                new_image,
            } => {
                if !json {
                    output::info(&format!(
                        "New version available for {}: {} (current: {})",
                        repository,
                        latest,
                        current.as_deref().unwrap_or("unversioned")
                    ));
                }
                session.state.notifier.publish(
                    NotificationEvent::new(EventKind::UpdateAvailable)
                        .with("runner_type", "base")
                        .with("image_name", repository.clone())
                        .with("current_version", current.clone().unwrap_or_default())
                        .with("new_version", latest.clone())
                        .with("new_image", new_image.clone())
                        .with("auto_update", args.apply),
                );

                if args.apply {
                    let update = ImageUpdate {
                        from: image.clone(),
                        to: new_image.clone(),
                    };
                    match session.state.config_store.persist(std::slice::from_ref(&update)).await {
                        Ok(()) => {
                            report.applied = true;
                            if !json {
                                output::success(&format!(
                                    "base_image updated to {} in {}",
                                    new_image,
                                    session.loaded.path.display()
                                ));
                            }
                            session.state.notifier.publish(
                                NotificationEvent::new(EventKind::ImageUpdated)
                                    .with("runner_type", "base")
                                    .with("image_name", repository)
                                    .with("from_version", current.unwrap_or_default())
                                    .with("to_version", latest),
                            );

                            let bound = session
                                .definitions()
                                .iter()
                                .filter(|d| d.base_image == image);
                            let build = build_all(session, bound, Some(new_image.as_str())).await;
                            if !json {
                                print_build_report(&build);
                            }
                            failed += build.errors.len();
                            report.build = Some(build);
                        }
                        Err(e) => {
                            failed += 1;
                            if !json {
                                output::error(&format!("updating {}: {}", image, e));
                            }
                            session.state.notifier.publish(
                                NotificationEvent::new(EventKind::UpdateError)
                                    .with("runner_type", "base")
                                    .with("image_name", image.clone())
                                    .with("error_message", e.to_string()),
                            );
                        }
                    }
                } else if !json {
                    output::info("Run again with --apply to update runners_config.yaml");
                }
            }
        }
        reports.push(report);
    }

    if json {
        output::json(&reports)?;
    }
    if failed > 0 {
        bail!("{} update step(s) failed", failed);
    }
    Ok(())
}
