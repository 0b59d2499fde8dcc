// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Worker execution loop
//!
//! A failed build is an outcome recorded on the build row and mailed
//! out, not an error; only infrastructure trouble (catalog writes) flows
//! through the error channel, is mailed to admins and leaves the worker
//! alive for the next job.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::catalog::build::ArtifactDraft;
use crate::catalog::{builder, repository};
use crate::pool::{collect, source, Context, Job, Message};
use crate::ssh;

pub(super) async fn run(
    builder: builder::Builder,
    ctx: Context,
    mut receiver: mpsc::UnboundedReceiver<Message>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(message) = receiver.recv().await {
        let job = match message {
            Message::Shutdown => break,
            Message::Job(job) => job,
        };

        let result = process(&builder, &ctx, &job).await;
        pending.fetch_sub(1, Ordering::SeqCst);

        if let Err(e) = result {
            error!(build = %job.build_id, error = %e, "worker failed to record build");
            ctx.mailer
                .admin_alert(
                    &ctx.db,
                    &format!("worker failure on {}", builder.hostname),
                    &format!("build {}: {e}", job.build_id),
                )
                .await;
        }
    }

    info!(builder = %builder.id, "worker drained");
}

#[tracing::instrument(
    name = "build",
    skip_all,
    fields(
        builder = %builder.id,
        build = %job.build_id,
        repository = %job.repository_name,
        tag = %job.tag,
    )
)]
async fn process(builder: &builder::Builder, ctx: &Context, job: &Job) -> Result<(), Error> {
    if !ctx.db.start_build(job.build_id).await? {
        warn!("build already left the scheduled state, skipping");
        return Ok(());
    }

    let outcome = execute(builder, ctx, job).await;

    let success = match &outcome {
        Outcome::Success { output, artifacts } => {
            ctx.db
                .finish_build_success(job.build_id, output, artifacts)
                .await?;
            info!(artifacts = artifacts.len(), "build succeeded");
            true
        }
        Outcome::Failure { diagnostic } => {
            ctx.db
                .finish_build_failure(job.build_id, diagnostic)
                .await?;
            info!("build failed");
            false
        }
    };

    ctx.mailer
        .build_outcome(
            &ctx.db,
            &job.notify_emails,
            &job.repository_name,
            &job.tag,
            &builder.hostname,
            success,
            outcome.output(),
        )
        .await;

    Ok(())
}

enum Outcome {
    Success {
        output: String,
        artifacts: Vec<ArtifactDraft>,
    },
    Failure {
        diagnostic: String,
    },
}

impl Outcome {
    fn output(&self) -> &str {
        match self {
            Outcome::Success { output, .. } => output,
            Outcome::Failure { diagnostic } => diagnostic,
        }
    }
}

/// Checkout, remote make, artifact collection. Every failure along the
/// way collapses into a failed outcome carrying its diagnostic.
async fn execute(builder: &builder::Builder, ctx: &Context, job: &Job) -> Outcome {
    let builddir = match source::sync(&ctx.config, job).await {
        Ok(dir) => dir,
        Err(e) => {
            return Outcome::Failure {
                diagnostic: format!("source update failed: {e}"),
            }
        }
    };

    let session = match ssh::Session::connect(
        &builder.hostname,
        &ctx.config.build_user,
        &ctx.config.ssh_key,
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            return Outcome::Failure {
                diagnostic: format!("connection to {} failed: {e}", builder.hostname),
            }
        }
    };

    let command = compose_command(builder, job, &builddir.display().to_string());
    let hard = Duration::from_secs(ctx.config.build_timeout);
    let soft = Duration::from_secs(ctx.config.build_timeout_soft);

    let started = Instant::now();
    let run = match tokio::time::timeout(hard, session.exec(&command)).await {
        Ok(Ok(run)) => run,
        Ok(Err(e)) => {
            return Outcome::Failure {
                diagnostic: format!("remote execution failed: {e}"),
            }
        }
        Err(_) => {
            return Outcome::Failure {
                diagnostic: format!("build timed out after {}s", hard.as_secs()),
            }
        }
    };

    if started.elapsed() > soft {
        warn!(elapsed = started.elapsed().as_secs(), "soft build timeout exceeded");
    }

    if !run.success() {
        return Outcome::Failure { diagnostic: run.output };
    }

    match collect::artifacts(&ctx.store, job.repository_kind, &builddir).await {
        Ok(artifacts) => Outcome::Success {
            output: run.output,
            artifacts,
        },
        Err(e) => Outcome::Failure {
            diagnostic: format!("{}\nartifact collection failed: {e}", run.output),
        },
    }
}

/// One shell line driving the whole remote build
fn compose_command(builder: &builder::Builder, job: &Job, builddir: &str) -> String {
    let mut command = String::new();

    if let Some(environment) = &builder.environment {
        command.push_str(&format!("source {environment}; "));
    }

    command.push_str(&format!("source /etc/profile; cd {builddir}; "));

    match job.repository_kind {
        repository::Kind::Library => command.push_str(
            "make -j$(getconf _NPROCESSORS_ONLN) && rm -fr .install && PREFIX=.install make install",
        ),
        _ => command.push_str("make -j$(getconf _NPROCESSORS_ONLN)"),
    }

    command
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("catalog")]
    Catalog(#[from] crate::catalog::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::{build, platform};

    fn job(kind: repository::Kind) -> Job {
        Job {
            build_id: build::Id::from(1),
            repository_id: repository::Id::from(1),
            platform_id: platform::Id::from(8),
            repository_name: "cs/ds/fake".into(),
            repository_ssh_url: "git@git.example.org:cs/ds/fake.git".into(),
            repository_kind: kind,
            tag: "1.2.3".into(),
            default_branch: "master".into(),
            notify_emails: vec![],
        }
    }

    fn builder(environment: Option<&str>) -> builder::Builder {
        builder::Builder {
            id: builder::Id::from(1),
            platform_id: platform::Id::from(8),
            hostname: "builder-01".into(),
            environment: environment.map(str::to_owned),
        }
    }

    #[test]
    fn plain_build_command() {
        let command = compose_command(&builder(None), &job(repository::Kind::CPlusPlus), "/work/8/cs/ds/fake");

        assert_eq!(
            command,
            "source /etc/profile; cd /work/8/cs/ds/fake; make -j$(getconf _NPROCESSORS_ONLN)"
        );
    }

    #[test]
    fn library_builds_stage_an_install_tree() {
        let command = compose_command(&builder(None), &job(repository::Kind::Library), "/work/8/cs/libs/foo");

        assert!(command.ends_with(
            "make -j$(getconf _NPROCESSORS_ONLN) && rm -fr .install && PREFIX=.install make install"
        ));
    }

    #[test]
    fn builder_environment_is_sourced_first() {
        let command = compose_command(
            &builder(Some("/opt/toolchain/enable")),
            &job(repository::Kind::CPlusPlus),
            "/work/8/cs/ds/fake",
        );

        assert!(command.starts_with("source /opt/toolchain/enable; source /etc/profile; "));
    }
}
