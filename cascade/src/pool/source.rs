// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Platform private source mirrors
//!
//! Each platform owns a working directory holding a clone of the shared
//! build macros repository plus one clone per project. Workers of a
//! platform are the only writers, so no locking is needed.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process;
use tracing::debug;

use crate::config::Config;
use crate::pool::Job;

/// Bring the platform working tree up to date for `job` and check the
/// requested tag out. Returns the project checkout directory.
pub async fn sync(config: &Config, job: &Job) -> Result<PathBuf, Error> {
    let platform_dir = config.platform_dir(job.platform_id);

    tokio::fs::create_dir_all(&platform_dir).await?;

    sync_support(config, &platform_dir).await?;

    let builddir = platform_dir.join(&job.repository_name);

    if builddir.join(".git").exists() {
        run_git(&["fetch", "--force", "--tags", "origin"], Some(&builddir)).await?;
    } else {
        if let Some(parent) = builddir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        run_git(
            &[
                "clone",
                "--recurse-submodules",
                "--",
                &job.repository_ssh_url,
                &builddir.display().to_string(),
            ],
            None,
        )
        .await?;
    }

    // Tags cut on feature branches never build; the tagged commit must
    // be an ancestor of the declared default branch
    let commit = run_git(
        &["rev-parse", &format!("{}^{{commit}}", job.tag)],
        Some(&builddir),
    )
    .await?
    .trim()
    .to_owned();

    let upstream = format!("origin/{}", job.default_branch);
    let reachable = run_git(
        &["merge-base", "--is-ancestor", &commit, &upstream],
        Some(&builddir),
    )
    .await;

    if reachable.is_err() {
        return Err(Error::TagNotOnDefaultBranch {
            tag: job.tag.clone(),
            branch: job.default_branch.clone(),
        });
    }

    run_git(&["reset", "--hard", &job.tag, "--"], Some(&builddir)).await?;
    run_git(
        &["submodule", "update", "--init", "--force", "--recursive"],
        Some(&builddir),
    )
    .await?;

    Ok(builddir)
}

/// Keep the shared build macros clone fast forwarded on its default branch
async fn sync_support(config: &Config, platform_dir: &Path) -> Result<(), Error> {
    let support_dir = platform_dir.join(&config.support_path);

    if support_dir.join(".git").exists() {
        run_git(&["fetch", "origin"], Some(&support_dir)).await?;
        run_git(&["reset", "--hard", "origin/HEAD"], Some(&support_dir)).await?;
    } else {
        if let Some(parent) = support_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        run_git(
            &[
                "clone",
                "--recurse-submodules",
                "--",
                config.support_url.as_str(),
                &support_dir.display().to_string(),
            ],
            None,
        )
        .await?;
    }

    Ok(())
}

async fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<String, Error> {
    let mut command = process::Command::new("git");

    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    debug!(?args, "running git");

    let output = command.args(args).output().await?;

    if !output.status.success() {
        return Err(Error::Git {
            command: format!("git {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{command}: {stderr}")]
    Git { command: String, stderr: String },
    #[error("tag {tag} is not reachable from default branch {branch}")]
    TagNotOnDefaultBranch { tag: String, branch: String },
    #[error("io")]
    Io(#[from] std::io::Error),
}
