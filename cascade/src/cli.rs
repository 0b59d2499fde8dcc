// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use cascade::Config;
use clap::Parser;
use thiserror::Error;

mod install;
mod report;
mod serve;
mod version;

#[derive(Debug, Parser)]
#[command(name = "cascade", about = "Fleet build and install control plane")]
pub struct Command {
    #[command(flatten)]
    pub config: Config,
    #[command(subcommand)]
    pub subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    Serve(serve::Command),
    Install(install::Command),
    Report(report::Command),
    Version(version::Command),
}

pub async fn process() -> Result<(), Error> {
    let Command { config, subcommand } = Command::parse();

    match subcommand {
        Subcommand::Serve(command) => serve::handle(command, config).await?,
        Subcommand::Install(command) => install::handle(command, config).await?,
        Subcommand::Report(command) => report::handle(command, config).await?,
        Subcommand::Version(command) => version::handle(command),
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("serve")]
    Serve(#[from] serve::Error),

    #[error("install")]
    Install(#[from] install::Error),

    #[error("report")]
    Report(#[from] report::Error),
}
