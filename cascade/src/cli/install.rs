// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use cascade::catalog::Database;
use cascade::installer::{self, Request, Target};
use cascade::notify::Mailer;
use cascade::Config;
use clap::Parser;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(about = "Install a built tag onto the fleet")]
pub struct Command {
    #[arg(help = "Repository name (provider path with namespace)")]
    repository: String,

    #[arg(help = "Annotated tag to install")]
    tag: String,

    #[arg(long, help = "Restrict the installation to one facility")]
    facility: Option<String>,

    #[arg(
        long,
        requires = "facility",
        help = "Restrict the installation to one host of the facility"
    )]
    host: Option<String>,

    #[arg(long, help = "Acting catalog user")]
    user: String,
}

pub async fn handle(command: Command, config: Config) -> Result<(), Error> {
    let db = Database::new(&config.database_url).await?;
    let store = filestore::Store::open(&config.store_dir)?;
    let mailer = Mailer::new(&config.smtp_server, &config.smtp_sender, &config.smtp_domain);

    let target = match (command.facility, command.host) {
        (Some(facility), Some(host)) => Target::Host { facility, host },
        (Some(facility), None) => Target::Facility { facility },
        (None, _) => Target::Global,
    };

    let request = Request {
        repository: command.repository,
        tag: command.tag,
        target,
        username: command.user,
    };

    let deliveries = installer::install(&db, &store, &mailer, &config, &request).await?;

    for delivery in &deliveries {
        println!(
            "{}  {:<12} {:<20} {} {} ({})",
            delivery.date.format("%Y-%m-%d %H:%M:%S"),
            delivery.facility,
            delivery.host,
            delivery.repository,
            delivery.tag,
            delivery.author,
        );
    }

    println!("Installed on {} host(s)", deliveries.len());

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Install(#[from] installer::Error),

    #[error("catalog")]
    Catalog(#[from] cascade::catalog::Error),

    #[error("store")]
    Store(#[from] filestore::Error),
}
