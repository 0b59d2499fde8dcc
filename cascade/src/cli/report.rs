// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::str::FromStr;

use cascade::catalog::installation::{Filter, Mode};
use cascade::catalog::Database;
use cascade::Config;
use clap::Parser;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(about = "Report what is installed where")]
pub struct Command {
    #[arg(
        long,
        default_value = "status",
        help = "status (current per host and repository), diff (non global deviations) or history"
    )]
    mode: String,

    #[arg(long, help = "Narrow to one facility")]
    facility: Option<String>,

    #[arg(long, requires = "facility", help = "Narrow to one host of the facility")]
    host: Option<String>,

    #[arg(
        long,
        help = "Narrow to one platform, distribution/version/architecture"
    )]
    platform: Option<String>,
}

pub async fn handle(command: Command, config: Config) -> Result<(), Error> {
    let mode = Mode::from_str(&command.mode).map_err(|_| Error::UnknownMode(command.mode.clone()))?;

    let db = Database::new(&config.database_url).await?;

    let mut filter = Filter::default();

    if let Some(name) = &command.facility {
        let facility = db
            .facility(name)
            .await?
            .ok_or_else(|| Error::FacilityNotFound(name.clone()))?;
        filter.facility = Some(facility.id);

        if let Some(name) = &command.host {
            let host = db
                .host_in_facility(facility.id, name)
                .await?
                .ok_or_else(|| Error::HostNotFound(name.clone()))?;
            filter.host = Some(host.id);
        }
    }

    if let Some(triplet) = &command.platform {
        let mut parts = triplet.splitn(3, '/');
        let (Some(distribution), Some(version), Some(architecture)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::MalformedPlatform(triplet.clone()));
        };

        let platform = db
            .platform(distribution, version, architecture)
            .await?
            .ok_or_else(|| Error::PlatformNotFound(triplet.clone()))?;
        filter.platform = Some(platform.id);
    }

    let rows = db.installation_report(mode, filter).await?;

    for row in &rows {
        println!(
            "{}  {:<12} {:<20} {:<32} {:<14} {:<8} {}",
            row.date.format("%Y-%m-%d %H:%M:%S"),
            row.facility,
            row.host,
            row.repository,
            row.tag,
            row.scope,
            row.author,
        );
    }

    if rows.is_empty() {
        println!("No installations recorded");
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown report mode: {0} (expected status, diff or history)")]
    UnknownMode(String),
    #[error("facility not found: {0}")]
    FacilityNotFound(String),
    #[error("host not found: {0}")]
    HostNotFound(String),
    #[error("platform not found: {0}")]
    PlatformNotFound(String),
    #[error("malformed platform triplet: {0} (expected distribution/version/architecture)")]
    MalformedPlatform(String),
    #[error("catalog")]
    Catalog(#[from] cascade::catalog::Error),
}
