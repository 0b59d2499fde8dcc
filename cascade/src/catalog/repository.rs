// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use strum::{Display, EnumString};
use thiserror::Error as ThisError;

use crate::catalog::{platform, Database, Encoding, Error};

/// Unique identifier for [`Repository`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(i64);

impl From<i64> for Id {
    fn from(id: i64) -> Self {
        Id(id)
    }
}

impl From<Id> for i64 {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a repository produces, which decides the build command,
/// the output root that is collected and the installed file modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    CPlusPlus,
    Python,
    Configuration,
    ShellScript,
    Library,
}

/// A source repository bound to exactly one platform. The same upstream
/// project may appear once per platform it is built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub id: Id,
    pub platform_id: platform::Id,
    pub provider_url: String,
    /// Provider path with namespace, matched against webhook events
    pub name: String,
    pub kind: Kind,
    /// Install destination relative to a server prefix
    pub destination: String,
    pub enabled: bool,
}

impl Database {
    /// All enabled repositories registered under `name`, one per platform
    pub async fn repositories_by_name(&self, name: &str) -> Result<Vec<Repository>, Error> {
        let rows = sqlx::query_as::<_, encoding::Repository>(
            "
            SELECT id, platform_id, provider_url, name, type, destination, enabled
            FROM repositories
            WHERE name = ? AND enabled
            ORDER BY id;
            ",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Repository::from).collect())
    }

    /// The repository registered under `name` for `platform`, if any
    pub async fn repository(
        &self,
        platform: platform::Id,
        name: &str,
    ) -> Result<Option<Repository>, Error> {
        let row = sqlx::query_as::<_, encoding::Repository>(
            "
            SELECT id, platform_id, provider_url, name, type, destination, enabled
            FROM repositories
            WHERE platform_id = ? AND name = ? AND enabled;
            ",
        )
        .bind(platform.encode())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Repository::from))
    }
}

impl From<encoding::Repository> for Repository {
    fn from(row: encoding::Repository) -> Self {
        Self {
            id: row.id.0,
            platform_id: row.platform_id.0,
            provider_url: row.provider_url,
            name: row.name,
            kind: row.kind.0,
            destination: row.destination,
            enabled: row.enabled,
        }
    }
}

impl Encoding for Id {
    type Encoded = i64;
    type Error = std::convert::Infallible;

    fn decode(value: i64) -> Result<Self, Self::Error> {
        Ok(Self(value))
    }

    fn encode(self) -> i64 {
        self.0
    }
}

/// Canonical integer encoding shared with the production data
impl Encoding for Kind {
    type Encoded = i64;
    type Error = DecodeKindError;

    fn decode(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::CPlusPlus),
            1 => Ok(Self::Python),
            2 => Ok(Self::Configuration),
            3 => Ok(Self::ShellScript),
            4 => Ok(Self::Library),
            _ => Err(DecodeKindError(value)),
        }
    }

    fn encode(self) -> i64 {
        match self {
            Self::CPlusPlus => 0,
            Self::Python => 1,
            Self::Configuration => 2,
            Self::ShellScript => 3,
            Self::Library => 4,
        }
    }
}

#[derive(Debug, ThisError)]
#[error("invalid repository type: {0}")]
pub struct DecodeKindError(i64);

mod encoding {
    use sqlx::FromRow;

    use super::{Id, Kind};
    use crate::catalog::{platform, Decoder};

    #[derive(FromRow)]
    pub struct Repository {
        pub id: Decoder<Id>,
        pub platform_id: Decoder<platform::Id>,
        pub provider_url: String,
        pub name: String,
        #[sqlx(rename = "type")]
        pub kind: Decoder<Kind>,
        pub destination: String,
        pub enabled: bool,
    }
}
