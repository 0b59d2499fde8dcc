// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use crate::catalog::{platform, Database, Encoding, Error};

/// Unique identifier for [`Builder`]
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

/// A remote machine willing to run build commands for one platform.
/// `environment` optionally names a file sourced before the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Builder {
    pub id: Id,
    pub platform_id: platform::Id,
    pub hostname: String,
    pub environment: Option<String>,
}

impl Database {
    /// All builders assigned to `platform`
    pub async fn builders(&self, platform: platform::Id) -> Result<Vec<Builder>, Error> {
        let rows = sqlx::query_as::<_, encoding::Builder>(
            "
            SELECT id, platform_id, hostname, environment
            FROM builders
            WHERE platform_id = ?
            ORDER BY id;
            ",
        )
        .bind(platform.encode())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Builder::from).collect())
    }

    /// Every builder in the catalog, used when reconciling the pool
    pub async fn all_builders(&self) -> Result<Vec<Builder>, Error> {
        let rows = sqlx::query_as::<_, encoding::Builder>(
            "
            SELECT id, platform_id, hostname, environment
            FROM builders
            ORDER BY id;
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Builder::from).collect())
    }
}

impl From<encoding::Builder> for Builder {
    fn from(row: encoding::Builder) -> Self {
        Self {
            id: row.id.0,
            platform_id: row.platform_id.0,
            hostname: row.hostname,
            environment: row.environment,
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

mod encoding {
    use sqlx::FromRow;

    use super::Id;
    use crate::catalog::{platform, Decoder};

    #[derive(FromRow)]
    pub struct Builder {
        pub id: Decoder<Id>,
        pub platform_id: Decoder<platform::Id>,
        pub hostname: String,
        pub environment: Option<String>,
    }
}
