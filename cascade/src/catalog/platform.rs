// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use crate::catalog::{Database, Encoding, Error};

/// Unique identifier for [`Platform`]
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

/// A build target, uniquely identified by its
/// (distribution, version, architecture) triplet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub id: Id,
    pub distribution: String,
    pub version: String,
    pub architecture: String,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.distribution, self.version, self.architecture)
    }
}

impl Database {
    /// Platform lookup by its defining triplet
    pub async fn platform(
        &self,
        distribution: &str,
        version: &str,
        architecture: &str,
    ) -> Result<Option<Platform>, Error> {
        let row = sqlx::query_as::<_, encoding::Platform>(
            "
            SELECT id, distribution, version, architecture
            FROM platforms
            WHERE distribution = ? AND version = ? AND architecture = ?;
            ",
        )
        .bind(distribution)
        .bind(version)
        .bind(architecture)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Platform::from))
    }
}

impl From<encoding::Platform> for Platform {
    fn from(row: encoding::Platform) -> Self {
        Self {
            id: row.id.0,
            distribution: row.distribution,
            version: row.version,
            architecture: row.architecture,
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
    use crate::catalog::Decoder;

    #[derive(FromRow)]
    pub struct Platform {
        pub id: Decoder<Id>,
        pub distribution: String,
        pub version: String,
        pub architecture: String,
    }
}
