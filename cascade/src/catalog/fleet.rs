// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Fleet topology: servers carry installed trees, hosts consume them,
//! facilities group hosts

use std::fmt;

use crate::catalog::{platform, Database, Encoding, Error};

/// Unique identifier for [`Server`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(i64);

impl From<i64> for ServerId {
    fn from(id: i64) -> Self {
        ServerId(id)
    }
}

impl From<ServerId> for i64 {
    fn from(id: ServerId) -> Self {
        id.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for [`Facility`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FacilityId(i64);

impl From<i64> for FacilityId {
    fn from(id: i64) -> Self {
        FacilityId(id)
    }
}

impl From<FacilityId> for i64 {
    fn from(id: FacilityId) -> Self {
        id.0
    }
}

impl fmt::Display for FacilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for [`Host`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(i64);

impl From<i64> for HostId {
    fn from(id: i64) -> Self {
        HostId(id)
    }
}

impl From<HostId> for i64 {
    fn from(id: HostId) -> Self {
        id.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A remote file serving machine; installations for its platform land
/// under `prefix`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: ServerId,
    pub platform_id: platform::Id,
    pub hostname: String,
    pub prefix: String,
}

/// An administrative grouping of hosts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Facility {
    pub id: FacilityId,
    pub name: String,
}

/// A named consumer of installations; many hosts may share one server
/// through per host site subtrees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub id: HostId,
    pub server_id: ServerId,
    pub facility_id: FacilityId,
    pub platform_id: platform::Id,
    pub name: String,
}

impl Database {
    /// All servers bound to `platform`
    pub async fn servers(&self, platform: platform::Id) -> Result<Vec<Server>, Error> {
        let rows = sqlx::query_as::<_, encoding::Server>(
            "
            SELECT id, platform_id, hostname, prefix
            FROM servers
            WHERE platform_id = ?
            ORDER BY id;
            ",
        )
        .bind(platform.encode())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Server::from).collect())
    }

    pub async fn server(&self, server: ServerId) -> Result<Option<Server>, Error> {
        let row = sqlx::query_as::<_, encoding::Server>(
            "
            SELECT id, platform_id, hostname, prefix
            FROM servers
            WHERE id = ?;
            ",
        )
        .bind(server.encode())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Server::from))
    }

    pub async fn facility(&self, name: &str) -> Result<Option<Facility>, Error> {
        let row = sqlx::query_as::<_, encoding::Facility>(
            "
            SELECT id, name
            FROM facilities
            WHERE name = ?;
            ",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Facility::from))
    }

    pub async fn facility_by_id(&self, facility: FacilityId) -> Result<Option<Facility>, Error> {
        let row = sqlx::query_as::<_, encoding::Facility>(
            "
            SELECT id, name
            FROM facilities
            WHERE id = ?;
            ",
        )
        .bind(facility.encode())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Facility::from))
    }

    /// All hosts reading from `server`
    pub async fn hosts_on_server(&self, server: ServerId) -> Result<Vec<Host>, Error> {
        let rows = sqlx::query_as::<_, encoding::Host>(
            "
            SELECT id, server_id, facility_id, platform_id, name
            FROM hosts
            WHERE server_id = ?
            ORDER BY id;
            ",
        )
        .bind(server.encode())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Host::from).collect())
    }

    /// All hosts grouped under `facility`
    pub async fn hosts_in_facility(&self, facility: FacilityId) -> Result<Vec<Host>, Error> {
        let rows = sqlx::query_as::<_, encoding::Host>(
            "
            SELECT id, server_id, facility_id, platform_id, name
            FROM hosts
            WHERE facility_id = ?
            ORDER BY id;
            ",
        )
        .bind(facility.encode())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Host::from).collect())
    }

    /// The host named `name` inside `facility`
    pub async fn host_in_facility(
        &self,
        facility: FacilityId,
        name: &str,
    ) -> Result<Option<Host>, Error> {
        let row = sqlx::query_as::<_, encoding::Host>(
            "
            SELECT id, server_id, facility_id, platform_id, name
            FROM hosts
            WHERE facility_id = ? AND name = ?;
            ",
        )
        .bind(facility.encode())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Host::from))
    }
}

impl From<encoding::Server> for Server {
    fn from(row: encoding::Server) -> Self {
        Self {
            id: row.id.0,
            platform_id: row.platform_id.0,
            hostname: row.hostname,
            prefix: row.prefix,
        }
    }
}

impl From<encoding::Facility> for Facility {
    fn from(row: encoding::Facility) -> Self {
        Self {
            id: row.id.0,
            name: row.name,
        }
    }
}

impl From<encoding::Host> for Host {
    fn from(row: encoding::Host) -> Self {
        Self {
            id: row.id.0,
            server_id: row.server_id.0,
            facility_id: row.facility_id.0,
            platform_id: row.platform_id.0,
            name: row.name,
        }
    }
}

impl Encoding for ServerId {
    type Encoded = i64;
    type Error = std::convert::Infallible;

    fn decode(value: i64) -> Result<Self, Self::Error> {
        Ok(Self(value))
    }

    fn encode(self) -> i64 {
        self.0
    }
}

impl Encoding for FacilityId {
    type Encoded = i64;
    type Error = std::convert::Infallible;

    fn decode(value: i64) -> Result<Self, Self::Error> {
        Ok(Self(value))
    }

    fn encode(self) -> i64 {
        self.0
    }
}

impl Encoding for HostId {
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

    use super::{FacilityId, HostId, ServerId};
    use crate::catalog::{platform, Decoder};

    #[derive(FromRow)]
    pub struct Server {
        pub id: Decoder<ServerId>,
        pub platform_id: Decoder<platform::Id>,
        pub hostname: String,
        pub prefix: String,
    }

    #[derive(FromRow)]
    pub struct Facility {
        pub id: Decoder<FacilityId>,
        pub name: String,
    }

    #[derive(FromRow)]
    pub struct Host {
        pub id: Decoder<HostId>,
        pub server_id: Decoder<ServerId>,
        pub facility_id: Decoder<FacilityId>,
        pub platform_id: Decoder<platform::Id>,
        pub name: String,
    }
}
