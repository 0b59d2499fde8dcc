// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Temporal installation history
//!
//! Installation rows are only ever appended. Recording a new installation
//! for a (host, repository) pair closes the previously current row by
//! setting `valid_to`, in the same transaction, so the current row is the
//! single one with `valid_to IS NULL`.

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::Acquire;
use strum::{Display, EnumString};
use thiserror::Error as ThisError;

use crate::catalog::{build, fleet, platform, user, Database, Encoding, Error};

/// Unique identifier for [`Installation`]
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

/// How wide a delivery was aimed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Scope {
    Global,
    Facility,
    Host,
}

/// One delivery event to one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    pub id: Id,
    pub host_id: fleet::HostId,
    pub user_id: user::Id,
    pub build_id: build::Id,
    pub scope: Scope,
    pub install_date: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

/// Which rows a report covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    /// Newest row per (host, repository)
    #[default]
    Status,
    /// Newest row per (host, repository), non global deliveries only
    Diff,
    /// Every row, newest first
    History,
}

/// Optional narrowing of a report
#[derive(Debug, Clone, Copy, Default)]
pub struct Filter {
    pub facility: Option<fleet::FacilityId>,
    pub host: Option<fleet::HostId>,
    pub platform: Option<platform::Id>,
}

/// A joined row for operator reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub facility: String,
    pub host: String,
    pub repository: String,
    pub tag: String,
    pub date: DateTime<Utc>,
    pub author: String,
    pub scope: Scope,
}

impl Database {
    /// Append one installation row per host for `build`, closing each
    /// pair's previously current row. One transaction per call; callers
    /// invoke this once per server so history stays truthful when a
    /// later server fails.
    pub async fn record_installations(
        &self,
        hosts: &[fleet::HostId],
        user: user::Id,
        build: build::Id,
        scope: Scope,
    ) -> Result<Vec<Id>, Error> {
        let now = Utc::now();
        let mut recorded = Vec::with_capacity(hosts.len());

        let mut transaction = self.pool.begin().await?;

        for host in hosts {
            sqlx::query(
                "
                UPDATE installations
                SET valid_to = ?
                WHERE valid_to IS NULL
                  AND host_id = ?
                  AND build_id IN (
                    SELECT id FROM builds
                    WHERE repository_id = (SELECT repository_id FROM builds WHERE id = ?)
                  );
                ",
            )
            .bind(now)
            .bind(host.encode())
            .bind(build.encode())
            .execute(transaction.acquire().await?)
            .await?;

            let row = sqlx::query_as::<_, encoding::InstallationId>(
                "
                INSERT INTO installations (host_id, user_id, build_id, type, install_date, valid_from)
                VALUES (?, ?, ?, ?, ?, ?)
                RETURNING id;
                ",
            )
            .bind(host.encode())
            .bind(user.encode())
            .bind(build.encode())
            .bind(scope.encode())
            .bind(now)
            .bind(now)
            .fetch_one(transaction.acquire().await?)
            .await?;

            recorded.push(row.id.0);
        }

        transaction.commit().await?;

        Ok(recorded)
    }

    /// Installation rows for reporting, newest first
    pub async fn installation_report(
        &self,
        mode: Mode,
        filter: Filter,
    ) -> Result<Vec<ReportRow>, Error> {
        let mut query = sqlx::QueryBuilder::new(
            "
            SELECT f.name AS facility,
                   h.name AS host,
                   r.name AS repository,
                   b.tag AS tag,
                   i.install_date AS date,
                   u.name AS author,
                   i.type AS scope
            FROM installations i
            JOIN hosts h ON h.id = i.host_id
            JOIN facilities f ON f.id = h.facility_id
            JOIN builds b ON b.id = i.build_id
            JOIN repositories r ON r.id = b.repository_id
            JOIN users u ON u.id = i.user_id
            WHERE 1 = 1
            ",
        );

        if matches!(mode, Mode::Status | Mode::Diff) {
            query.push(
                "
                AND i.id IN (
                    SELECT max(i2.id)
                    FROM installations i2
                    JOIN builds b2 ON b2.id = i2.build_id
                    GROUP BY i2.host_id, b2.repository_id
                )
                ",
            );
        }

        if matches!(mode, Mode::Diff) {
            query.push(" AND i.type != ");
            query.push_bind(Scope::Global.encode());
        }

        if let Some(facility) = filter.facility {
            query.push(" AND h.facility_id = ");
            query.push_bind(facility.encode());
        }

        if let Some(host) = filter.host {
            query.push(" AND h.id = ");
            query.push_bind(host.encode());
        }

        if let Some(platform) = filter.platform {
            query.push(" AND h.platform_id = ");
            query.push_bind(platform.encode());
        }

        query.push(" ORDER BY i.install_date DESC, i.id DESC;");

        let rows = query
            .build_query_as::<encoding::ReportRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ReportRow::from).collect())
    }
}

impl From<encoding::ReportRow> for ReportRow {
    fn from(row: encoding::ReportRow) -> Self {
        Self {
            facility: row.facility,
            host: row.host,
            repository: row.repository,
            tag: row.tag,
            date: row.date,
            author: row.author,
            scope: row.scope.0,
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
impl Encoding for Scope {
    type Encoded = i64;
    type Error = DecodeScopeError;

    fn decode(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Global),
            1 => Ok(Self::Facility),
            2 => Ok(Self::Host),
            _ => Err(DecodeScopeError(value)),
        }
    }

    fn encode(self) -> i64 {
        match self {
            Self::Global => 0,
            Self::Facility => 1,
            Self::Host => 2,
        }
    }
}

#[derive(Debug, ThisError)]
#[error("invalid installation scope: {0}")]
pub struct DecodeScopeError(i64);

mod encoding {
    use chrono::{DateTime, Utc};
    use sqlx::FromRow;

    use super::{Id, Scope};
    use crate::catalog::Decoder;

    #[derive(FromRow)]
    pub struct InstallationId {
        pub id: Decoder<Id>,
    }

    #[derive(FromRow)]
    pub struct ReportRow {
        pub facility: String,
        pub host: String,
        pub repository: String,
        pub tag: String,
        pub date: DateTime<Utc>,
        pub author: String,
        pub scope: Decoder<Scope>,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::{fixture, repository};

    #[tokio::test]
    async fn one_current_row_per_pair() {
        let db = Database::memory().await.unwrap();
        let platform = fixture::platform(&db).await;
        let repo = fixture::repository(&db, platform, "cs/ds/fake", repository::Kind::CPlusPlus).await;
        let facility = fixture::facility(&db, "fermi").await;
        let server = fixture::server(&db, platform, "srv-a", "/runtime").await;
        let host = fixture::host(&db, server, facility, platform, "ec-fake-01").await;
        let user = fixture::user(&db, "operator", false, false).await;

        let first = fixture::success_build(&db, repo, platform, "0.1.0").await;
        let second = fixture::success_build(&db, repo, platform, "0.2.0").await;

        db.record_installations(&[host], user, first, Scope::Global)
            .await
            .unwrap();
        db.record_installations(&[host], user, second, Scope::Global)
            .await
            .unwrap();

        let open: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM installations WHERE host_id = ? AND valid_to IS NULL;",
        )
        .bind(host.encode())
        .fetch_one(&db.pool)
        .await
        .unwrap();
        assert_eq!(open.0, 1);

        let report = db
            .installation_report(Mode::Status, Filter::default())
            .await
            .unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].tag, "0.2.0");
        assert_eq!(report[0].host, "ec-fake-01");
        assert_eq!(report[0].facility, "fermi");
    }

    #[tokio::test]
    async fn history_accretes_and_diff_hides_global() {
        let db = Database::memory().await.unwrap();
        let platform = fixture::platform(&db).await;
        let repo = fixture::repository(&db, platform, "cs/ds/fake", repository::Kind::CPlusPlus).await;
        let facility = fixture::facility(&db, "fermi").await;
        let server = fixture::server(&db, platform, "srv-a", "/runtime").await;
        let host = fixture::host(&db, server, facility, platform, "ec-fake-01").await;
        let sibling = fixture::host(&db, server, facility, platform, "ec-fake-02").await;
        let user = fixture::user(&db, "operator", false, false).await;

        let build = fixture::success_build(&db, repo, platform, "0.1.0").await;

        db.record_installations(&[host, sibling], user, build, Scope::Global)
            .await
            .unwrap();
        db.record_installations(&[host], user, build, Scope::Host)
            .await
            .unwrap();

        let history = db
            .installation_report(Mode::History, Filter::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 3);

        let diff = db
            .installation_report(Mode::Diff, Filter::default())
            .await
            .unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].scope, Scope::Host);
        assert_eq!(diff[0].host, "ec-fake-01");

        // Facility narrowing covers both hosts, host narrowing only one
        let by_host = db
            .installation_report(
                Mode::History,
                Filter {
                    host: Some(sibling),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_host.len(), 1);
        assert_eq!(by_host[0].host, "ec-fake-02");
    }
}
