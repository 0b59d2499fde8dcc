// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use crate::catalog::{Database, Encoding, Error};

/// Unique identifier for [`User`]
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

/// Someone allowed to install; `notify` opts into build outcome email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Id,
    pub name: String,
    pub admin: bool,
    pub notify: bool,
}

impl Database {
    pub async fn user(&self, name: &str) -> Result<Option<User>, Error> {
        let row = sqlx::query_as::<_, encoding::User>(
            "
            SELECT id, name, admin, notify
            FROM users
            WHERE name = ?;
            ",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(User::from))
    }

    /// Users receiving exception mail
    pub async fn admins(&self) -> Result<Vec<User>, Error> {
        let rows = sqlx::query_as::<_, encoding::User>(
            "
            SELECT id, name, admin, notify
            FROM users
            WHERE admin
            ORDER BY id;
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(User::from).collect())
    }

    /// Users opted into outcome mail
    pub async fn notifiable(&self) -> Result<Vec<User>, Error> {
        let rows = sqlx::query_as::<_, encoding::User>(
            "
            SELECT id, name, admin, notify
            FROM users
            WHERE notify
            ORDER BY id;
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(User::from).collect())
    }
}

impl From<encoding::User> for User {
    fn from(row: encoding::User) -> Self {
        Self {
            id: row.id.0,
            name: row.name,
            admin: row.admin,
            notify: row.notify,
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
    pub struct User {
        pub id: Decoder<Id>,
        pub name: String,
        pub admin: bool,
        pub notify: bool,
    }
}
