// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Catalog access
//!
//! The catalog is the authoritative relational state: platforms,
//! repositories, builders, builds, artifacts, the fleet topology and the
//! temporal installation history. The core only ever appends builds,
//! artifacts and installations; catalog shape is administered out of band.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use thiserror::Error;

pub use self::encoding::{Decoder, Encoding};

pub mod build;
pub mod builder;
pub mod fleet;
pub mod installation;
pub mod platform;
pub mod repository;
pub mod user;

#[cfg(test)]
pub(crate) mod fixture;

#[derive(Debug, Clone)]
pub struct Database {
    pub(crate) pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to the catalog at `url`, applying any pending migrations
    pub async fn new(url: &str) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        Self::connect(SqlitePoolOptions::new(), options).await
    }

    /// An in-memory catalog. The pool is capped at a single connection
    /// since each sqlite `:memory:` connection is its own database.
    pub async fn memory() -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        Self::connect(SqlitePoolOptions::new().max_connections(1), options).await
    }

    async fn connect(
        pool_options: SqlitePoolOptions,
        options: SqliteConnectOptions,
    ) -> Result<Self, Error> {
        let pool = pool_options.connect_with(options).await?;

        sqlx::migrate!("src/catalog/migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Cheap connectivity probe used by the gateway health endpoint
    pub async fn ping(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1;").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

mod encoding {
    //! Decode from sql types to rust types

    use sqlx::{Sqlite, Type};

    /// Decode from a database type using [`Encoding::decode`]
    #[derive(Debug, Clone, Copy)]
    pub struct Decoder<T>(pub T);

    /// A trait to define an encoding between a sql type and rust type
    pub trait Encoding: Sized {
        type Encoded;
        type Error;

        fn decode(encoded: Self::Encoded) -> Result<Self, Self::Error>;
        fn encode(self) -> Self::Encoded;
    }

    impl<'r, T, U, E> sqlx::Decode<'r, Sqlite> for Decoder<T>
    where
        T: Encoding<Encoded = U, Error = E>,
        U: sqlx::Decode<'r, Sqlite>,
        E: std::error::Error + Send + Sync + 'static,
    {
        fn decode(
            value: <Sqlite as sqlx::Database>::ValueRef<'r>,
        ) -> Result<Self, sqlx::error::BoxDynError> {
            Ok(T::decode(U::decode(value)?).map(Decoder)?)
        }
    }

    impl<T, U, E> Type<Sqlite> for Decoder<T>
    where
        T: Encoding<Encoded = U, Error = E>,
        U: Type<Sqlite>,
    {
        fn type_info() -> <Sqlite as sqlx::Database>::TypeInfo {
            U::type_info()
        }

        fn compatible(ty: &<Sqlite as sqlx::Database>::TypeInfo) -> bool {
            U::compatible(ty)
        }
    }
}
