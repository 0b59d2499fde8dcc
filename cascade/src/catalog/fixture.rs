// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Catalog rows for tests. Shape mutations are an administrative concern
//! outside the core, so these insert directly.

use crate::catalog::{build, builder, fleet, platform, repository, user, Database, Encoding};

pub async fn platform(db: &Database) -> platform::Id {
    platform_named(db, "debian", "12", "x86_64").await
}

pub async fn platform_named(
    db: &Database,
    distribution: &str,
    version: &str,
    architecture: &str,
) -> platform::Id {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO platforms (distribution, version, architecture) VALUES (?, ?, ?) RETURNING id;",
    )
    .bind(distribution)
    .bind(version)
    .bind(architecture)
    .fetch_one(&db.pool)
    .await
    .unwrap();

    row.0.into()
}

pub async fn repository(
    db: &Database,
    platform: platform::Id,
    name: &str,
    kind: repository::Kind,
) -> repository::Id {
    repository_with_destination(db, platform, name, kind, "/opt/apps/").await
}

pub async fn repository_with_destination(
    db: &Database,
    platform: platform::Id,
    name: &str,
    kind: repository::Kind,
    destination: &str,
) -> repository::Id {
    let row: (i64,) = sqlx::query_as(
        "
        INSERT INTO repositories (platform_id, provider_url, name, type, destination, enabled)
        VALUES (?, ?, ?, ?, ?, TRUE)
        RETURNING id;
        ",
    )
    .bind(platform.encode())
    .bind("git@git.example.org")
    .bind(name)
    .bind(kind.encode())
    .bind(destination)
    .fetch_one(&db.pool)
    .await
    .unwrap();

    row.0.into()
}

pub async fn builder(db: &Database, platform: platform::Id, hostname: &str) -> builder::Id {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO builders (platform_id, hostname) VALUES (?, ?) RETURNING id;",
    )
    .bind(platform.encode())
    .bind(hostname)
    .fetch_one(&db.pool)
    .await
    .unwrap();

    row.0.into()
}

pub async fn server(
    db: &Database,
    platform: platform::Id,
    hostname: &str,
    prefix: &str,
) -> fleet::ServerId {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO servers (platform_id, hostname, prefix) VALUES (?, ?, ?) RETURNING id;",
    )
    .bind(platform.encode())
    .bind(hostname)
    .bind(prefix)
    .fetch_one(&db.pool)
    .await
    .unwrap();

    row.0.into()
}

pub async fn facility(db: &Database, name: &str) -> fleet::FacilityId {
    let row: (i64,) = sqlx::query_as("INSERT INTO facilities (name) VALUES (?) RETURNING id;")
        .bind(name)
        .fetch_one(&db.pool)
        .await
        .unwrap();

    row.0.into()
}

pub async fn host(
    db: &Database,
    server: fleet::ServerId,
    facility: fleet::FacilityId,
    platform: platform::Id,
    name: &str,
) -> fleet::HostId {
    let row: (i64,) = sqlx::query_as(
        "
        INSERT INTO hosts (server_id, facility_id, platform_id, name)
        VALUES (?, ?, ?, ?)
        RETURNING id;
        ",
    )
    .bind(server.encode())
    .bind(facility.encode())
    .bind(platform.encode())
    .bind(name)
    .fetch_one(&db.pool)
    .await
    .unwrap();

    row.0.into()
}

pub async fn user(db: &Database, name: &str, admin: bool, notify: bool) -> user::Id {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO users (name, admin, notify) VALUES (?, ?, ?) RETURNING id;",
    )
    .bind(name)
    .bind(admin)
    .bind(notify)
    .fetch_one(&db.pool)
    .await
    .unwrap();

    row.0.into()
}

/// Admit, start and succeed a build with no artifacts
pub async fn success_build(
    db: &Database,
    repository: repository::Id,
    platform: platform::Id,
    tag: &str,
) -> build::Id {
    let admitted = db.admit_build(repository, platform, tag).await.unwrap();
    db.start_build(admitted.build.id).await.unwrap();
    db.finish_build_success(admitted.build.id, "ok", &[])
        .await
        .unwrap();

    admitted.build.id
}
