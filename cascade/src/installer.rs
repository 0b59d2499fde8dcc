// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Installation engine
//!
//! Delivers the artifacts of the latest successful build for
//! (repository, tag) to the servers a scope resolves to, then records
//! the installations. A failing server aborts the request; files already
//! placed stay placed and rows already recorded remain the truthful
//! history, the operator re-runs.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::PermissionsExt;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::installation::Scope;
use crate::catalog::{fleet, Database};
use crate::config::Config;
use crate::installer::placement::{Action, Placement};
use crate::notify::Mailer;
use crate::ssh;

pub mod placement;

/// What to install, where, on whose authority
#[derive(Debug, Clone)]
pub struct Request {
    pub repository: String,
    pub tag: String,
    pub target: Target,
    pub username: String,
}

/// The three installation scopes
#[derive(Debug, Clone)]
pub enum Target {
    /// Every host of every server whose platform carries the repository
    Global,
    /// Every matching host inside one facility
    Facility { facility: String },
    /// Exactly one host, into its site subtree
    Host { facility: String, host: String },
}

impl Target {
    fn scope(&self) -> Scope {
        match self {
            Target::Global => Scope::Global,
            Target::Facility { .. } => Scope::Facility,
            Target::Host { .. } => Scope::Host,
        }
    }
}

/// One recorded delivery, for operator feedback
#[derive(Debug, Clone)]
pub struct Delivery {
    pub facility: String,
    pub host: String,
    pub repository: String,
    pub tag: String,
    pub date: DateTime<Utc>,
    pub author: String,
}

/// Run a full installation request
pub async fn install(
    db: &Database,
    store: &filestore::Store,
    mailer: &Mailer,
    config: &Config,
    request: &Request,
) -> Result<Vec<Delivery>, Error> {
    let user = db
        .user(&request.username)
        .await?
        .ok_or_else(|| Error::UserNotFound(request.username.clone()))?;

    let scope = request.target.scope();
    let destinations = resolve(db, request).await?;

    if destinations.is_empty() {
        return Err(Error::NoDestinations);
    }

    let mut facility_names: HashMap<fleet::FacilityId, String> = HashMap::new();
    let mut deliveries = vec![];

    for (server, hosts) in destinations {
        let Some(repository) = db.repository(server.platform_id, &request.repository).await? else {
            // This server's platform does not carry the repository
            if matches!(scope, Scope::Host) {
                return Err(Error::RepositoryNotFound {
                    repository: request.repository.clone(),
                });
            }
            continue;
        };

        let build = db
            .latest_success(repository.id, &request.tag)
            .await?
            .ok_or_else(|| Error::BuildNotAvailable {
                repository: request.repository.clone(),
                tag: request.tag.clone(),
            })?;

        let artifacts = db.artifacts(build.id).await?;

        for host in &hosts {
            if let std::collections::hash_map::Entry::Vacant(entry) =
                facility_names.entry(host.facility_id)
            {
                let facility = db
                    .facility_by_id(host.facility_id)
                    .await?
                    .ok_or_else(|| Error::FacilityNotFound(host.facility_id.to_string()))?;
                entry.insert(facility.name);
            }
        }

        // Developer subtrees stay when every targeted host belongs to a
        // development facility
        let developer_files = hosts.iter().all(|host| {
            config.is_development_facility(&facility_names[&host.facility_id])
        });

        info!(
            server = %server.hostname,
            build = %build.id,
            artifacts = artifacts.len(),
            "installing"
        );

        let session =
            ssh::Session::connect(&server.hostname, &config.install_user, &config.ssh_key).await?;

        let placement = Placement {
            prefix: &server.prefix,
            destination: &repository.destination,
            kind: repository.kind,
            scope,
            host: hosts.first().map(|host| host.name.as_str()),
            developer_files,
        };

        for artifact in &artifacts {
            let actions = match (&artifact.hash, &artifact.symlink_target) {
                (Some(digest), None) => {
                    let blob = store.path_of(digest)?;
                    let mode = tokio::fs::metadata(&blob).await?.permissions().mode();
                    placement.plan_file(&artifact.filename, digest, mode)
                }
                (None, Some(target)) => placement.plan_symlink(&artifact.filename, target),
                _ => {
                    warn!(artifact = %artifact.filename, "artifact has neither hash nor symlink target, skipped");
                    continue;
                }
            };

            let Some(actions) = actions else {
                debug!(artifact = %artifact.filename, "developer artifact skipped");
                continue;
            };

            perform(&session, store, actions).await?;
        }

        let host_ids = hosts.iter().map(|host| host.id).collect::<Vec<_>>();
        db.record_installations(&host_ids, user.id, build.id, scope)
            .await?;

        let date = Utc::now();
        for host in &hosts {
            deliveries.push(Delivery {
                facility: facility_names[&host.facility_id].clone(),
                host: host.name.clone(),
                repository: repository.name.clone(),
                tag: build.tag.clone(),
                date,
                author: user.name.clone(),
            });
        }
    }

    if user.notify {
        mailer
            .send(
                [mailer.address_of(&user.name)],
                &format!("install: {} {}", request.repository, request.tag),
                &format!(
                    "installed {} tag {} on {} host(s)",
                    request.repository,
                    request.tag,
                    deliveries.len()
                ),
            )
            .await;
    }

    Ok(deliveries)
}

/// Resolve the request scope into ordered (server, hosts) destinations
async fn resolve(
    db: &Database,
    request: &Request,
) -> Result<Vec<(fleet::Server, Vec<fleet::Host>)>, Error> {
    match &request.target {
        Target::Global => {
            let mut selected: BTreeMap<fleet::ServerId, (fleet::Server, Vec<fleet::Host>)> =
                BTreeMap::new();

            for repository in db.repositories_by_name(&request.repository).await? {
                for server in db.servers(repository.platform_id).await? {
                    let hosts = db.hosts_on_server(server.id).await?;
                    if hosts.is_empty() {
                        continue;
                    }
                    selected.insert(server.id, (server, hosts));
                }
            }

            Ok(selected.into_values().collect())
        }
        Target::Facility { facility } => {
            let facility = db
                .facility(facility)
                .await?
                .ok_or_else(|| Error::FacilityNotFound(facility.clone()))?;

            let grouped = db
                .hosts_in_facility(facility.id)
                .await?
                .into_iter()
                .map(|host| (host.server_id, host))
                .into_group_map();

            let mut selected = vec![];

            for (server_id, hosts) in grouped {
                let Some(server) = db.server(server_id).await? else {
                    continue;
                };
                selected.push((server, hosts));
            }

            selected.sort_by_key(|(server, _)| server.id);

            Ok(selected)
        }
        Target::Host { facility, host } => {
            let facility = db
                .facility(facility)
                .await?
                .ok_or_else(|| Error::FacilityNotFound(facility.clone()))?;

            let host = db
                .host_in_facility(facility.id, host)
                .await?
                .ok_or_else(|| Error::HostNotFound(host.clone()))?;

            let server = db
                .server(host.server_id)
                .await?
                .ok_or_else(|| Error::ServerNotFound(host.server_id.to_string()))?;

            Ok(vec![(server, vec![host])])
        }
    }
}

/// Execute one artifact's delivery steps on the server
async fn perform(
    session: &ssh::Session,
    store: &filestore::Store,
    actions: Vec<Action>,
) -> Result<(), Error> {
    for action in actions {
        match action {
            Action::Upload { digest, staging } => {
                let blob = store.path_of(&digest)?;
                session.upload(&blob, &staging).await?;
            }
            Action::Run(command) => {
                let run = session.exec(&command).await?;
                if !run.success() {
                    return Err(Error::Remote {
                        command,
                        output: run.output,
                    });
                }
            }
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("facility not found: {0}")]
    FacilityNotFound(String),
    #[error("host not found: {0}")]
    HostNotFound(String),
    #[error("server not found: {0}")]
    ServerNotFound(String),
    #[error("repository not found: {repository}. Check syntax")]
    RepositoryNotFound { repository: String },
    #[error("build not available for {repository} tag {tag}. Check annotated tag")]
    BuildNotAvailable { repository: String, tag: String },
    #[error("no destinations match the request")]
    NoDestinations,
    #[error("remote command failed: {command}: {output}")]
    Remote { command: String, output: String },
    #[error("ssh")]
    Ssh(#[from] ssh::Error),
    #[error("catalog")]
    Catalog(#[from] crate::catalog::Error),
    #[error("store")]
    Store(#[from] filestore::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::{fixture, repository};

    #[tokio::test]
    async fn global_scope_selects_all_matching_servers() {
        let db = Database::memory().await.unwrap();
        let platform = fixture::platform(&db).await;
        fixture::repository(&db, platform, "cs/ds/fake", repository::Kind::CPlusPlus).await;
        let facility = fixture::facility(&db, "fermi").await;
        let server_a = fixture::server(&db, platform, "srv-a", "/runtime").await;
        let server_b = fixture::server(&db, platform, "srv-b", "/runtime").await;
        fixture::host(&db, server_a, facility, platform, "ec-fake-01").await;
        fixture::host(&db, server_a, facility, platform, "ec-fake-02").await;
        fixture::host(&db, server_b, facility, platform, "ec-fake-03").await;
        // A server with no hosts is no destination
        fixture::server(&db, platform, "srv-idle", "/runtime").await;

        let request = Request {
            repository: "cs/ds/fake".into(),
            tag: "1.0.0".into(),
            target: Target::Global,
            username: "operator".into(),
        };

        let destinations = resolve(&db, &request).await.unwrap();

        assert_eq!(destinations.len(), 2);
        assert_eq!(destinations[0].0.hostname, "srv-a");
        assert_eq!(destinations[0].1.len(), 2);
        assert_eq!(destinations[1].0.hostname, "srv-b");
        assert_eq!(destinations[1].1.len(), 1);
    }

    #[tokio::test]
    async fn facility_scope_narrows_to_its_hosts() {
        let db = Database::memory().await.unwrap();
        let platform = fixture::platform(&db).await;
        fixture::repository(&db, platform, "cs/ds/fake", repository::Kind::CPlusPlus).await;
        let fermi = fixture::facility(&db, "fermi").await;
        let bohr = fixture::facility(&db, "bohr").await;
        let server = fixture::server(&db, platform, "srv-a", "/runtime").await;
        fixture::host(&db, server, fermi, platform, "ec-fake-01").await;
        fixture::host(&db, server, bohr, platform, "ec-fake-02").await;

        let request = Request {
            repository: "cs/ds/fake".into(),
            tag: "1.0.0".into(),
            target: Target::Facility {
                facility: "fermi".into(),
            },
            username: "operator".into(),
        };

        let destinations = resolve(&db, &request).await.unwrap();

        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].1.len(), 1);
        assert_eq!(destinations[0].1[0].name, "ec-fake-01");
    }

    #[tokio::test]
    async fn host_scope_selects_exactly_one() {
        let db = Database::memory().await.unwrap();
        let platform = fixture::platform(&db).await;
        let fermi = fixture::facility(&db, "fermi").await;
        let server = fixture::server(&db, platform, "srv-a", "/runtime").await;
        fixture::host(&db, server, fermi, platform, "ec-fake-01").await;
        fixture::host(&db, server, fermi, platform, "ec-fake-02").await;

        let request = Request {
            repository: "cs/ds/fake".into(),
            tag: "1.0.0".into(),
            target: Target::Host {
                facility: "fermi".into(),
                host: "ec-fake-02".into(),
            },
            username: "operator".into(),
        };

        let destinations = resolve(&db, &request).await.unwrap();

        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].1.len(), 1);
        assert_eq!(destinations[0].1[0].name, "ec-fake-02");

        let missing = Request {
            target: Target::Host {
                facility: "fermi".into(),
                host: "ec-nonexistent".into(),
            },
            ..request
        };
        assert!(matches!(
            resolve(&db, &missing).await,
            Err(Error::HostNotFound(_))
        ));
    }
}
