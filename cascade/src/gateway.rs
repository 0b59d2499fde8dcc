// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Webhook gateway
//!
//! Translates provider tag push events into scheduled builds on the
//! correct platform queues. Admission is idempotent on the
//! (repository, platform, tag) key, so at-least-once webhook delivery
//! is safe.

use std::sync::Arc;

use axum::extract::State as AxumState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::pool::Job;
use crate::state::State;

/// `after` of a deleted tag
const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// A provider tag push event; unknown fields are ignored
#[derive(Debug, Clone, Deserialize)]
pub struct TagPushEvent {
    pub object_kind: String,
    #[serde(default)]
    pub before: Option<String>,
    pub after: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub project: Project,
    #[serde(default)]
    pub commits: Vec<Commit>,
    #[serde(default)]
    pub user_username: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub ssh_url: String,
    pub default_branch: String,
    pub path_with_namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub id: String,
    pub author: Author,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Author {
    pub email: String,
}

impl TagPushEvent {
    /// Tag name below `refs/tags/`, if the ref is well formed
    fn tag(&self) -> Option<&str> {
        self.git_ref
            .strip_prefix("refs/tags/")
            .filter(|tag| !tag.is_empty())
    }

    /// A lightweight tag points straight at the pushed commit; only
    /// annotated tags (their own object id) trigger builds
    fn is_lightweight(&self) -> bool {
        self.commits
            .first()
            .is_some_and(|commit| commit.id == self.after)
    }

    /// Event recipients, empty entries filtered
    fn notify_emails(&self, domain: &str) -> Vec<String> {
        let mut emails = vec![];

        if let Some(commit) = self.commits.first() {
            emails.push(commit.author.email.clone());
        }
        if let Some(username) = &self.user_username {
            emails.push(format!("{username}@{domain}"));
        }
        if let Some(email) = &self.user_email {
            emails.push(email.clone());
        }

        emails.retain(|email| email.contains('@'));
        emails.sort();
        emails.dedup();
        emails
    }
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/", post(receive))
        .route("/health", get(health))
        .with_state(state)
}

async fn receive(
    AxumState(state): AxumState<Arc<State>>,
    Json(event): Json<TagPushEvent>,
) -> Response {
    if event.object_kind != "tag_push" {
        return ignored("not a tag push event");
    }

    if event.after == ZERO_SHA {
        return ignored("tag deletion");
    }

    let Some(tag) = event.tag() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid tag reference" })),
        )
            .into_response();
    };

    if event.is_lightweight() {
        return ignored("lightweight tag");
    }

    let name = &event.project.path_with_namespace;

    let repositories = match state.db.repositories_by_name(name).await {
        Ok(repositories) => repositories,
        Err(e) => return persistence_failure(e),
    };

    if repositories.is_empty() {
        warn!(repository = %name, "tag push for unconfigured repository");
        return ignored(&format!("repository {name} not configured for builds"));
    }

    let notify_emails = event.notify_emails(&state.config.smtp_domain);
    let mut scheduled = vec![];

    for repository in repositories {
        let admission = match state
            .db
            .admit_build(repository.id, repository.platform_id, tag)
            .await
        {
            Ok(admission) => admission,
            Err(e) => return persistence_failure(e),
        };

        if !admission.fresh {
            continue;
        }

        info!(
            build = %admission.build.id,
            repository = %name,
            platform = %repository.platform_id,
            tag,
            "build scheduled"
        );

        state.pool.read().await.enqueue(Job {
            build_id: admission.build.id,
            repository_id: repository.id,
            platform_id: repository.platform_id,
            repository_name: repository.name.clone(),
            repository_ssh_url: event.project.ssh_url.clone(),
            repository_kind: repository.kind,
            tag: tag.to_owned(),
            default_branch: event.project.default_branch.clone(),
            notify_emails: notify_emails.clone(),
        });

        scheduled.push(admission.build);
    }

    if scheduled.is_empty() {
        return ignored(&format!("builds for tag {tag} already scheduled"));
    }

    (
        StatusCode::CREATED,
        Json(json!({
            "message": format!("scheduled {} builds for tag {tag}", scheduled.len()),
            "builds": scheduled
                .iter()
                .map(|build| json!({ "id": i64::from(build.id), "platform_id": i64::from(build.platform_id) }))
                .collect::<Vec<_>>(),
        })),
    )
        .into_response()
}

async fn health(AxumState(state): AxumState<Arc<State>>) -> Response {
    match state.db.ping().await {
        Ok(()) => Json(json!({ "status": "ok", "checks": { "database": "ok" } })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "checks": { "database": e.to_string() } })),
        )
            .into_response(),
    }
}

/// Filtered events are acknowledged so the provider stops retrying
fn ignored(message: &str) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "message": format!("ignored: {message}") })),
    )
        .into_response()
}

fn persistence_failure(e: crate::catalog::Error) -> Response {
    error!(error = %e, "webhook persistence failure");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod test {
    use axum::body::Body;
    use axum::http::{header, Request};
    use clap::Parser;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    use super::*;
    use crate::catalog::{fixture, repository, Database};
    use crate::config::Config;
    use crate::notify::Mailer;
    use crate::pool::Pool;

    #[derive(Parser)]
    struct TestArgs {
        #[command(flatten)]
        config: Config,
    }

    async fn test_state(dir: &std::path::Path) -> Arc<State> {
        let config = TestArgs::parse_from(["cascade"]).config;
        let db = Database::memory().await.unwrap();
        let store = filestore::Store::open(dir.join("store")).unwrap();
        let mailer = Mailer::new("localhost", "noreply", "example.org");

        Arc::new(State {
            db,
            store,
            config: Arc::new(config),
            mailer,
            pool: RwLock::new(Pool::empty()),
        })
    }

    fn tag_push(after: &str, commit_id: &str, git_ref: &str, kind: &str) -> serde_json::Value {
        json!({
            "object_kind": kind,
            "before": "1111111111111111111111111111111111111111",
            "after": after,
            "ref": git_ref,
            "project": {
                "ssh_url": "git@git.example.org:cs/ds/fake.git",
                "default_branch": "master",
                "path_with_namespace": "cs/ds/fake",
            },
            "commits": [
                { "id": commit_id, "author": { "email": "author@example.org" } },
            ],
            "user_username": "operator",
            "user_email": "operator@example.org",
        })
    }

    async fn deliver(router: &Router, payload: &serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap();

        (status, body)
    }

    #[tokio::test]
    async fn annotated_tag_schedules_builds() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let platform = fixture::platform(&state.db).await;
        fixture::repository(&state.db, platform, "cs/ds/fake", repository::Kind::CPlusPlus).await;

        let router = router(Arc::clone(&state));
        let payload = tag_push("def4567890", "abc1234567", "refs/tags/1.2.3", "tag_push");

        let (status, body) = deliver(&router, &payload).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["builds"].as_array().unwrap().len(), 1);
        assert_eq!(
            body["builds"][0]["platform_id"].as_i64().unwrap(),
            i64::from(platform)
        );
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let platform = fixture::platform(&state.db).await;
        fixture::repository(&state.db, platform, "cs/ds/fake", repository::Kind::CPlusPlus).await;

        let router = router(Arc::clone(&state));
        let payload = tag_push("def4567890", "abc1234567", "refs/tags/1.2.3", "tag_push");

        let (first, _) = deliver(&router, &payload).await;
        let (second, body) = deliver(&router, &payload).await;

        assert_eq!(first, StatusCode::CREATED);
        assert_eq!(second, StatusCode::OK);
        assert!(body["message"].as_str().unwrap().contains("already scheduled"));

        let count: (i64,) = sqlx::query_as("SELECT count(*) FROM builds;")
            .fetch_one(&state.db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn lightweight_tags_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let platform = fixture::platform(&state.db).await;
        fixture::repository(&state.db, platform, "cs/ds/fake", repository::Kind::CPlusPlus).await;

        let router = router(Arc::clone(&state));
        // after == commits[0].id, a bare commit pointer
        let payload = tag_push("abc1234567", "abc1234567", "refs/tags/1.2.3", "tag_push");

        let (status, body) = deliver(&router, &payload).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].as_str().unwrap().contains("lightweight"));

        let count: (i64,) = sqlx::query_as("SELECT count(*) FROM builds;")
            .fetch_one(&state.db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn deletions_and_foreign_events_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let router = router(Arc::clone(&state));

        let deletion = tag_push(super::ZERO_SHA, "abc1234567", "refs/tags/1.2.3", "tag_push");
        let (status, _) = deliver(&router, &deletion).await;
        assert_eq!(status, StatusCode::OK);

        let push = tag_push("def4567890", "abc1234567", "refs/heads/master", "push");
        let (status, _) = deliver(&router, &push).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_refs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let router = router(Arc::clone(&state));

        let payload = tag_push("def4567890", "abc1234567", "refs/heads/1.2.3", "tag_push");
        let (status, _) = deliver(&router, &payload).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_repositories_are_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let router = router(Arc::clone(&state));

        let payload = tag_push("def4567890", "abc1234567", "refs/tags/1.2.3", "tag_push");
        let (status, body) = deliver(&router, &payload).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].as_str().unwrap().contains("not configured"));
    }

    #[test]
    fn notify_emails_are_filtered_and_deduped() {
        let event: TagPushEvent = serde_json::from_value(tag_push(
            "def4567890",
            "abc1234567",
            "refs/tags/1.2.3",
            "tag_push",
        ))
        .unwrap();

        let emails = event.notify_emails("example.org");

        assert_eq!(
            emails,
            vec![
                "author@example.org".to_owned(),
                "operator@example.org".to_owned(),
            ]
        );
    }
}
