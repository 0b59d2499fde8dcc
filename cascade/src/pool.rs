// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Builder pool
//!
//! One long lived task per catalogued builder, each owning a FIFO queue.
//! Builders sharing a platform split that platform's jobs by shortest
//! queue at enqueue time; within one queue processing is strictly
//! sequential. Reconciliation swaps in a freshly catalogued worker set
//! and drains the old one through a terminator sentinel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::catalog::{build, builder, platform, repository, Database};
use crate::config::Config;
use crate::notify::Mailer;

pub mod collect;
pub mod source;
mod worker;

/// Everything a job needs to travel from admission to a worker
#[derive(Debug, Clone)]
pub struct Job {
    pub build_id: build::Id,
    pub repository_id: repository::Id,
    pub platform_id: platform::Id,
    pub repository_name: String,
    pub repository_ssh_url: String,
    pub repository_kind: repository::Kind,
    pub tag: String,
    pub default_branch: String,
    pub notify_emails: Vec<String>,
}

/// Shared dependencies handed to every worker
#[derive(Clone)]
pub struct Context {
    pub db: Database,
    pub store: filestore::Store,
    pub config: Arc<Config>,
    pub mailer: Mailer,
}

enum Message {
    Job(Box<Job>),
    /// Terminator sentinel: finish the current job, then exit
    Shutdown,
}

/// Handle to one worker task
struct Worker {
    builder: builder::Builder,
    sender: mpsc::UnboundedSender<Message>,
    pending: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Worker {
    fn spawn(builder: builder::Builder, ctx: Context) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(worker::run(
            builder.clone(),
            ctx,
            receiver,
            Arc::clone(&pending),
        ));

        Self {
            builder,
            sender,
            pending,
            task,
        }
    }
}

/// The active worker set, keyed by platform
#[derive(Default)]
pub struct Pool {
    workers: HashMap<platform::Id, Vec<Worker>>,
}

impl Pool {
    /// A pool with no workers; jobs enqueue nowhere until the first
    /// reconciliation
    pub fn empty() -> Self {
        Self::default()
    }

    /// Spawn a worker per catalogued builder
    pub async fn from_catalog(ctx: &Context) -> Result<Self, Error> {
        let mut workers: HashMap<platform::Id, Vec<Worker>> = HashMap::new();

        for builder in ctx.db.all_builders().await? {
            info!(builder = %builder.id, platform = %builder.platform_id, hostname = %builder.hostname, "starting worker");
            workers
                .entry(builder.platform_id)
                .or_default()
                .push(Worker::spawn(builder, ctx.clone()));
        }

        Ok(Self { workers })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.values().map(Vec::len).sum()
    }

    /// Hand `job` to the least loaded worker of its platform.
    ///
    /// Returns false when the platform has no workers; the scheduled
    /// build row is left for the operator.
    pub fn enqueue(&self, job: Job) -> bool {
        let Some(workers) = self.workers.get(&job.platform_id) else {
            warn!(platform = %job.platform_id, build = %job.build_id, "no workers for platform, job dropped");
            return false;
        };

        let Some(index) = select_worker(
            workers
                .iter()
                .map(|worker| (worker.builder.id, worker.pending.load(Ordering::SeqCst))),
        ) else {
            warn!(platform = %job.platform_id, build = %job.build_id, "no workers for platform, job dropped");
            return false;
        };

        let worker = &workers[index];
        worker.pending.fetch_add(1, Ordering::SeqCst);

        if worker.sender.send(Message::Job(Box::new(job))).is_err() {
            worker.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(builder = %worker.builder.id, "worker queue closed, job dropped");
            return false;
        }

        true
    }

    /// Send every worker the terminator sentinel, handing back the join
    /// handles so the caller can await the drain
    pub fn shutdown(self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![];

        for worker in self.workers.into_values().flatten() {
            let _ = worker.sender.send(Message::Shutdown);
            handles.push(worker.task);
        }

        handles
    }
}

/// Index of the worker with the shortest queue, ties broken by lowest
/// builder id
fn select_worker(pending: impl Iterator<Item = (builder::Id, usize)>) -> Option<usize> {
    pending
        .enumerate()
        .min_by_key(|(_, (id, pending))| (*pending, *id))
        .map(|(index, _)| index)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("catalog")]
    Catalog(#[from] crate::catalog::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shortest_queue_wins() {
        let pending = [
            (builder::Id::from(1), 3),
            (builder::Id::from(2), 1),
            (builder::Id::from(3), 2),
        ];

        assert_eq!(select_worker(pending.into_iter()), Some(1));
    }

    #[test]
    fn ties_break_by_lowest_builder_id() {
        let pending = [
            (builder::Id::from(9), 2),
            (builder::Id::from(4), 2),
            (builder::Id::from(7), 2),
        ];

        assert_eq!(select_worker(pending.into_iter()), Some(1));
    }

    #[test]
    fn empty_set_selects_nothing() {
        assert_eq!(select_worker(std::iter::empty()), None);
    }
}
