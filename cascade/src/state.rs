// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::catalog::Database;
use crate::config::Config;
use crate::notify::Mailer;
use crate::pool::{self, Pool};

/// Shared daemon state: catalog, store, mailer and the active worker pool
pub struct State {
    pub db: Database,
    pub store: filestore::Store,
    pub config: Arc<Config>,
    pub mailer: Mailer,
    pub pool: RwLock<Pool>,
}

impl State {
    /// Open all backing services. The pool starts empty; call
    /// [`State::reconcile`] to populate it from the catalog.
    pub async fn new(config: Config) -> Result<Self, Error> {
        let db = Database::new(&config.database_url).await?;
        let store = filestore::Store::open(&config.store_dir)?;
        let mailer = Mailer::new(&config.smtp_server, &config.smtp_sender, &config.smtp_domain);

        Ok(Self {
            db,
            store,
            config: Arc::new(config),
            mailer,
            pool: RwLock::new(Pool::empty()),
        })
    }

    fn context(&self) -> pool::Context {
        pool::Context {
            db: self.db.clone(),
            store: self.store.clone(),
            config: Arc::clone(&self.config),
            mailer: self.mailer.clone(),
        }
    }

    /// Swap in a worker set matching the current builder catalog. Old
    /// workers drain their in-flight job and exit in the background.
    pub async fn reconcile(&self) -> Result<usize, Error> {
        let pool = Pool::from_catalog(&self.context()).await?;
        let count = pool.worker_count();

        let old = std::mem::replace(&mut *self.pool.write().await, pool);
        let handles = old.shutdown();

        tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            info!("previous worker set drained");
        });

        Ok(count)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("catalog")]
    Catalog(#[from] crate::catalog::Error),
    #[error("store")]
    Store(#[from] filestore::Error),
    #[error("pool")]
    Pool(#[from] pool::Error),
}
