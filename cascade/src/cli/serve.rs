// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::sync::Arc;

use cascade::{gateway, Config, State};
use clap::Parser;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Run the webhook gateway and builder pool")]
pub struct Command {}

pub async fn handle(_command: Command, config: Config) -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let state = Arc::new(State::new(config).await?);

    let workers = state.reconcile().await?;
    info!(workers, "builder pool ready");

    // SIGHUP swaps in a worker set matching the current builder catalog
    let reconciler = Arc::clone(&state);
    tokio::spawn(async move {
        let Ok(mut hangup) = signal(SignalKind::hangup()) else {
            warn!("unable to install SIGHUP handler, reconciliation disabled");
            return;
        };

        while hangup.recv().await.is_some() {
            match reconciler.reconcile().await {
                Ok(workers) => info!(workers, "builder pool reconciled"),
                Err(e) => error!(error = %e, "reconciliation failed"),
            }
        }
    });

    let address = format!("{}:{}", state.config.bind, state.config.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(%address, "gateway listening");

    axum::serve(listener, gateway::router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown())
        .await?;

    Ok(())
}

async fn shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    State(#[from] cascade::state::Error),

    #[error("io")]
    Io(#[from] io::Error),
}
