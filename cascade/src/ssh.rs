// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Remote execution over SSH
//!
//! Builders and servers are reached with the same key material but
//! different accounts. Commands run with stderr merged into stdout so
//! diagnostics land in build output verbatim.

use std::{io, path::Path, sync::Arc};

use russh::client;
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::ChannelMsg;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Captured result of one remote command
#[derive(Debug, Clone)]
pub struct Output {
    pub status: u32,
    pub output: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

pub struct Session {
    handle: client::Handle<Acceptor>,
}

impl Session {
    /// Open an authenticated session to `host` as `user`
    pub async fn connect(host: &str, user: &str, key_path: &Path) -> Result<Self, Error> {
        let config = Arc::new(client::Config::default());

        let mut handle = client::connect(config, (host, 22), Acceptor).await?;

        let key = load_secret_key(key_path, None)?;
        let auth = handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), None))
            .await?;

        if !auth.success() {
            return Err(Error::AuthRefused {
                user: user.to_owned(),
                host: host.to_owned(),
            });
        }

        Ok(Self { handle })
    }

    /// Run `command` remotely, waiting for completion. Stderr is merged
    /// into the captured output.
    pub async fn exec(&self, command: &str) -> Result<Output, Error> {
        let mut channel = self.handle.channel_open_session().await?;

        channel.exec(true, format!("({command}) 2>&1")).await?;

        let mut output = Vec::new();
        let mut status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(&data[..]),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(&data[..]),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }

        Ok(Output {
            status: status.ok_or(Error::MissingExitStatus)?,
            output: String::from_utf8_lossy(&output).into_owned(),
        })
    }

    /// Upload the local file at `source` to `remote_path` over SFTP
    pub async fn upload(&self, source: &Path, remote_path: &str) -> Result<(), Error> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;

        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream()).await?;

        let mut local = tokio::fs::File::open(source).await?;
        let mut remote = sftp.create(remote_path).await?;

        tokio::io::copy(&mut local, &mut remote).await?;
        remote.shutdown().await?;

        Ok(())
    }
}

/// Host keys are trusted implicitly; builders and servers live on a
/// closed management network
struct Acceptor;

impl client::Handler for Acceptor {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication refused for {user}@{host}")]
    AuthRefused { user: String, host: String },
    #[error("remote command finished without an exit status")]
    MissingExitStatus,
    #[error("ssh")]
    Ssh(#[from] russh::Error),
    #[error("ssh key")]
    Key(#[from] russh::keys::Error),
    #[error("sftp")]
    Sftp(#[from] russh_sftp::client::error::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
