// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::Args;
use url::Url;

use crate::catalog::platform;

/// Runtime configuration, supplied by flags or environment at startup
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Database URL of the catalog
    #[arg(
        long,
        env = "CASCADE_DATABASE_URL",
        default_value = "sqlite:///var/lib/cascade/catalog.db",
        global = true
    )]
    pub database_url: String,

    /// Root of the content addressed file store
    #[arg(
        long,
        env = "CASCADE_STORE_DIR",
        default_value = "/var/lib/cascade/store",
        global = true
    )]
    pub store_dir: PathBuf,

    /// Root of the per platform source working trees
    #[arg(
        long,
        env = "CASCADE_REPO_DIR",
        default_value = "/var/lib/cascade/repositories",
        global = true
    )]
    pub repo_dir: PathBuf,

    /// Address the webhook gateway binds to
    #[arg(long, env = "CASCADE_BIND", default_value = "0.0.0.0", global = true)]
    pub bind: String,

    /// Port the webhook gateway listens on
    #[arg(long, env = "CASCADE_PORT", default_value_t = 8099, global = true)]
    pub port: u16,

    /// SMTP relay for outcome notifications
    #[arg(long, env = "CASCADE_SMTP_SERVER", default_value = "smtp", global = true)]
    pub smtp_server: String,

    /// Mail domain appended to catalog user names
    #[arg(
        long,
        env = "CASCADE_SMTP_DOMAIN",
        default_value = "example.org",
        global = true
    )]
    pub smtp_domain: String,

    /// Local part of the notification sender
    #[arg(
        long,
        env = "CASCADE_SMTP_SENDER",
        default_value = "noreply",
        global = true
    )]
    pub smtp_sender: String,

    /// Private key used for both builder and server sessions
    #[arg(
        long,
        env = "CASCADE_SSH_KEY",
        default_value = "/var/lib/cascade/id_ed25519",
        global = true
    )]
    pub ssh_key: PathBuf,

    /// Account used on builders
    #[arg(long, env = "CASCADE_BUILD_USER", default_value = "cascade", global = true)]
    pub build_user: String,

    /// Account used on servers, needs install privileges
    #[arg(long, env = "CASCADE_INSTALL_USER", default_value = "root", global = true)]
    pub install_user: String,

    /// Clone URL of the shared build macros repository
    #[arg(
        long,
        env = "CASCADE_SUPPORT_URL",
        default_value = "https://git.example.org/cs/ds/makefiles.git",
        global = true
    )]
    pub support_url: Url,

    /// Checkout path of the build macros repository, relative to each
    /// platform working tree
    #[arg(
        long,
        env = "CASCADE_SUPPORT_PATH",
        default_value = "cs/ds/makefiles",
        global = true
    )]
    pub support_path: String,

    /// Hard build timeout in seconds; expiry fails the build
    #[arg(
        long,
        env = "CASCADE_BUILD_TIMEOUT",
        default_value_t = 3600,
        global = true
    )]
    pub build_timeout: u64,

    /// Soft build timeout in seconds; expiry only logs
    #[arg(
        long,
        env = "CASCADE_BUILD_TIMEOUT_SOFT",
        default_value_t = 3000,
        global = true
    )]
    pub build_timeout_soft: u64,

    /// Facilities whose hosts keep developer-only library subtrees.
    /// Repeat or comma separate.
    #[arg(
        long = "dev-facility",
        env = "CASCADE_DEV_FACILITIES",
        value_delimiter = ',',
        global = true
    )]
    pub dev_facilities: Vec<String>,
}

impl Config {
    /// Working tree root private to `platform`
    pub fn platform_dir(&self, platform: platform::Id) -> PathBuf {
        self.repo_dir.join(platform.to_string())
    }

    pub fn is_development_facility(&self, name: &str) -> bool {
        self.dev_facilities.iter().any(|f| f == name)
    }
}
