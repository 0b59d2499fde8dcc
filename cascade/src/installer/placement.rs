// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Artifact placement planning
//!
//! Pure translation of one artifact into the remote steps that deliver
//! it: an SFTP upload to a staging path plus the install/ln/rm commands.
//! Repository kind decides the placement root, the file mode and whether
//! developer-only library subtrees are filtered.

use crate::catalog::installation::Scope;
use crate::catalog::repository;

/// One remote step of a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// SFTP the store blob for `digest` to `staging`
    Upload { digest: String, staging: String },
    /// Run a command, failing the install on non zero exit
    Run(String),
}

/// Placement parameters of one (server, repository, scope) combination
#[derive(Debug, Clone)]
pub struct Placement<'a> {
    pub prefix: &'a str,
    pub destination: &'a str,
    pub kind: repository::Kind,
    pub scope: Scope,
    /// Target host name, set for host scoped installs
    pub host: Option<&'a str>,
    /// Keep `lib/cmake` and `lib/pkgconfig` subtrees
    pub developer_files: bool,
}

impl Placement<'_> {
    /// Directory all placements resolve against: the shared prefix, or
    /// the per host site subtree for host scoped installs
    fn root(&self) -> String {
        match (self.scope, self.host) {
            (Scope::Host, Some(host)) => join(self.prefix, &join("site", host)),
            _ => self.prefix.trim_end_matches('/').to_owned(),
        }
    }

    /// Path below the placement root, never slash prefixed. Libraries
    /// ship a full install tree and land directly under the prefix;
    /// everything else goes below the repository destination.
    fn subpath(&self, filename: &str) -> String {
        let below = match self.kind {
            repository::Kind::Library => filename.to_owned(),
            _ => join(self.destination, filename),
        };

        below.trim_start_matches('/').to_owned()
    }

    fn mode(&self, source_mode: u32) -> u32 {
        match self.kind {
            repository::Kind::Configuration => 0o644,
            repository::Kind::Library => source_mode & 0o7777,
            _ => 0o755,
        }
    }

    /// Outside development facilities only the `lib/` and `bin/` subtrees
    /// of a library install ship, minus the developer-only cmake and
    /// pkgconfig directories
    fn filtered(&self, filename: &str) -> bool {
        let filename = filename.trim_start_matches('/');

        matches!(self.kind, repository::Kind::Library)
            && !self.developer_files
            && (filename.starts_with("lib/cmake/")
                || filename.starts_with("lib/pkgconfig/")
                || !(filename.starts_with("lib/") || filename.starts_with("bin/")))
    }

    /// Steps delivering a regular file artifact, or `None` when the
    /// artifact is filtered. `source_mode` is the mode of the store blob.
    pub fn plan_file(&self, filename: &str, digest: &str, source_mode: u32) -> Option<Vec<Action>> {
        if self.filtered(filename) {
            return None;
        }

        let staging = format!("/tmp/{digest}");
        let subpath = self.subpath(filename);
        let target = join(&self.root(), &subpath);

        let mut actions = vec![Action::Upload {
            digest: digest.to_owned(),
            staging: staging.clone(),
        }];

        // Shared installs supersede any per host overlay of the same file
        if matches!(self.scope, Scope::Global | Scope::Facility) {
            actions.push(Action::Run(format!(
                "rm -f {}/site/*/{subpath}",
                self.prefix.trim_end_matches('/')
            )));
        }

        if let Some(directory) = target.rsplit_once('/').map(|(dir, _)| dir) {
            actions.push(Action::Run(format!("install -d {directory}")));
        }

        actions.push(Action::Run(format!(
            "install -m{:o} {staging} {target}",
            self.mode(source_mode)
        )));
        actions.push(Action::Run(format!("rm -f {staging}")));

        Some(actions)
    }

    /// Steps reconstituting a symlink artifact, or `None` when filtered.
    ///
    /// Relative targets are written verbatim so the link resolves next
    /// to itself; absolute targets are rebased onto the placement root.
    pub fn plan_symlink(&self, filename: &str, target: &str) -> Option<Vec<Action>> {
        if self.filtered(filename) {
            return None;
        }

        let root = self.root();
        let link = join(&root, filename);
        let resolved = if target.starts_with('/') {
            join(&root, target)
        } else {
            target.to_owned()
        };

        let mut actions = vec![];

        if let Some(directory) = link.rsplit_once('/').map(|(dir, _)| dir) {
            actions.push(Action::Run(format!("install -d {directory}")));
        }

        actions.push(Action::Run(format!("ln -sfn {resolved} {link}")));

        Some(actions)
    }
}

/// Join path fragments with exactly one separator
fn join(base: &str, rest: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), rest.trim_start_matches('/'))
}
