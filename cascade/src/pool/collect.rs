// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Artifact collection
//!
//! After a successful remote build the type specific output root is
//! walked; regular files are ingested into the store and symbolic links
//! recorded with their target rewritten relative to the root.

use std::path::{Path, PathBuf};

use filestore::Store;
use fs_err as fs;
use thiserror::Error;

use crate::catalog::build::ArtifactDraft;
use crate::catalog::repository;

/// Directory below the checkout whose contents get collected
pub fn output_root(kind: repository::Kind) -> &'static str {
    match kind {
        repository::Kind::CPlusPlus | repository::Kind::Python | repository::Kind::ShellScript => {
            "bin"
        }
        repository::Kind::Configuration => "etc",
        repository::Kind::Library => ".install",
    }
}

/// Collect every artifact below the output root of `builddir`.
///
/// A missing or empty root yields an empty set; the build stays
/// successful with zero artifacts.
pub async fn artifacts(
    store: &Store,
    kind: repository::Kind,
    builddir: &Path,
) -> Result<Vec<ArtifactDraft>, Error> {
    let base = builddir.join(output_root(kind));

    if !base.exists() {
        return Ok(vec![]);
    }

    let base_clone = base.clone();
    let entries = tokio::task::spawn_blocking(move || walk(&base_clone))
        .await
        .expect("join blocking walk")?;

    let mut drafts = Vec::with_capacity(entries.len());

    for entry in entries {
        let filename = entry
            .path
            .strip_prefix(&base)
            .expect("walked path below base")
            .display()
            .to_string();

        if entry.is_symlink {
            let target = fs::read_link(&entry.path)?;
            drafts.push(ArtifactDraft::symlink(
                filename,
                rewrite_target(&target, &base),
            ));
        } else {
            let digest = store.ingest(&entry.path).await?;
            drafts.push(ArtifactDraft::file(filename, digest));
        }
    }

    Ok(drafts)
}

struct Entry {
    path: PathBuf,
    is_symlink: bool,
}

/// Depth first, name ordered enumeration of files and symlinks below `dir`
fn walk(dir: &Path) -> Result<Vec<Entry>, Error> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut found = vec![];

    for entry in entries {
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;

        if meta.is_dir() {
            found.extend(walk(&path)?);
        } else if meta.is_symlink() {
            found.push(Entry {
                path,
                is_symlink: true,
            });
        } else if meta.is_file() {
            found.push(Entry {
                path,
                is_symlink: false,
            });
        }
    }

    Ok(found)
}

/// Express a link target relative to the collection root.
///
/// Relative targets resolve against the link's own directory and are
/// kept verbatim. Absolute targets inside the root are rebased onto it
/// (leading slash retained, the installer prepends the server prefix);
/// absolute targets outside the root point at system paths and pass
/// through untouched.
fn rewrite_target(target: &Path, base: &Path) -> String {
    if target.is_absolute() {
        if let Ok(rebased) = target.strip_prefix(base) {
            return format!("/{}", rebased.display());
        }
    }

    target.display().to_string()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("store")]
    Store(#[from] filestore::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::symlink;

    use super::*;

    #[tokio::test]
    async fn collects_files_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let builddir = dir.path().join("checkout");

        let bin = builddir.join("bin");
        std::fs::create_dir_all(bin.join("tools")).unwrap();
        std::fs::write(bin.join("foo"), b"binary").unwrap();
        std::fs::write(bin.join("tools/helper"), b"helper").unwrap();
        symlink("foo", bin.join("foo-1.0")).unwrap();

        let drafts = artifacts(&store, repository::Kind::CPlusPlus, &builddir)
            .await
            .unwrap();

        assert_eq!(drafts.len(), 3);

        let file = drafts.iter().find(|d| d.filename == "foo").unwrap();
        assert!(file.hash.is_some());
        assert!(store.has(file.hash.as_ref().unwrap()).await.unwrap());

        let link = drafts.iter().find(|d| d.filename == "foo-1.0").unwrap();
        assert_eq!(link.symlink_target.as_deref(), Some("foo"));
        assert!(link.hash.is_none());

        let nested = drafts.iter().find(|d| d.filename == "tools/helper").unwrap();
        assert!(nested.hash.is_some());
    }

    #[tokio::test]
    async fn missing_root_collects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let builddir = dir.path().join("checkout");
        std::fs::create_dir_all(&builddir).unwrap();

        let drafts = artifacts(&store, repository::Kind::Configuration, &builddir)
            .await
            .unwrap();

        assert!(drafts.is_empty());
    }

    #[test]
    fn library_targets_are_rebased() {
        let base = Path::new("/work/8/cs/libs/foo/.install");

        // Inside the install tree, rebased onto the root
        assert_eq!(
            rewrite_target(Path::new("/work/8/cs/libs/foo/.install/lib/libfoo.so.2"), base),
            "/lib/libfoo.so.2"
        );
        // Relative links resolve next to the link itself
        assert_eq!(rewrite_target(Path::new("libfoo.so.2.1"), base), "libfoo.so.2.1");
        // System paths pass through
        assert_eq!(
            rewrite_target(Path::new("/usr/lib/libc.so"), base),
            "/usr/lib/libc.so"
        );
    }

    #[test]
    fn output_roots_follow_repository_kind() {
        assert_eq!(output_root(repository::Kind::CPlusPlus), "bin");
        assert_eq!(output_root(repository::Kind::Python), "bin");
        assert_eq!(output_root(repository::Kind::ShellScript), "bin");
        assert_eq!(output_root(repository::Kind::Configuration), "etc");
        assert_eq!(output_root(repository::Kind::Library), ".install");
    }
}
