// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Content addressed file store
//!
//! Blobs are keyed by their SHA-256 hex digest and laid out with a two
//! level directory fan-out, `<root>/aa/bb/aabb…`. Ingestion is idempotent
//! and publishes via temp file + fsync + rename so readers never observe
//! a partially written blob. The store root must live on a single
//! filesystem.

use std::{
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use fs_err as fs;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hex digest length of SHA-256
const DIGEST_LEN: usize = 64;

/// Buffer size used when hashing and copying
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (and if needed create) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();

        fs::create_dir_all(&root)?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob for `digest`
    pub fn path_of(&self, digest: &str) -> Result<PathBuf, Error> {
        if digest.len() != DIGEST_LEN || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::MalformedDigest(digest.to_owned()));
        }

        Ok(self
            .root
            .join(&digest[..2])
            .join(&digest[2..4])
            .join(digest))
    }

    /// Ingest the regular file at `source`, returning its hex digest.
    ///
    /// Repeated ingestions of identical content are no-ops. Two
    /// concurrent ingestions of the same content are safe; exactly one
    /// publishes, the other observes the published blob.
    pub async fn ingest(&self, source: impl Into<PathBuf>) -> Result<String, Error> {
        let this = self.clone();
        let source = source.into();

        tokio::task::spawn_blocking(move || this.ingest_sync(&source))
            .await
            .expect("join blocking ingest")
    }

    /// Open the blob for `digest` as an async reader
    pub async fn fetch(&self, digest: &str) -> Result<tokio::fs::File, Error> {
        let path = self.path_of(digest)?;

        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(digest.to_owned()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Is a blob for `digest` present?
    pub async fn has(&self, digest: &str) -> Result<bool, Error> {
        let path = self.path_of(digest)?;

        Ok(tokio::fs::try_exists(&path).await?)
    }

    fn ingest_sync(&self, source: &Path) -> Result<String, Error> {
        let metadata = fs::symlink_metadata(source)?;

        if !metadata.is_file() {
            return Err(Error::IrregularFile(source.to_path_buf()));
        }

        let mut input = fs::File::open(source)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let read = input.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        let digest = hex::encode(hasher.finalize());
        let target = self.path_of(&digest)?;

        if target.exists() {
            return Ok(digest);
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        // Temp file lives in the store root so the rename never
        // crosses a filesystem boundary
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;

        io::Seek::rewind(&mut input)?;
        copy_chunked(&mut input, temp.as_file_mut())?;

        temp.as_file().set_permissions(metadata.permissions())?;
        temp.as_file().sync_all()?;

        match temp.persist_noclobber(&target) {
            Ok(_) => {}
            // A concurrent ingestion published first; contents are
            // identical by construction
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => return Ok(digest),
            Err(e) => return Err(Error::Io(e.error)),
        }

        if let Some(parent) = target.parent() {
            fs::File::open(parent)?.sync_all()?;
        }

        Ok(digest)
    }
}

fn copy_chunked(input: &mut impl Read, output: &mut impl Write) -> io::Result<()> {
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        output.write_all(&buffer[..read])?;
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed digest: {0}")]
    MalformedDigest(String),
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("not a regular file: {0:?}")]
    IrregularFile(PathBuf),
    #[error("io")]
    Io(#[from] io::Error),
}
