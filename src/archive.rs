// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Extract untrusted chart archives.
//!
//! Archives are gzip compressed tar streams. Entry paths must stay below the
//! destination, links are refused, and the total number of file bytes written
//! can be bounded.

use std::path::{Component, Path, PathBuf};

use async_compression::futures::bufread::GzipDecoder;
use async_tar::Archive;
use futures::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use futures::StreamExt;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("Corrupt archive {0}: {1}")]
    Corrupt(PathBuf, std::io::Error),
    #[error("Archive entry {0} escapes the destination directory")]
    PathTraversal(PathBuf),
    #[error("Archive entry {0} has unsupported type {1}")]
    UnsupportedEntry(PathBuf, String),
    #[error("Archive expands beyond the limit of {0} bytes")]
    SizeLimitExceeded(u64),
}

/// Upper bound on the bytes written by one extraction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExtractLimit {
    Bounded(u64),
    Unbounded,
}

impl ExtractLimit {
    /// A zero budget, or an explicitly disabled one, means unbounded.
    pub const fn new(max: u64, disabled: bool) -> Self {
        if disabled || max == 0 {
            Self::Unbounded
        } else {
            Self::Bounded(max)
        }
    }
}

/// Turn an archive entry path into a path relative to the destination.
pub fn sanitize(path: &Path) -> Result<PathBuf, Error> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal(path.to_path_buf()));
            }
        }
    }
    Ok(clean)
}

async fn create_dir_all(path: &Path) -> Result<(), Error> {
    async_std::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::Io(path.to_path_buf(), e))
}

/// Unpack the gzip tar at `archive` into `dest`.
///
/// Returns the number of file bytes written. On error, whatever was already
/// written is left behind for the caller to discard.
pub async fn extract(archive: &Path, dest: &Path, limit: ExtractLimit) -> Result<u64, Error> {
    let file = async_std::fs::File::open(archive)
        .await
        .map_err(|e| Error::Io(archive.to_path_buf(), e))?;
    let decoder = GzipDecoder::new(BufReader::new(file));
    let mut entries = Archive::new(decoder)
        .entries()
        .map_err(|e| Error::Corrupt(archive.to_path_buf(), e))?;

    create_dir_all(dest).await?;

    let mut total: u64 = 0;
    let mut buf = vec![0u8; 64 * 1024];

    while let Some(entry) = entries.next().await {
        let mut entry = entry.map_err(|e| Error::Corrupt(archive.to_path_buf(), e))?;
        let raw: PathBuf = entry
            .path()
            .map_err(|e| Error::Corrupt(archive.to_path_buf(), e))?
            .to_path_buf()
            .into();
        let relative = sanitize(&raw)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&relative);
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            create_dir_all(&target).await?;
        } else if entry_type.is_file() {
            if let Some(parent) = target.parent() {
                create_dir_all(parent).await?;
            }
            let mut out = async_std::fs::File::create(&target)
                .await
                .map_err(|e| Error::Io(target.clone(), e))?;
            loop {
                let n = entry
                    .read(&mut buf)
                    .await
                    .map_err(|e| Error::Corrupt(archive.to_path_buf(), e))?;
                if n == 0 {
                    break;
                }
                total += n as u64;
                if let ExtractLimit::Bounded(max) = limit
                    && total > max
                {
                    return Err(Error::SizeLimitExceeded(max));
                }
                out.write_all(&buf[..n])
                    .await
                    .map_err(|e| Error::Io(target.clone(), e))?;
            }
            out.flush().await.map_err(|e| Error::Io(target.clone(), e))?;
        } else if entry_type.is_symlink() || entry_type.is_hard_link() {
            return Err(Error::UnsupportedEntry(raw, format!("{entry_type:?}")));
        } else {
            debug!(path = %raw.display(), entry_type = ?entry_type, "skipping archive entry");
        }
    }

    Ok(total)
}

/// The directory name a chart archive unpacks to.
///
/// Registry charts are named like `path/to/chart`; archives only carry the
/// last segment.
pub fn normalize_chart_name(chart: &str) -> &str {
    match chart.rsplit('/').next() {
        Some("" | "." | "..") | None => chart,
        Some(last) => last,
    }
}
