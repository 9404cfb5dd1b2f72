// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Filesystem cache addressed by a reversible key encoding.
//!
//! There is no in-memory index: a cache key is encoded into a relative path,
//! and paths decode back into keys. The directory listing is therefore the
//! whole state of the cache, and it survives process restarts.
//!
//! A key is hex encoded and cut into chunks of [`CHUNK`] characters. Every
//! chunk but the last becomes a directory named `d<chunk>`, the last one the
//! entry itself, named `k<chunk>`. No path component exceeds 200 bytes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::warn;

use crate::utils::filename_to_string;

const CHUNK: usize = 198;
const DIR_PREFIX: char = 'd';
const ENTRY_PREFIX: char = 'k';

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

#[derive(Debug)]
pub struct PathCache {
    root: PathBuf,
    scratch: PathBuf,
}

impl PathCache {
    /// Open (and create) a cache below `path`.
    ///
    /// Entries live in `path/charts`; scratch space lives in `path/tmp` so
    /// that moving a finished download into place is a same-filesystem rename.
    pub fn new(path: &Path) -> Result<Self, Error> {
        let root = path.join("charts");
        let scratch = path.join("tmp");
        create_private_dir(&root)?;
        create_private_dir(&scratch)?;
        Ok(Self { root, scratch })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path for `key`. Pure; performs no I/O.
    pub fn get_path(&self, key: &str) -> PathBuf {
        self.root.join(encode_key(key))
    }

    /// The path for `key` if something currently exists there.
    pub fn get_path_if_exists(&self, key: &str) -> Option<PathBuf> {
        let path = self.get_path(key);
        path.exists().then_some(path)
    }

    /// Create the directories above the entry for `key` and return its path.
    pub fn prepare_path(&self, key: &str) -> Result<PathBuf, Error> {
        let path = self.get_path(key);
        if let Some(parent) = path.parent()
            && parent != self.root
        {
            create_private_dir(parent)?;
        }
        Ok(path)
    }

    /// Rebuild the key to path mapping from the directory listing.
    pub fn list_paths(&self) -> Result<BTreeMap<String, PathBuf>, Error> {
        let mut paths = BTreeMap::new();
        self.collect_paths(&self.root, &mut paths)?;
        Ok(paths)
    }

    fn collect_paths(&self, dir: &Path, paths: &mut BTreeMap<String, PathBuf>) -> Result<(), Error> {
        let entries = std::fs::read_dir(dir).map_err(|e| Error::Io(dir.to_path_buf(), e))?;

        for entry in entries {
            let entry = entry.map_err(|e| Error::Io(dir.to_path_buf(), e))?;
            let path = entry.path();
            let Ok(name) = filename_to_string(&path) else {
                warn!(path = %path.display(), "skipping cache entry with non UTF-8 name");
                continue;
            };

            if name.starts_with(DIR_PREFIX) && entry.file_type().is_ok_and(|t| t.is_dir()) {
                self.collect_paths(&path, paths)?;
                continue;
            }

            let key = path
                .strip_prefix(&self.root)
                .ok()
                .and_then(decode_key);
            match key {
                Some(key) => {
                    paths.insert(key, path);
                }
                None => warn!(path = %path.display(), "skipping foreign cache entry"),
            }
        }

        Ok(())
    }

    /// A fresh scratch directory, removed when the returned handle is dropped.
    pub fn scratch_dir(&self, prefix: &str) -> Result<TempDir, Error> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.scratch)
            .map_err(|e| Error::Io(self.scratch.clone(), e))
    }
}

fn create_private_dir(path: &Path) -> Result<(), Error> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .map_err(|e| Error::Io(path.to_path_buf(), e))
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn decode_hex(encoded: &str) -> Option<String> {
    if !is_hex(encoded) {
        return None;
    }
    let bytes = hex::decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

/// The relative path for `key`.
///
/// Lowercase hex: no separators, and no two keys differ only by case.
pub fn encode_key(key: &str) -> PathBuf {
    let encoded = hex::encode(key.as_bytes());
    let last = encoded.len().saturating_sub(1) / CHUNK * CHUNK;

    let mut path: PathBuf = (0..last)
        .step_by(CHUNK)
        .map(|start| format!("{DIR_PREFIX}{}", &encoded[start..start + CHUNK]))
        .collect();
    path.push(format!("{ENTRY_PREFIX}{}", &encoded[last..]));
    path
}

/// The key for a path relative to the cache root.
pub fn decode_key(path: &Path) -> Option<String> {
    let names: Vec<&str> = path
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    let (last, dirs) = names.split_last()?;

    let mut encoded = String::new();
    for dir in dirs {
        let chunk = dir.strip_prefix(DIR_PREFIX)?;
        if chunk.len() != CHUNK {
            return None;
        }
        encoded.push_str(chunk);
    }
    let chunk = last.strip_prefix(ENTRY_PREFIX)?;
    if chunk.len() > CHUNK || (!dirs.is_empty() && chunk.is_empty()) {
        return None;
    }
    encoded.push_str(chunk);
    decode_hex(&encoded)
}
