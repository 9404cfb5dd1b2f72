// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha256::TrySha256Digest;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot hash {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("Digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: PathBuf,
        expected: Sha256Hash,
        actual: Sha256Hash,
    },
}

/// A lowercase hex sha256 digest, without any `sha256:` prefix.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
#[serde(from = "String")]
pub struct Sha256Hash(String);

impl From<String> for Sha256Hash {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl Sha256Hash {
    pub fn new(s: &str) -> Self {
        let s = s.trim();
        let s = s.strip_prefix("sha256:").unwrap_or(s);
        Self(s.to_ascii_lowercase())
    }

    pub async fn from_async_path(path: &Path) -> Result<Self, Error> {
        let hash = path
            .async_digest()
            .await
            .map_err(|e| Error::Io(path.to_path_buf(), e))?;
        Ok(Self::new(&hash))
    }

    /// Hash the file at `path` and compare.
    pub async fn verify(&self, path: &Path) -> Result<(), Error> {
        let actual = Self::from_async_path(path).await?;
        if actual == *self {
            Ok(())
        } else {
            Err(Error::DigestMismatch {
                path: path.to_path_buf(),
                expected: self.clone(),
                actual,
            })
        }
    }
}

impl std::fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
