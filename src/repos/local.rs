// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Charts that already exist as directories on disk.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot resolve {0}: {1}")]
    Absolute(PathBuf, std::io::Error),
    #[error("chart directory does not exist: {0}")]
    ChartDirNotFound(PathBuf),
}

/// The directory of `chart` below `repo_dir`.
///
/// Local charts are used in place. They are never locked, cached or copied.
pub fn chart_dir(repo_dir: &Path, chart: &str) -> Result<PathBuf, Error> {
    let repo_dir =
        std::path::absolute(repo_dir).map_err(|e| Error::Absolute(repo_dir.to_path_buf(), e))?;
    let path = repo_dir.join(chart);

    // Only a real directory counts, not a symlink to one.
    match std::fs::symlink_metadata(&path) {
        Ok(metadata) if metadata.is_dir() => Ok(path),
        _ => Err(Error::ChartDirNotFound(path)),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_chart_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("mychart")).unwrap();
        std::fs::write(dir.path().join("notachart"), b"").unwrap();

        assert_eq!(
            chart_dir(dir.path(), "mychart").unwrap(),
            dir.path().join("mychart")
        );
        assert!(matches!(
            chart_dir(dir.path(), "notachart"),
            Err(Error::ChartDirNotFound(_))
        ));
        assert!(matches!(
            chart_dir(dir.path(), "missing"),
            Err(Error::ChartDirNotFound(_))
        ));
    }
}
