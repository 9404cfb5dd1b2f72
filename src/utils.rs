// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilenameError {
    #[error("Unicode error in {0}")]
    Unicode(String),
    #[error("Illegal filename {0}")]
    IllegalFilename(String),
}

/// The final component of `path` as UTF-8.
pub fn filename_to_string(path: &Path) -> Result<String, FilenameError> {
    path.file_name()
        .ok_or_else(|| FilenameError::IllegalFilename(path.to_string_lossy().to_string()))?
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| FilenameError::Unicode(path.to_string_lossy().to_string()))
}
