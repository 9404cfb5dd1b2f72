// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Read the chartcache config file.
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::archive::ExtractLimit;
use crate::transport::TransportOptions;

/// Environment variable supplying the default project.
pub const PROJECT_ENV: &str = "CHARTCACHE_PROJECT";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SizeError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity {0}")]
    InvalidNumber(String),
    #[error("unknown suffix {1:?} in quantity {0}")]
    UnknownSuffix(String, String),
    #[error("quantity {0} does not fit in 64 bits")]
    Overflow(String),
}

/// A byte count written as a Kubernetes style quantity, e.g. `10M` or `512Ki`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct ByteSize(pub u64);

const SUFFIXES: &[(&str, u64)] = &[
    ("", 1),
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

impl ByteSize {
    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SizeError::Empty);
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let multiplier = SUFFIXES
            .iter()
            .find(|(name, _)| *name == suffix)
            .map(|(_, multiplier)| *multiplier)
            .ok_or_else(|| SizeError::UnknownSuffix(s.to_string(), suffix.to_string()))?;

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(SizeError::InvalidNumber(s.to_string()));
        }

        let whole = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u64>()
                .map_err(|_| SizeError::Overflow(s.to_string()))?
        };
        if !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(SizeError::InvalidNumber(s.to_string()));
        }
        // Anything past 18 digits is below one byte for every suffix.
        let fraction = &fraction[..fraction.len().min(18)];
        let partial = if fraction.is_empty() {
            0
        } else {
            let numerator = u128::from(
                fraction
                    .parse::<u64>()
                    .map_err(|_| SizeError::InvalidNumber(s.to_string()))?,
            );
            let denominator = 10u128.pow(u32::try_from(fraction.len()).unwrap_or(18));
            numerator * u128::from(multiplier) / denominator
        };

        u128::from(whole)
            .checked_mul(u128::from(multiplier))
            .map(|bytes| bytes + partial)
            .and_then(|bytes| u64::try_from(bytes).ok())
            .map(Self)
            .ok_or_else(|| SizeError::Overflow(s.to_string()))
    }
}

impl TryFrom<String> for ByteSize {
    type Error = SizeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Display for ByteSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The config file.
///
/// Every field is optional. Command line flags override it.
#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub project: String,
    /// Byte budget for one chart extraction. `0` means unbounded.
    pub max_extract_size: ByteSize,
    pub disable_max_extract_size: bool,
    /// Byte ceiling for downloaded repository indexes.
    pub max_index_size: ByteSize,
    pub proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub timeout_seconds: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("chartcache"),
            project: std::env::var(PROJECT_ENV).unwrap_or_default(),
            max_extract_size: ByteSize(10_000_000),
            disable_max_extract_size: false,
            max_index_size: ByteSize(1_000_000_000),
            proxy: None,
            no_proxy: None,
            timeout_seconds: None,
        }
    }
}

impl Config {
    /// Load the config file.
    pub fn load(path: &Path) -> Result<Self> {
        let file: String = std::fs::read_to_string(path)
            .with_context(|| format!("Reading file {}", path.display()))?;
        let config: Self = serde_yml::from_str(&file)
            .with_context(|| format!("Parsing file {}", path.display()))?;

        Ok(config)
    }

    pub const fn extract_limit(&self) -> ExtractLimit {
        ExtractLimit::new(self.max_extract_size.0, self.disable_max_extract_size)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            proxy: self.proxy.clone(),
            no_proxy: self.no_proxy.clone(),
            timeout: self.timeout_seconds.map(Duration::from_secs),
        }
    }
}
