// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Schemas derived from explicit sources or from a chart's contents.

use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, warn};

use super::{Error, SchemaReader, infer};
use crate::archive::{self, ExtractLimit};
use crate::repos::Repository;

const SCHEMA_FILE: &str = "values.schema.json";
const VALUES_FILE: &str = "values.yaml";

/// Where a chart's values schema comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeneratorKind {
    /// No schema at all.
    None,
    /// The chart's own schema, else one inferred from its values.
    #[default]
    Auto,
    /// Always infer from the chart's default values.
    ValueInference,
    /// An explicit `http(s)` URL.
    Url,
    /// An explicit file on disk.
    LocalPath,
    /// A named file inside the chart.
    ChartPath,
}

impl GeneratorKind {
    const ALL: [Self; 6] = [
        Self::None,
        Self::Auto,
        Self::ValueInference,
        Self::Url,
        Self::LocalPath,
        Self::ChartPath,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Auto => "auto",
            Self::ValueInference => "value-inference",
            Self::Url => "url",
            Self::LocalPath => "local-path",
            Self::ChartPath => "chart-path",
        }
    }

    const fn needs_chart(self) -> bool {
        matches!(self, Self::Auto | Self::ValueInference | Self::ChartPath)
    }
}

impl Display for GeneratorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeneratorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Self::ALL.iter().map(|kind| kind.as_str()).collect();
                format!("unknown generator {s:?}, expected one of {}", names.join(", "))
            })
    }
}

/// The chart a derived schema is read from.
pub struct ChartSource<'a> {
    pub repo: &'a Repository,
    pub chart: &'a str,
    pub version: &'a str,
    pub project: &'a str,
    pub pass_credentials: bool,
    pub limit: ExtractLimit,
}

/// Produce the schema selected by `kind`.
///
/// `paths` are the explicit sources for `url` and `local-path`. For the chart
/// based generators the first path names a file inside the chart. Returns
/// `None` for [`GeneratorKind::None`].
pub async fn generate(
    reader: &SchemaReader,
    kind: GeneratorKind,
    paths: &[&str],
    source: Option<&ChartSource<'_>>,
) -> Result<Option<Vec<u8>>, Error> {
    if kind == GeneratorKind::None {
        return Ok(None);
    }
    if !kind.needs_chart() {
        if paths.is_empty() {
            return Err(Error::MissingPath(kind));
        }
        return reader.from_paths(paths).await.map(Some);
    }

    let path = paths.first().copied();
    if kind == GeneratorKind::ChartPath && path.is_none() {
        return Err(Error::MissingPath(kind));
    }
    let source = source.ok_or(Error::MissingChart(kind))?;

    let chart = source
        .repo
        .extract_chart(
            source.chart,
            source.version,
            source.project,
            source.pass_credentials,
            source.limit,
        )
        .await?;
    let schema = from_chart_dir(reader, kind, path, chart.path()).await;
    if let Err(e) = chart.close() {
        warn!(chart = source.chart, error = %e, "failed to remove extracted chart");
    }
    schema.map(Some)
}

/// Read the schema for an unpacked chart directory.
pub async fn from_chart_dir(
    reader: &SchemaReader,
    kind: GeneratorKind,
    path: Option<&str>,
    dir: &Path,
) -> Result<Vec<u8>, Error> {
    if let Some(path) = path {
        let relative =
            archive::sanitize(Path::new(path)).map_err(|_| Error::OutsideChart(path.to_string()))?;
        return reader.from_file(&dir.join(relative)).await;
    }

    let schema_file = dir.join(SCHEMA_FILE);
    match kind {
        GeneratorKind::Auto if schema_file.is_file() => reader.from_file(&schema_file).await,
        GeneratorKind::Auto | GeneratorKind::ValueInference => {
            debug!(dir = %dir.display(), "inferring schema from values");
            let inferred = infer::from_values_file(&dir.join(VALUES_FILE))?;
            reader.from_value(serde_json::to_value(inferred)?, None)
        }
        kind => Err(Error::MissingPath(kind)),
    }
}
