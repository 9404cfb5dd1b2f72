// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Read schemas from files and URLs and normalize them.

use std::path::Path;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use super::{Error, Schema, refs};
use crate::transport::{self, Credentials, TransportOptions};

/// Turns schema sources into one normalized JSON document.
#[derive(Clone, Debug, Default)]
pub struct SchemaReader {
    options: TransportOptions,
}

impl SchemaReader {
    pub const fn new(options: TransportOptions) -> Self {
        Self { options }
    }

    /// Read the first of `paths` that yields a valid schema.
    ///
    /// A single path fails with its own error. With several paths the error
    /// lists every failure.
    pub async fn from_paths(&self, paths: &[&str]) -> Result<Vec<u8>, Error> {
        match paths {
            [] => Err(Error::NoPaths),
            [path] => self.from_path(path).await,
            paths => {
                let mut failures = Vec::new();
                for path in paths {
                    match self.from_path(path).await {
                        Ok(schema) => return Ok(schema),
                        Err(err) => {
                            debug!(path, error = %err, "skipping schema source");
                            failures.push(((*path).to_string(), err));
                        }
                    }
                }
                Err(Error::NoValidSource(failures))
            }
        }
    }

    /// Read a schema from an `http(s)` URL or a file path.
    pub async fn from_path(&self, path: &str) -> Result<Vec<u8>, Error> {
        match Url::parse(path) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => self.from_url(&url).await,
            Ok(url) => Err(Error::UnsupportedScheme(url.scheme().to_string())),
            Err(url::ParseError::RelativeUrlWithoutBase) => self.from_file(Path::new(path)).await,
            Err(e) => Err(Error::InvalidPath(path.to_string(), e)),
        }
    }

    /// Read a schema file. Relative `$ref`s resolve against its directory.
    pub async fn from_file(&self, path: &Path) -> Result<Vec<u8>, Error> {
        let path = std::path::absolute(path).map_err(|e| Error::Io(path.to_path_buf(), e))?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Io(path.clone(), e))?;
        self.from_data(&data, path.parent())
    }

    /// Download a schema. Only pointers into the document itself resolve.
    pub async fn from_url(&self, url: &Url) -> Result<Vec<u8>, Error> {
        let start = Instant::now();
        let client = transport::build_http_client(&Credentials::default(), &self.options)?;
        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| transport::Error::from_request(url, e))?;
        let data = transport::check_status(response)?
            .bytes()
            .await
            .map_err(|e| transport::Error::from_request(url, e))?;
        info!(
            url = %url,
            seconds = start.elapsed().as_secs_f64(),
            "downloaded schema"
        );
        self.from_data(&data, None)
    }

    /// Normalize a YAML or JSON schema document.
    ///
    /// The document is checked, its `$id` dropped and every `$ref` inlined.
    /// A schema without properties is rejected.
    #[allow(clippy::unused_self)]
    pub fn from_data(&self, data: &[u8], base: Option<&Path>) -> Result<Vec<u8>, Error> {
        let value: Value = serde_yml::from_slice(data).map_err(Error::Yaml)?;
        self.from_value(value, base)
    }

    #[allow(clippy::unused_self)]
    pub(crate) fn from_value(&self, value: Value, base: Option<&Path>) -> Result<Vec<u8>, Error> {
        let mut schema: Schema = serde_json::from_value(value.clone())?;
        schema.validate()?;
        schema.id = None;
        refs::resolve(&mut schema, &value, base)?;

        let mut normalized = Schema::default();
        normalized.merge(&schema);
        normalized.validate()?;
        if normalized.properties.is_empty() {
            return Err(Error::EmptySchema);
        }

        Ok(serde_json::to_vec_pretty(&normalized)?)
    }
}
