// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Index based HTTP chart repositories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use super::Remote;
use super::hash::{self, Sha256Hash};
use crate::transport::{self, Credentials, TransportOptions};
use crate::urls::{self, append_url, resolve_chart_url, same_origin};
use crate::versions::{self, Constraint, Version};

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Transport(#[from] transport::Error),
    #[error("{0}")]
    Url(#[from] urls::Error),
    #[error("Failed to parse index {0}: {1}")]
    Parse(Url, serde_yml::Error),
    #[error("chart not found in index: {0}")]
    ChartNotFound(String),
    #[error("Chart {0} has no version matching {1}")]
    VersionNotFound(String, String),
    #[error("Chart {0} version {1} has no download URLs")]
    NoUrls(String, String),
    #[error("{0}")]
    Version(#[from] versions::Error),
    #[error("File error {0}: {1}")]
    File(PathBuf, std::io::Error),
    #[error("{0}")]
    Digest(#[from] hash::Error),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub version: String,
    pub created: Option<chrono::DateTime<chrono::FixedOffset>>,
    #[serde(default)]
    pub urls: Vec<String>,
    pub digest: Option<Sha256Hash>,
}

/// All published versions of one chart.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct Entries(Vec<Entry>);

impl<'a> IntoIterator for &'a Entries {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Entries {
    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.0.iter()
    }

    pub fn max_version(&self, constraint: &Constraint) -> Result<Version, versions::Error> {
        versions::max_version(self.0.iter().map(|e| e.version.as_str()), constraint)
    }

    /// The entry for `version`, which is either an exact version string or a
    /// constraint resolved to its highest match.
    pub fn find(&self, chart: &str, version: &str) -> Result<&Entry, Error> {
        if let Some(entry) = self.0.iter().find(|e| e.version == version) {
            return Ok(entry);
        }

        let constraint = Constraint::parse(version)?;
        let wanted = self.max_version(&constraint)?;
        self.0
            .iter()
            .find(|e| versions::parse_version(&e.version).is_ok_and(|v| v == wanted))
            .ok_or_else(|| Error::VersionNotFound(chart.to_string(), version.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub api_version: Option<String>,
    #[serde(default)]
    pub entries: HashMap<String, Entries>,
    pub generated: Option<chrono::DateTime<chrono::FixedOffset>>,
}

impl Index {
    pub fn entries(&self, chart: &str) -> Result<&Entries, Error> {
        self.entries
            .get(chart)
            .ok_or_else(|| Error::ChartNotFound(chart.to_string()))
    }
}

/// Fetch and parse `<repo>/index.yaml`, reading at most `max_size` bytes.
pub async fn download_index(
    repo: &Url,
    creds: &Credentials,
    options: &TransportOptions,
    max_size: u64,
) -> Result<Index, Error> {
    let url = append_url(repo, "index.yaml")?;
    let client = transport::build_http_client(creds, options)?;

    let start = Instant::now();
    let response = transport::apply_basic_auth(client.get(url.clone()), creds)
        .send()
        .await
        .map_err(|e| transport::Error::from_request(&url, e))?;
    let response = transport::check_status(response)?;
    let body = transport::read_limited(response, max_size).await?;
    let index = serde_yml::from_slice(&body).map_err(|e| Error::Parse(url.clone(), e))?;

    info!(
        repo = %repo,
        bytes = body.len(),
        seconds = start.elapsed().as_secs_f64(),
        "downloaded index"
    );
    Ok(index)
}

/// Downloads charts listed in an HTTP repository index.
pub struct HttpRemote {
    url: Url,
    creds: Credentials,
    options: TransportOptions,
    max_index_size: u64,
}

impl HttpRemote {
    pub const fn new(
        url: Url,
        creds: Credentials,
        options: TransportOptions,
        max_index_size: u64,
    ) -> Self {
        Self {
            url,
            creds,
            options,
            max_index_size,
        }
    }

    async fn download(
        &self,
        chart_url: &Url,
        dest: &Path,
        pass_credentials: bool,
    ) -> Result<(), Error> {
        let client = transport::build_http_client(&self.creds, &self.options)?;
        let mut request = client.get(chart_url.clone());
        if pass_credentials || same_origin(&self.url, chart_url) {
            request = transport::apply_basic_auth(request, &self.creds);
        } else {
            debug!(url = %chart_url, "not forwarding credentials to foreign host");
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport::Error::from_request(chart_url, e))?;
        let response = transport::check_status(response)?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| Error::File(dest.to_path_buf(), e))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport::Error::from_request(chart_url, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::File(dest.to_path_buf(), e))?;
        }
        file.flush()
            .await
            .map_err(|e| Error::File(dest.to_path_buf(), e))?;

        Ok(())
    }
}

fn archive_name(chart_url: &Url, chart: &str, version: &str) -> String {
    chart_url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map_or_else(|| format!("{chart}-{version}.tgz"), str::to_string)
}

#[async_trait]
impl Remote for HttpRemote {
    async fn fetch(
        &self,
        chart: &str,
        version: &str,
        dest: &Path,
        pass_credentials: bool,
    ) -> Result<(), super::RemoteError> {
        let index =
            download_index(&self.url, &self.creds, &self.options, self.max_index_size).await?;
        let entry = index.entries(chart)?.find(chart, version)?;
        let first = entry
            .urls
            .first()
            .ok_or_else(|| Error::NoUrls(chart.to_string(), entry.version.clone()))?;
        let chart_url = resolve_chart_url(&self.url, first).map_err(Error::from)?;

        let path = dest.join(archive_name(&chart_url, chart, &entry.version));
        self.download(&chart_url, &path, pass_credentials).await?;

        if let Some(digest) = &entry.digest {
            digest.verify(&path).await.map_err(Error::from)?;
        }

        Ok(())
    }
}
