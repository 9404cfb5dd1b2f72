// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Fetch charts from repositories into the shared cache.
//!
//! A pull is single flight per cache entry: callers asking for the same
//! identity serialize on the entry's path, and only the first one reaches the
//! network. Downloads land in a scratch directory and are renamed into place,
//! so the cache never exposes partial files.

pub mod cache;
pub mod hash;
pub mod helm;
pub mod local;
pub mod oci;

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::archive::{self, ExtractLimit, normalize_chart_name};
use crate::keylock::KeyLock;
use crate::transport::{Credentials, TransportOptions};
use cache::PathCache;

/// Default ceiling for a downloaded `index.yaml`.
pub const DEFAULT_MAX_INDEX_SIZE: u64 = 1_000_000_000;

/// Failure of the remote half of a pull.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("{0}")]
    Helm(#[from] helm::Error),
    #[error("{0}")]
    Oci(#[from] oci::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid repository URL {0}: {1}")]
    InvalidRepoUrl(String, url::ParseError),
    #[error("Unsupported repository URL scheme {0}")]
    UnsupportedScheme(String),
    #[error("Cache error: {0}")]
    Cache(#[from] cache::Error),
    #[error("Local repo error: {0}")]
    Local(#[from] local::Error),
    #[error("Error retrieving chart {0}: {1}")]
    Fetch(ChartIdentity, RemoteError),
    #[error("Retrieving chart {0} did not finish within {1:?}")]
    DeadlineExceeded(ChartIdentity, Duration),
    #[error("Expected exactly one file retrieving chart {0}, found {1}")]
    UnexpectedFileCount(ChartIdentity, usize),
    #[error("Cannot list downloaded files in {0}: {1}")]
    Listing(PathBuf, std::io::Error),
    #[error("Cannot place chart {0} at {1}: {2}")]
    Place(ChartIdentity, PathBuf, std::io::Error),
    #[error("Cannot extract chart {0}: {1}")]
    Extract(ChartIdentity, archive::Error),
    #[error("Cannot remove cached chart {0}: {1}")]
    Clean(PathBuf, std::io::Error),
    #[error("OCI is not enabled for repository {0}")]
    OciNotEnabled(String),
    #[error("Repository {0} has no index")]
    NoIndex(String),
    #[error("Index error for repository {0}: {1}")]
    Index(String, helm::Error),
    #[error("Registry error for {0}: {1}")]
    Registry(String, oci::Error),
}

/// What a cache entry is keyed on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChartIdentity {
    pub repo_url: String,
    pub chart: String,
    pub version: String,
    /// Access scope; the same chart pulled for different projects is cached
    /// separately.
    pub project: String,
}

impl ChartIdentity {
    pub fn new(repo_url: &str, chart: &str, version: &str, project: &str) -> Self {
        Self {
            repo_url: repo_url.to_string(),
            chart: chart.to_string(),
            version: version.to_string(),
            project: project.to_string(),
        }
    }

    /// Compact JSON with sorted keys.
    pub fn cache_key(&self) -> String {
        serde_json::json!({
            "chart": self.chart,
            "project": self.project,
            "url": self.repo_url,
            "version": self.version,
        })
        .to_string()
    }

    /// Recover the identity a cache key was built from.
    pub fn from_cache_key(key: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(key).ok()?;
        let field = |name: &str| value.get(name)?.as_str().map(str::to_string);
        Some(Self {
            repo_url: field("url")?,
            chart: field("chart")?,
            version: field("version")?,
            project: field("project")?,
        })
    }
}

impl Display for ChartIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} from {}", self.chart, self.version, self.repo_url)?;
        if !self.project.is_empty() {
            write!(f, " (project {})", self.project)?;
        }
        Ok(())
    }
}

/// The transport a repository URL selects.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RepoKind {
    /// A directory on disk, given as a plain path or a `file://` URL.
    Local(PathBuf),
    Http(Url),
    Oci(Url),
}

impl RepoKind {
    pub fn classify(repo_url: &str) -> Result<Self, Error> {
        match Url::parse(repo_url) {
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok(Self::Local(PathBuf::from(repo_url)))
            }
            Err(e) => Err(Error::InvalidRepoUrl(repo_url.to_string(), e)),
            Ok(url) => match url.scheme() {
                "file" => Ok(Self::Local(PathBuf::from(url.path()))),
                "oci" => Ok(Self::Oci(url)),
                "http" | "https" => Ok(Self::Http(url)),
                scheme => Err(Error::UnsupportedScheme(scheme.to_string())),
            },
        }
    }
}

/// The network half of a pull.
///
/// Implementations leave exactly one file in `dest`.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn fetch(
        &self,
        chart: &str,
        version: &str,
        dest: &Path,
        pass_credentials: bool,
    ) -> Result<(), RemoteError>;
}

/// An extracted chart.
///
/// The extraction directory is removed by [`ExtractedChart::close`], or on
/// drop. Local charts are used in place and are never removed.
#[derive(Debug)]
pub struct ExtractedChart {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl ExtractedChart {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the extraction directory on disk and return the chart path.
    pub fn keep(self) -> PathBuf {
        if let Some(dir) = self.dir {
            let _ = dir.keep();
        }
        self.path
    }

    pub fn close(self) -> Result<(), Error> {
        match self.dir {
            Some(dir) => {
                let path = dir.path().to_path_buf();
                dir.close()
                    .map_err(|e| Error::Cache(cache::Error::Io(path, e)))
            }
            None => Ok(()),
        }
    }
}

/// One chart repository.
pub struct Repository {
    repo_url: String,
    kind: RepoKind,
    creds: Credentials,
    options: TransportOptions,
    max_index_size: u64,
    deadline: Option<Duration>,
    cache: Arc<PathCache>,
    chart_locks: Arc<KeyLock>,
    index_locks: Arc<KeyLock>,
    remote: Option<Arc<dyn Remote>>,
}

impl Repository {
    /// A repository using the process wide lock registries.
    ///
    /// The fetch deadline defaults to the transport timeout.
    pub fn new(
        repo_url: &str,
        creds: Credentials,
        options: TransportOptions,
        cache: Arc<PathCache>,
    ) -> Result<Self, Error> {
        let kind = RepoKind::classify(repo_url)?;
        Ok(Self {
            repo_url: repo_url.to_string(),
            kind,
            creds,
            deadline: options.timeout,
            options,
            max_index_size: DEFAULT_MAX_INDEX_SIZE,
            cache,
            chart_locks: KeyLock::global_chart_locks(),
            index_locks: KeyLock::global_index_locks(),
            remote: None,
        })
    }

    #[must_use]
    pub fn with_locks(mut self, chart_locks: Arc<KeyLock>, index_locks: Arc<KeyLock>) -> Self {
        self.chart_locks = chart_locks;
        self.index_locks = index_locks;
        self
    }

    /// Ceiling used for the index lookup an HTTP pull performs.
    #[must_use]
    pub fn with_max_index_size(mut self, max_index_size: u64) -> Self {
        self.max_index_size = max_index_size;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_remote(mut self, remote: Arc<dyn Remote>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub const fn kind(&self) -> &RepoKind {
        &self.kind
    }

    pub fn identity(&self, chart: &str, version: &str, project: &str) -> ChartIdentity {
        ChartIdentity::new(&self.repo_url, chart, version, project)
    }

    fn remote(&self) -> Result<Arc<dyn Remote>, Error> {
        if let Some(remote) = &self.remote {
            return Ok(remote.clone());
        }
        match &self.kind {
            RepoKind::Http(url) => Ok(Arc::new(helm::HttpRemote::new(
                url.clone(),
                self.creds.clone(),
                self.options.clone(),
                self.max_index_size,
            ))),
            RepoKind::Oci(url) => {
                let remote = oci::OciRemote::new(url, self.creds.clone(), self.options.clone())
                    .map_err(|e| Error::Registry(self.repo_url.clone(), e))?;
                Ok(Arc::new(remote))
            }
            RepoKind::Local(_) => Err(Error::UnsupportedScheme("file".to_string())),
        }
    }

    /// Make the chart available locally and return its path.
    ///
    /// For remote repositories this is the cached archive. For local
    /// repositories it is the chart directory itself.
    pub async fn pull_chart(
        &self,
        chart: &str,
        version: &str,
        project: &str,
        pass_credentials: bool,
    ) -> Result<PathBuf, Error> {
        if let RepoKind::Local(dir) = &self.kind {
            return Ok(local::chart_dir(dir, chart)?);
        }

        let identity = self.identity(chart, version, project);
        let key = identity.cache_key();
        let cache_path = self.cache.get_path(&key);
        let _guard = self
            .chart_locks
            .lock(cache_path.to_string_lossy())
            .await;

        if cache_path.exists() {
            debug!(chart, version, path = %cache_path.display(), "chart cache hit");
            return Ok(cache_path);
        }

        let scratch = self.cache.scratch_dir("pull-")?;
        let remote = self.remote()?;
        let start = Instant::now();

        let fetch = remote.fetch(chart, version, scratch.path(), pass_credentials);
        let result = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, fetch)
                .await
                .map_err(|_| Error::DeadlineExceeded(identity.clone(), deadline))?,
            None => fetch.await,
        };
        result.map_err(|e| Error::Fetch(identity.clone(), e))?;

        let file = single_file(scratch.path(), &identity).await?;
        let target = self.cache.prepare_path(&key)?;
        tokio::fs::rename(&file, &target)
            .await
            .map_err(|e| Error::Place(identity.clone(), cache_path.clone(), e))?;

        info!(
            chart,
            version,
            repo = %self.repo_url,
            seconds = start.elapsed().as_secs_f64(),
            "pulled chart"
        );
        Ok(cache_path)
    }

    /// Pull the chart and unpack it into a fresh scratch directory.
    pub async fn extract_chart(
        &self,
        chart: &str,
        version: &str,
        project: &str,
        pass_credentials: bool,
        limit: ExtractLimit,
    ) -> Result<ExtractedChart, Error> {
        let pulled = self
            .pull_chart(chart, version, project, pass_credentials)
            .await?;
        if matches!(self.kind, RepoKind::Local(_)) {
            return Ok(ExtractedChart {
                dir: None,
                path: pulled,
            });
        }

        let scratch = self.cache.scratch_dir("extract-")?;
        archive::extract(&pulled, scratch.path(), limit)
            .await
            .map_err(|e| Error::Extract(self.identity(chart, version, project), e))?;

        let path = scratch.path().join(normalize_chart_name(chart));
        Ok(ExtractedChart {
            dir: Some(scratch),
            path,
        })
    }

    /// Remove the cached archive, if any.
    pub async fn clean_chart_cache(
        &self,
        chart: &str,
        version: &str,
        project: &str,
    ) -> Result<(), Error> {
        let identity = self.identity(chart, version, project);
        let path = self.cache.get_path(&identity.cache_key());
        let _guard = self.chart_locks.lock(path.to_string_lossy()).await;

        let result = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!(chart, version, path = %path.display(), "removed cached chart");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Clean(path, e)),
        }
    }

    /// Download the repository index, reading at most `max_index_size` bytes.
    pub async fn get_index(&self, max_index_size: u64) -> Result<helm::Index, Error> {
        let RepoKind::Http(url) = &self.kind else {
            return Err(Error::NoIndex(self.repo_url.clone()));
        };
        let _guard = self.index_locks.lock(self.repo_url.as_str()).await;
        helm::download_index(url, &self.creds, &self.options, max_index_size)
            .await
            .map_err(|e| Error::Index(self.repo_url.clone(), e))
    }

    /// List the registry tags of `chart`.
    pub async fn get_tags(&self, chart: &str) -> Result<oci::TagsList, Error> {
        let RepoKind::Oci(url) = &self.kind else {
            return Err(Error::OciNotEnabled(self.repo_url.clone()));
        };
        let remote = oci::OciRemote::new(url, self.creds.clone(), self.options.clone())
            .map_err(|e| Error::Registry(self.repo_url.clone(), e))?;
        let location = remote.repo().location(chart);

        let _guard = self.index_locks.lock(location.as_str()).await;
        remote
            .list_tags(chart)
            .await
            .map_err(|e| Error::Registry(location, e))
    }

    /// Test registry access by logging in.
    pub async fn check_access(&self) -> Result<bool, Error> {
        let RepoKind::Oci(url) = &self.kind else {
            return Err(Error::OciNotEnabled(self.repo_url.clone()));
        };
        oci::OciRemote::new(url, self.creds.clone(), self.options.clone())
            .map_err(|e| Error::Registry(self.repo_url.clone(), e))?
            .check_access()
            .await
            .map_err(|e| Error::Registry(self.repo_url.clone(), e))
    }
}

/// The only entry of `dir`.
async fn single_file(dir: &Path, identity: &ChartIdentity) -> Result<PathBuf, Error> {
    let listing_error = |e| Error::Listing(dir.to_path_buf(), e);
    let mut entries = tokio::fs::read_dir(dir).await.map_err(listing_error)?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(listing_error)? {
        found.push(entry.path());
    }
    match <[PathBuf; 1]>::try_from(found) {
        Ok([file]) => Ok(file),
        Err(found) => Err(Error::UnexpectedFileCount(identity.clone(), found.len())),
    }
}

/// A single request to [`ChartClient::pull`].
#[derive(Clone, Debug, Default)]
pub struct PullRequest {
    pub chart: String,
    pub repo_url: String,
    pub version: String,
    pub creds: Credentials,
    pub extract: bool,
    pub pass_credentials: bool,
}

/// The result of [`ChartClient::pull`].
#[derive(Debug)]
pub enum PulledChart {
    /// A cached archive. It outlives this handle.
    Archive(PathBuf),
    /// An extracted chart, removed on close.
    Extracted(ExtractedChart),
}

impl PulledChart {
    pub fn path(&self) -> &Path {
        match self {
            Self::Archive(path) => path,
            Self::Extracted(chart) => chart.path(),
        }
    }

    /// The path to hand out once this handle is gone.
    pub fn keep(self) -> PathBuf {
        match self {
            Self::Archive(path) => path,
            Self::Extracted(chart) => chart.keep(),
        }
    }

    pub fn close(self) -> Result<(), Error> {
        match self {
            Self::Archive(_) => Ok(()),
            Self::Extracted(chart) => chart.close(),
        }
    }
}

/// Configured entry point for pulling charts from any repository.
pub struct ChartClient {
    cache: Arc<PathCache>,
    project: String,
    limit: ExtractLimit,
    options: TransportOptions,
    max_index_size: u64,
}

impl ChartClient {
    pub const fn new(
        cache: Arc<PathCache>,
        project: String,
        limit: ExtractLimit,
        options: TransportOptions,
        max_index_size: u64,
    ) -> Self {
        Self {
            cache,
            project,
            limit,
            options,
            max_index_size,
        }
    }

    pub const fn cache(&self) -> &Arc<PathCache> {
        &self.cache
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn repository(&self, repo_url: &str, creds: Credentials) -> Result<Repository, Error> {
        Ok(
            Repository::new(repo_url, creds, self.options.clone(), self.cache.clone())?
                .with_max_index_size(self.max_index_size),
        )
    }

    /// Pull a chart, extracting it when asked to.
    ///
    /// Local charts are always returned as their directory.
    pub async fn pull(&self, request: &PullRequest) -> Result<PulledChart, Error> {
        let repo = self.repository(&request.repo_url, request.creds.clone())?;
        self.pull_from(&repo, request).await
    }

    async fn pull_from(&self, repo: &Repository, request: &PullRequest) -> Result<PulledChart, Error> {
        if request.extract || matches!(repo.kind(), RepoKind::Local(_)) {
            let chart = repo
                .extract_chart(
                    &request.chart,
                    &request.version,
                    &self.project,
                    request.pass_credentials,
                    self.limit,
                )
                .await?;
            return Ok(PulledChart::Extracted(chart));
        }

        let path = repo
            .pull_chart(
                &request.chart,
                &request.version,
                &self.project,
                request.pass_credentials,
            )
            .await?;
        Ok(PulledChart::Archive(path))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Writes `files` files after `delay`, counting calls.
    struct FakeRemote {
        calls: AtomicUsize,
        files: usize,
        delay: Duration,
        body: Vec<u8>,
    }

    impl FakeRemote {
        fn new(files: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                files,
                delay,
                body: b"archive".to_vec(),
            })
        }

        fn with_body(body: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                files: 1,
                delay: Duration::ZERO,
                body,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Remote for FakeRemote {
        async fn fetch(
            &self,
            chart: &str,
            version: &str,
            dest: &Path,
            _pass_credentials: bool,
        ) -> Result<(), RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            for i in 0..self.files {
                let path = dest.join(format!("{}-{version}-{i}.tgz", normalize_chart_name(chart)));
                std::fs::write(path, &self.body).unwrap();
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: Arc<PathCache>,
        chart_locks: Arc<KeyLock>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cache = Arc::new(PathCache::new(dir.path()).unwrap());
            Self {
                _dir: dir,
                cache,
                chart_locks: Arc::new(KeyLock::new()),
            }
        }

        fn repository(&self, remote: Arc<dyn Remote>) -> Repository {
            Repository::new(
                "https://charts.example.com",
                Credentials::default(),
                TransportOptions::default(),
                self.cache.clone(),
            )
            .unwrap()
            .with_locks(self.chart_locks.clone(), Arc::new(KeyLock::new()))
            .with_remote(remote)
        }

        fn scratch_is_empty(&self) -> bool {
            let scratch = self.cache.root().parent().unwrap().join("tmp");
            std::fs::read_dir(scratch).unwrap().next().is_none()
        }
    }

    fn chart_archive() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"name: nginx\nversion: 1.0.0\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "nginx/Chart.yaml", &data[..])
            .unwrap();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&builder.into_inner().unwrap()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_cache_key() {
        let a = ChartIdentity::new("https://charts.example.com", "nginx", "1.0.0", "");
        assert_eq!(
            a.cache_key(),
            r#"{"chart":"nginx","project":"","url":"https://charts.example.com","version":"1.0.0"}"#
        );
        let b = ChartIdentity::new("https://charts.example.com", "nginx", "1.0.0", "team-a");
        assert_ne!(a.cache_key(), b.cache_key());
        let tricky = ChartIdentity::new("https://charts.example.com\",\"x", "nginx", "1.0.0", "");
        assert_ne!(a.cache_key(), tricky.cache_key());
        assert_eq!(ChartIdentity::from_cache_key(&tricky.cache_key()), Some(tricky));
        assert_eq!(ChartIdentity::from_cache_key("not json"), None);
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            RepoKind::classify("oci://ghcr.io/org").unwrap(),
            RepoKind::Oci(_)
        ));
        assert!(matches!(
            RepoKind::classify("https://charts.example.com").unwrap(),
            RepoKind::Http(_)
        ));
        assert_eq!(
            RepoKind::classify("./charts").unwrap(),
            RepoKind::Local(PathBuf::from("./charts"))
        );
        assert_eq!(
            RepoKind::classify("file:///srv/charts").unwrap(),
            RepoKind::Local(PathBuf::from("/srv/charts"))
        );
        assert!(matches!(
            RepoKind::classify("ftp://example.com"),
            Err(Error::UnsupportedScheme(s)) if s == "ftp"
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight() {
        let fixture = Fixture::new();
        let remote = FakeRemote::new(1, Duration::from_millis(50));
        let repo = Arc::new(fixture.repository(remote.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.pull_chart("nginx", "1.0.0", "", false).await })
            })
            .collect();

        let mut paths = Vec::new();
        for task in tasks {
            paths.push(task.await.unwrap().unwrap());
        }

        assert_eq!(remote.calls(), 1);
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert!(paths[0].is_file());
        assert_eq!(fixture.chart_locks.active_keys(), 0);
        assert!(fixture.scratch_is_empty());
    }

    #[tokio::test]
    async fn test_distinct_identities_fetch_separately() {
        let fixture = Fixture::new();
        let remote = FakeRemote::new(1, Duration::ZERO);
        let repo = fixture.repository(remote.clone());

        let a = repo.pull_chart("nginx", "1.0.0", "", false).await.unwrap();
        let b = repo.pull_chart("nginx", "1.0.0", "team-a", false).await.unwrap();
        let c = repo.pull_chart("nginx", "1.1.0", "", false).await.unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(remote.calls(), 3);
        assert_eq!(fixture.cache.list_paths().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_exactly_one_file_is_required() {
        for files in [0, 2] {
            let fixture = Fixture::new();
            let repo = fixture.repository(FakeRemote::new(files, Duration::ZERO));

            let result = repo.pull_chart("nginx", "1.0.0", "", false).await;
            assert!(matches!(
                result,
                Err(Error::UnexpectedFileCount(_, n)) if n == files
            ));
            assert!(fixture.cache.list_paths().unwrap().is_empty());
            assert!(fixture.scratch_is_empty());
            assert_eq!(fixture.chart_locks.active_keys(), 0);
        }
    }

    #[tokio::test]
    async fn test_single_file_reports_listing_errors() {
        let dir = tempfile::tempdir().unwrap();
        let identity = ChartIdentity::new("https://charts.example.com", "nginx", "1.0.0", "");
        let missing = dir.path().join("missing");
        assert!(matches!(
            single_file(&missing, &identity).await,
            Err(Error::Listing(path, _)) if path == missing
        ));
        assert!(matches!(
            single_file(dir.path(), &identity).await,
            Err(Error::UnexpectedFileCount(_, 0))
        ));
    }

    #[tokio::test]
    async fn test_long_identity_is_cached() {
        let fixture = Fixture::new();
        let remote = FakeRemote::new(1, Duration::ZERO);
        let repo = Repository::new(
            "https://artifactory.example.com/artifactory/api/helm/helm-remote-virtual",
            Credentials::default(),
            TransportOptions::default(),
            fixture.cache.clone(),
        )
        .unwrap()
        .with_remote(remote.clone());

        let path = repo
            .pull_chart("ingress-nginx", "4.11.3", "platform-team", false)
            .await
            .unwrap();
        assert!(path.is_file());
        let relative = path.strip_prefix(fixture.cache.root()).unwrap();
        assert!(relative.components().all(|c| c.as_os_str().len() <= 200));

        let again = repo
            .pull_chart("ingress-nginx", "4.11.3", "platform-team", false)
            .await
            .unwrap();
        assert_eq!(path, again);
        assert_eq!(remote.calls(), 1);

        let key = repo.identity("ingress-nginx", "4.11.3", "platform-team").cache_key();
        assert_eq!(fixture.cache.list_paths().unwrap().get(&key), Some(&path));
    }

    #[tokio::test]
    async fn test_deadline_releases_lock() {
        let fixture = Fixture::new();
        let slow = fixture
            .repository(FakeRemote::new(1, Duration::from_secs(30)))
            .with_deadline(Some(Duration::from_millis(50)));

        let result = slow.pull_chart("nginx", "1.0.0", "", false).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded(..))));
        assert_eq!(fixture.chart_locks.active_keys(), 0);
        assert!(fixture.scratch_is_empty());

        let fast = fixture.repository(FakeRemote::new(1, Duration::ZERO));
        let path = fast.pull_chart("nginx", "1.0.0", "", false).await.unwrap();
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn test_local_short_circuit() {
        let fixture = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("mychart")).unwrap();

        let repo = Repository::new(
            dir.path().to_str().unwrap(),
            Credentials::default(),
            TransportOptions::default(),
            fixture.cache.clone(),
        )
        .unwrap()
        .with_locks(fixture.chart_locks.clone(), Arc::new(KeyLock::new()));

        let path = repo.pull_chart("mychart", "", "", false).await.unwrap();
        assert_eq!(path, dir.path().join("mychart"));
        assert!(fixture.cache.list_paths().unwrap().is_empty());

        let extracted = repo
            .extract_chart("mychart", "", "", false, ExtractLimit::Unbounded)
            .await
            .unwrap();
        assert_eq!(extracted.path(), dir.path().join("mychart"));
        extracted.close().unwrap();
        assert!(dir.path().join("mychart").is_dir());

        assert!(matches!(
            repo.pull_chart("missing", "", "", false).await,
            Err(Error::Local(local::Error::ChartDirNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_extract_and_close() {
        let fixture = Fixture::new();
        let repo = fixture.repository(FakeRemote::with_body(chart_archive()));

        let extracted = repo
            .extract_chart("charts/nginx", "1.0.0", "", false, ExtractLimit::Bounded(1024))
            .await
            .unwrap();
        assert!(extracted.path().ends_with("nginx"));
        assert!(extracted.path().join("Chart.yaml").is_file());

        let dir = extracted.path().parent().unwrap().to_path_buf();
        extracted.close().unwrap();
        assert!(!dir.exists());

        let kept = repo
            .extract_chart("charts/nginx", "1.0.0", "", false, ExtractLimit::Unbounded)
            .await
            .unwrap()
            .keep();
        assert!(kept.join("Chart.yaml").is_file());
        std::fs::remove_dir_all(kept.parent().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_extract_over_budget() {
        let fixture = Fixture::new();
        let repo = fixture.repository(FakeRemote::with_body(chart_archive()));

        let result = repo
            .extract_chart("nginx", "1.0.0", "", false, ExtractLimit::Bounded(4))
            .await;
        assert!(matches!(
            result,
            Err(Error::Extract(_, archive::Error::SizeLimitExceeded(4)))
        ));
        assert!(fixture.scratch_is_empty());
    }

    #[tokio::test]
    async fn test_clean_chart_cache() {
        let fixture = Fixture::new();
        let remote = FakeRemote::new(1, Duration::ZERO);
        let repo = fixture.repository(remote.clone());

        let path = repo.pull_chart("nginx", "1.0.0", "", false).await.unwrap();
        repo.clean_chart_cache("nginx", "1.0.0", "").await.unwrap();
        assert!(!path.exists());
        // Already gone is fine.
        repo.clean_chart_cache("nginx", "1.0.0", "").await.unwrap();

        repo.pull_chart("nginx", "1.0.0", "", false).await.unwrap();
        assert_eq!(remote.calls(), 2);
    }

    #[tokio::test]
    async fn test_tags_require_oci() {
        let fixture = Fixture::new();
        let repo = fixture.repository(FakeRemote::new(1, Duration::ZERO));
        assert!(matches!(
            repo.get_tags("nginx").await,
            Err(Error::OciNotEnabled(_))
        ));
        assert!(matches!(
            repo.check_access().await,
            Err(Error::OciNotEnabled(_))
        ));
    }

    #[tokio::test]
    async fn test_client_pull() {
        let fixture = Fixture::new();
        let client = ChartClient::new(
            fixture.cache.clone(),
            "team-a".to_string(),
            ExtractLimit::Bounded(1024),
            TransportOptions::default(),
            DEFAULT_MAX_INDEX_SIZE,
        );
        let repo = fixture.repository(FakeRemote::with_body(chart_archive()));

        let mut request = PullRequest {
            chart: "nginx".to_string(),
            repo_url: "https://charts.example.com".to_string(),
            version: "1.0.0".to_string(),
            ..PullRequest::default()
        };
        let archive = client.pull_from(&repo, &request).await.unwrap();
        assert!(matches!(archive, PulledChart::Archive(_)));
        let key = repo.identity("nginx", "1.0.0", "team-a").cache_key();
        assert_eq!(archive.path(), fixture.cache.get_path(&key));

        request.extract = true;
        let extracted = client.pull_from(&repo, &request).await.unwrap();
        assert!(extracted.path().join("Chart.yaml").is_file());
        extracted.close().unwrap();
    }
}
