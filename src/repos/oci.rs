// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! OCI registry chart repositories.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use docker_credential::{CredentialRetrievalError, DockerCredential};
use futures::StreamExt;
use oci_client::manifest::{OciDescriptor, OciManifest};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference, RegistryOperation};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use super::Remote;
use super::hash::{self, Sha256Hash};
use crate::archive::normalize_chart_name;
use crate::transport::{self, Credentials, TransportOptions};
use crate::versions::{self, Constraint, Version, escape_tag, unescape_tag};

const HELM_CHART_LAYER: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
const TAGS_PAGE: usize = 100;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid OCI URL {0}")]
    InvalidOciUrl(Url),
    #[error("OCI error for {0}: {1}")]
    OciDistribution(Box<Reference>, oci_client::errors::OciDistributionError),
    #[error("OCI IO error for {0}: {1}")]
    OciIo(Box<Reference>, std::io::Error),
    #[error("File error {0}: {1}")]
    File(PathBuf, std::io::Error),
    #[error("{0} is not an OCI image")]
    NotAnOciImage(Box<Reference>),
    #[error("{0} has no Helm chart layer")]
    NoChartLayer(Box<Reference>),
    #[error("Failed to retrieve docker credentials: {0}")]
    CredentialRetrieval(#[from] CredentialRetrievalError),
    #[error("Unsupported docker credentials")]
    UnsupportedDockerCredentials,
    #[error("{0}")]
    Transport(#[from] transport::Error),
    #[error("{0}")]
    Digest(#[from] hash::Error),
}

/// Registry tags of one chart, with `_` turned back into `+`.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct TagsList {
    pub tags: Vec<String>,
}

impl TagsList {
    pub fn max_version(&self, constraint: &Constraint) -> Result<Version, versions::Error> {
        versions::max_version(self.tags.iter().map(String::as_str), constraint)
    }
}

/// Host and repository prefix of an `oci://` URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OciRepo {
    host: String,
    path: String,
}

impl OciRepo {
    pub fn parse(url: &Url) -> Result<Self, Error> {
        if url.scheme() != "oci" {
            return Err(Error::InvalidOciUrl(url.clone()));
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidOciUrl(url.clone()))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let path = url.path().trim_matches('/').to_string();

        Ok(Self { host, path })
    }

    /// `host/path/chart`, used as the tag lock key.
    pub fn location(&self, chart: &str) -> String {
        format!("{}/{}", self.host, self.repository(chart))
    }

    fn repository(&self, chart: &str) -> String {
        let chart = chart.trim_matches('/');
        if self.path.is_empty() {
            chart.to_string()
        } else {
            format!("{}/{}", self.path, chart)
        }
    }

    pub fn reference(&self, chart: &str, version: &str) -> Reference {
        Reference::with_tag(
            self.host.clone(),
            self.repository(chart),
            escape_tag(version),
        )
    }
}

/// An authenticated registry client.
///
/// Tokens obtained by the login live only in this client. Dropping the
/// session discards them, which is the registry logout.
struct RegistrySession {
    client: Client,
    auth: RegistryAuth,
    registry: String,
}

impl RegistrySession {
    async fn open(
        config: oci_client::client::ClientConfig,
        reference: &Reference,
        auth: RegistryAuth,
        login: bool,
    ) -> Result<Self, Error> {
        let client = Client::new(config);
        if login {
            client
                .auth(reference, &auth, RegistryOperation::Pull)
                .await
                .map_err(|e| Error::OciDistribution(Box::new(reference.clone()), e))?;
            debug!(registry = %reference.registry(), "logged in to registry");
        }
        Ok(Self {
            client,
            auth,
            registry: reference.registry().to_string(),
        })
    }
}

impl Drop for RegistrySession {
    fn drop(&mut self) {
        debug!(registry = %self.registry, "closed registry session");
    }
}

fn build_auth(reference: &Reference, creds: &Credentials) -> Result<RegistryAuth, Error> {
    if let Some((username, password)) = creds.basic_auth() {
        return Ok(RegistryAuth::Basic(username.to_string(), password.to_string()));
    }

    let server = reference
        .resolve_registry()
        .strip_suffix('/')
        .unwrap_or_else(|| reference.resolve_registry());

    #[allow(clippy::match_same_arms)]
    match docker_credential::get_credential(server) {
        Err(CredentialRetrievalError::ConfigNotFound) => Ok(RegistryAuth::Anonymous),
        Err(CredentialRetrievalError::NoCredentialConfigured) => Ok(RegistryAuth::Anonymous),
        Err(err) => Err(err.into()),
        Ok(DockerCredential::UsernamePassword(username, password)) => {
            Ok(RegistryAuth::Basic(username, password))
        }
        Ok(DockerCredential::IdentityToken(_)) => Err(Error::UnsupportedDockerCredentials),
    }
}

fn chart_layer<'a>(
    reference: &Reference,
    layers: &'a [OciDescriptor],
) -> Result<&'a OciDescriptor, Error> {
    if let Some(layer) = layers.iter().find(|l| l.media_type == HELM_CHART_LAYER) {
        return Ok(layer);
    }
    match layers {
        [layer] => Ok(layer),
        _ => Err(Error::NoChartLayer(Box::new(reference.clone()))),
    }
}

/// Pulls charts from, and lists tags in, one OCI registry repository.
pub struct OciRemote {
    repo: OciRepo,
    creds: Credentials,
    options: TransportOptions,
}

impl OciRemote {
    pub fn new(url: &Url, creds: Credentials, options: TransportOptions) -> Result<Self, Error> {
        Ok(Self {
            repo: OciRepo::parse(url)?,
            creds,
            options,
        })
    }

    pub const fn repo(&self) -> &OciRepo {
        &self.repo
    }

    async fn session(&self, reference: &Reference) -> Result<RegistrySession, Error> {
        let config = transport::oci_client_config(&self.creds, &self.options)?;
        let auth = build_auth(reference, &self.creds)?;
        let login = self.creds.basic_auth().is_some();
        RegistrySession::open(config, reference, auth, login).await
    }

    /// Every tag of `chart`, following registry pagination.
    pub async fn list_tags(&self, chart: &str) -> Result<TagsList, Error> {
        let reference = self.repo.reference(chart, "latest");
        let session = self.session(&reference).await?;
        let start = Instant::now();

        let (reference, session) = (&reference, &session);
        let tags = collect_pages(move |last: Option<String>| async move {
            session
                .client
                .list_tags(reference, &session.auth, Some(TAGS_PAGE), last.as_deref())
                .await
                .map(|page| page.tags)
                .map_err(|e| Error::OciDistribution(Box::new(reference.clone()), e))
        })
        .await?;
        let tags: Vec<String> = tags.iter().map(|tag| unescape_tag(tag)).collect();

        info!(
            chart,
            repo = %self.repo.location(chart),
            tags = tags.len(),
            seconds = start.elapsed().as_secs_f64(),
            "got tags"
        );
        Ok(TagsList { tags })
    }

    /// Log in if credentials are configured. Without credentials there is no
    /// way to test access, so the registry is assumed to be accessible.
    pub async fn check_access(&self) -> Result<bool, Error> {
        if self.creds.basic_auth().is_none() {
            return Ok(true);
        }
        let start = Instant::now();
        let reference = self.repo.reference("", "latest");
        let _session = self.session(&reference).await?;
        info!(
            repo = %self.repo.host,
            seconds = start.elapsed().as_secs_f64(),
            "tested registry access"
        );
        Ok(true)
    }

    async fn pull(&self, chart: &str, version: &str, dest: &Path) -> Result<(), Error> {
        let reference = self.repo.reference(chart, version);
        let session = self.session(&reference).await?;

        let (manifest, _digest) = session
            .client
            .pull_manifest(&reference, &session.auth)
            .await
            .map_err(|e| Error::OciDistribution(Box::new(reference.clone()), e))?;
        let OciManifest::Image(manifest) = manifest else {
            return Err(Error::NotAnOciImage(Box::new(reference)));
        };
        let layer = chart_layer(&reference, &manifest.layers)?;

        let path = dest.join(format!("{}-{version}.tgz", normalize_chart_name(chart)));
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| Error::File(path.clone(), e))?;
        let mut stream = session
            .client
            .pull_blob_stream(&reference, layer)
            .await
            .map_err(|e| Error::OciDistribution(Box::new(reference.clone()), e))?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::OciIo(Box::new(reference.clone()), e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::File(path.clone(), e))?;
        }
        file.flush().await.map_err(|e| Error::File(path.clone(), e))?;

        if layer.digest.starts_with("sha256:") {
            Sha256Hash::new(&layer.digest).verify(&path).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Remote for OciRemote {
    async fn fetch(
        &self,
        chart: &str,
        version: &str,
        dest: &Path,
        _pass_credentials: bool,
    ) -> Result<(), super::RemoteError> {
        Ok(self.pull(chart, version, dest).await?)
    }
}

/// Follow tag list pagination until a page is empty or repeats.
///
/// Registries may return fewer tags than requested while more remain, so a
/// short page does not end the listing.
async fn collect_pages<F, Fut>(mut next_page: F) -> Result<Vec<String>, Error>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Vec<String>, Error>>,
{
    let mut tags = Vec::new();
    let mut last: Option<String> = None;
    loop {
        let page = next_page(last.clone()).await?;
        let next = page.last().cloned();
        if next.is_none() || next == last {
            break;
        }
        tags.extend(page);
        last = next;
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn layer(media_type: &str) -> OciDescriptor {
        OciDescriptor {
            media_type: media_type.to_string(),
            digest: "sha256:abc".to_string(),
            ..OciDescriptor::default()
        }
    }

    #[test]
    fn test_parse_repo() {
        let repo = OciRepo::parse(&Url::parse("oci://public.ecr.aws/karpenter").unwrap()).unwrap();
        assert_eq!(repo.location("karpenter"), "public.ecr.aws/karpenter/karpenter");

        let repo = OciRepo::parse(&Url::parse("oci://localhost:5000/").unwrap()).unwrap();
        assert_eq!(repo.location("/nginx"), "localhost:5000/nginx");

        assert!(matches!(
            OciRepo::parse(&Url::parse("https://example.com/charts").unwrap()),
            Err(Error::InvalidOciUrl(_))
        ));
    }

    #[test]
    fn test_reference_escapes_tag() {
        let repo = OciRepo::parse(&Url::parse("oci://registry.example.com/charts").unwrap()).unwrap();
        let reference = repo.reference("nginx", "1.2.3+build.5");
        assert_eq!(reference.registry(), "registry.example.com");
        assert_eq!(reference.repository(), "charts/nginx");
        assert_eq!(reference.tag(), Some("1.2.3_build.5"));
    }

    #[test]
    fn test_chart_layer() {
        let reference = Reference::with_tag(
            "registry.example.com".to_string(),
            "charts/nginx".to_string(),
            "1.0.0".to_string(),
        );

        let layers = [layer("application/vnd.cncf.helm.config.v1+json"), layer(HELM_CHART_LAYER)];
        assert_eq!(
            chart_layer(&reference, &layers).unwrap().media_type,
            HELM_CHART_LAYER
        );

        let single = [layer("application/octet-stream")];
        assert!(chart_layer(&reference, &single).is_ok());

        let ambiguous = [layer("a"), layer("b")];
        assert!(matches!(
            chart_layer(&reference, &ambiguous),
            Err(Error::NoChartLayer(_))
        ));
    }

    #[test]
    fn test_tags_max_version() {
        let tags = TagsList {
            tags: ["1.0.0", "1.2.3_build.1", "latest", "2.0.0-rc1"]
                .iter()
                .map(|t| unescape_tag(t))
                .collect(),
        };
        assert_eq!(tags.tags[1], "1.2.3+build.1");
        let version = tags
            .max_version(&Constraint::parse("<2.0.0").unwrap())
            .unwrap();
        assert_eq!(version.to_string(), "1.2.3+build.1");
    }

    /// Serves `tags` in pages of at most `cap`, starting after `last`.
    fn short_pages(tags: &[String], cap: usize, last: Option<&str>) -> Vec<String> {
        let start = last
            .and_then(|last| tags.iter().position(|t| t == last))
            .map_or(0, |i| i + 1);
        tags.iter().skip(start).take(cap).cloned().collect()
    }

    #[tokio::test]
    async fn test_short_pages_do_not_end_listing() {
        let all: Vec<String> = (0..130).map(|i| format!("1.0.{i}")).collect();
        let requests = std::sync::atomic::AtomicUsize::new(0);

        let tags = collect_pages(|last| {
            requests.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let page = short_pages(&all, 50, last.as_deref());
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(tags, all);
        assert_eq!(requests.load(std::sync::atomic::Ordering::SeqCst), 4);
        let tags = TagsList { tags };
        assert_eq!(
            tags.max_version(&Constraint::parse("*").unwrap()).unwrap(),
            Version::new(1, 0, 129)
        );
    }

    #[tokio::test]
    async fn test_repeated_page_ends_listing() {
        let page: Vec<String> = vec!["1.0.0".to_string(), "1.1.0".to_string()];
        let tags = collect_pages(|_| {
            let page = page.clone();
            async move { Ok(page) }
        })
        .await
        .unwrap();
        assert_eq!(tags, page);

        let tags = collect_pages(|_| async { Ok(Vec::new()) }).await.unwrap();
        assert!(tags.is_empty());
    }

    #[test]
    fn test_explicit_credentials_win() {
        let reference = Reference::with_tag(
            "registry.example.com".to_string(),
            "charts/nginx".to_string(),
            "1.0.0".to_string(),
        );
        let creds = Credentials {
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            ..Credentials::default()
        };
        assert!(matches!(
            build_auth(&reference, &creds).unwrap(),
            RegistryAuth::Basic(u, p) if u == "user" && p == "pass"
        ));
    }

    #[tokio::test]
    async fn test_check_access_without_credentials() {
        let remote = OciRemote::new(
            &Url::parse("oci://registry.invalid/charts").unwrap(),
            Credentials::default(),
            TransportOptions::default(),
        )
        .unwrap();
        assert!(remote.check_access().await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires external download"]
    async fn test_pull_and_list_tags() {
        let remote = OciRemote::new(
            &Url::parse("oci://public.ecr.aws/karpenter").unwrap(),
            Credentials::default(),
            TransportOptions::default(),
        )
        .unwrap();

        let tags = remote.list_tags("karpenter").await.unwrap();
        assert!(tags.tags.iter().any(|t| t == "1.0.5"));

        let dir = tempfile::tempdir().unwrap();
        remote
            .fetch("karpenter", "1.0.5", dir.path(), false)
            .await
            .unwrap();
        assert!(dir.path().join("karpenter-1.0.5.tgz").is_file());
    }
}
