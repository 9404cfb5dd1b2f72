// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! HTTP and OCI client construction.
//!
//! Clients are built per operation from the caller's credentials and options.
//! Nothing here is cached or shared between repositories.

use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use oci_client::client::{Certificate as OciCertificate, CertificateEncoding, ClientConfig};
use reqwest::{Certificate, Identity, NoProxy, Proxy, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tracing::warn;
use url::Url;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot read {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("Invalid CA bundle {0}: {1}")]
    InvalidCa(PathBuf, reqwest::Error),
    #[error("Invalid client certificate: {0}")]
    InvalidIdentity(reqwest::Error),
    #[error("Invalid proxy {0}: {1}")]
    InvalidProxy(String, reqwest::Error),
    #[error("Cannot build HTTP client: {0}")]
    Build(reqwest::Error),
    #[error("Request to {0} failed: {1}")]
    Request(Url, reqwest::Error),
    #[error("Request to {0} timed out")]
    DeadlineExceeded(Url),
    #[error("Request to {0} returned {1}")]
    Status(Url, StatusCode),
}

impl Error {
    pub(crate) fn from_request(url: &Url, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::DeadlineExceeded(url.clone())
        } else {
            Self::Request(url.clone(), err)
        }
    }
}

/// Credentials and TLS material for one repository.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Path to a PEM bundle of extra trusted roots.
    pub ca_path: Option<PathBuf>,
    /// PEM encoded client certificate.
    pub cert_data: Option<Vec<u8>>,
    /// PEM encoded client key.
    pub key_data: Option<Vec<u8>>,
    pub insecure_skip_verify: bool,
}

impl Credentials {
    /// Username and password, only if both are set.
    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        }
    }

    fn identity_pem(&self) -> Option<Vec<u8>> {
        match (&self.cert_data, &self.key_data) {
            (Some(cert), Some(key)) => {
                let mut pem = cert.clone();
                if !pem.ends_with(b"\n") {
                    pem.push(b'\n');
                }
                pem.extend_from_slice(key);
                Some(pem)
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ca_path", &self.ca_path)
            .field("cert_data", &self.cert_data.as_ref().map(|_| "<redacted>"))
            .field("key_data", &self.key_data.as_ref().map(|_| "<redacted>"))
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish()
    }
}

/// Proxy and timeout settings.
#[derive(Clone, Debug, Default)]
pub struct TransportOptions {
    /// Explicit proxy for all schemes. When unset the environment is used.
    pub proxy: Option<String>,
    /// Comma separated hosts that bypass `proxy`.
    pub no_proxy: Option<String>,
    pub timeout: Option<Duration>,
}

fn read_ca(path: &PathBuf) -> Result<Vec<u8>, Error> {
    std::fs::read(path).map_err(|e| Error::Io(path.clone(), e))
}

/// Build a fresh HTTP client for one operation.
pub fn build_http_client(
    creds: &Credentials,
    options: &TransportOptions,
) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .pool_max_idle_per_host(0)
        .danger_accept_invalid_certs(creds.insecure_skip_verify);

    if let Some(path) = &creds.ca_path {
        let pem = read_ca(path)?;
        for cert in
            Certificate::from_pem_bundle(&pem).map_err(|e| Error::InvalidCa(path.clone(), e))?
        {
            builder = builder.add_root_certificate(cert);
        }
    }

    if let Some(pem) = creds.identity_pem() {
        let identity = Identity::from_pem(&pem).map_err(Error::InvalidIdentity)?;
        builder = builder.identity(identity);
    }

    if let Some(proxy) = &options.proxy {
        let no_proxy = options.no_proxy.as_deref().and_then(NoProxy::from_string);
        let proxy = Proxy::all(proxy)
            .map_err(|e| Error::InvalidProxy(proxy.clone(), e))?
            .no_proxy(no_proxy);
        builder = builder.proxy(proxy);
    }

    if let Some(timeout) = options.timeout {
        builder = builder.timeout(timeout);
    }

    builder.build().map_err(Error::Build)
}

/// Attach HTTP Basic auth when both username and password are present.
pub fn apply_basic_auth(request: RequestBuilder, creds: &Credentials) -> RequestBuilder {
    match creds.basic_auth() {
        Some((username, password)) => request.basic_auth(username, Some(password)),
        None => request,
    }
}

/// Fail on non success status codes.
pub fn check_status(response: Response) -> Result<Response, Error> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::Status(response.url().clone(), status))
    }
}

/// Read at most `max` bytes of the body; anything beyond is dropped.
pub async fn read_limited(response: Response, max: u64) -> Result<Vec<u8>, Error> {
    let url = response.url().clone();
    let max = usize::try_from(max).unwrap_or(usize::MAX);
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::from_request(&url, e))?;
        let remaining = max - body.len();
        if chunk.len() >= remaining {
            body.extend_from_slice(&chunk[..remaining]);
            break;
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}

fn split_pem_bundle(pem: &[u8]) -> Vec<Vec<u8>> {
    const END: &str = "-----END CERTIFICATE-----";

    String::from_utf8_lossy(pem)
        .split_inclusive(END)
        .filter(|block| block.contains(END))
        .map(|block| block.trim_start().as_bytes().to_vec())
        .collect()
}

/// The registry client equivalent of [`build_http_client`].
pub fn oci_client_config(
    creds: &Credentials,
    options: &TransportOptions,
) -> Result<ClientConfig, Error> {
    let extra_root_certificates = match &creds.ca_path {
        Some(path) => split_pem_bundle(&read_ca(path)?)
            .into_iter()
            .map(|data| OciCertificate {
                encoding: CertificateEncoding::Pem,
                data,
            })
            .collect(),
        None => Vec::new(),
    };

    if creds.identity_pem().is_some() {
        warn!("client certificates are not supported for OCI registries, ignoring");
    }

    Ok(ClientConfig {
        protocol: oci_client::client::ClientProtocol::Https,
        accept_invalid_certificates: creds.insecure_skip_verify,
        extra_root_certificates,
        https_proxy: options.proxy.clone(),
        http_proxy: options.proxy.clone(),
        no_proxy: options.no_proxy.clone(),
        read_timeout: options.timeout,
        connect_timeout: options.timeout,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use httpmock::prelude::*;

    use super::*;

    fn creds(username: Option<&str>, password: Option<&str>) -> Credentials {
        Credentials {
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            ..Credentials::default()
        }
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials {
            key_data: Some(b"PRIVATE".to_vec()),
            ..creds(Some("user"), Some("hunter2"))
        };
        let debug = format!("{creds:?}");
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("PRIVATE"));
    }

    #[test]
    fn test_basic_auth_requires_both() {
        assert_eq!(
            creds(Some("u"), Some("p")).basic_auth(),
            Some(("u", "p"))
        );
        assert_eq!(creds(Some("u"), None).basic_auth(), None);
        assert_eq!(creds(None, Some("p")).basic_auth(), None);
    }

    #[tokio::test]
    async fn test_basic_auth_header_gating() {
        let server = MockServer::start_async().await;
        // "user:pass"
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/private")
                    .header("authorization", "Basic dXNlcjpwYXNz");
                then.status(200).body("ok");
            })
            .await;

        let client = build_http_client(&Credentials::default(), &TransportOptions::default())
            .unwrap();
        let url = server.url("/private");

        let partial = apply_basic_auth(client.get(&url), &creds(Some("user"), None))
            .send()
            .await
            .unwrap();
        assert_eq!(partial.status(), 404);
        assert_eq!(mock.hits_async().await, 0);

        let full = apply_basic_auth(client.get(&url), &creds(Some("user"), Some("pass")))
            .send()
            .await
            .unwrap();
        assert_eq!(full.status(), 200);
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_read_limited_truncates() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/big");
                then.status(200).body("x".repeat(4096));
            })
            .await;

        let client = build_http_client(&Credentials::default(), &TransportOptions::default())
            .unwrap();
        let response = client.get(server.url("/big")).send().await.unwrap();
        let body = read_limited(response, 100).await.unwrap();
        assert_eq!(body.len(), 100);

        let response = client.get(server.url("/big")).send().await.unwrap();
        let body = read_limited(response, 1 << 20).await.unwrap();
        assert_eq!(body.len(), 4096);
    }

    #[tokio::test]
    async fn test_check_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing");
                then.status(404);
            })
            .await;

        let client = build_http_client(&Credentials::default(), &TransportOptions::default())
            .unwrap();
        let response = client.get(server.url("/missing")).send().await.unwrap();
        assert!(matches!(
            check_status(response),
            Err(Error::Status(_, StatusCode::NOT_FOUND))
        ));
    }

    const TEST_CERT: &[u8] = include_bytes!("../testdata/tls/client.pem");
    const TEST_KEY: &[u8] = include_bytes!("../testdata/tls/client-key.pem");

    #[test]
    fn test_ca_bundle_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.pem");
        std::fs::write(&ca_path, [TEST_CERT, TEST_CERT].concat()).unwrap();
        let creds = Credentials {
            ca_path: Some(ca_path),
            ..Credentials::default()
        };
        build_http_client(&creds, &TransportOptions::default()).unwrap();
        let config = oci_client_config(&creds, &TransportOptions::default()).unwrap();
        assert_eq!(config.extra_root_certificates.len(), 2);
    }

    #[test]
    fn test_client_identity_is_loaded() {
        let creds = Credentials {
            cert_data: Some(TEST_CERT.to_vec()),
            key_data: Some(TEST_KEY.to_vec()),
            ..Credentials::default()
        };
        build_http_client(&creds, &TransportOptions::default()).unwrap();

        let mismatched = Credentials {
            key_data: Some(b"not a key".to_vec()),
            ..creds
        };
        assert!(matches!(
            build_http_client(&mismatched, &TransportOptions::default()),
            Err(Error::InvalidIdentity(_))
        ));
    }

    #[tokio::test]
    async fn test_explicit_proxy_and_no_proxy() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/index.yaml");
                then.status(200).body("direct");
            })
            .await;
        let options = |no_proxy: &str| TransportOptions {
            // Nothing listens on the discard port.
            proxy: Some("http://127.0.0.1:9".to_string()),
            no_proxy: Some(no_proxy.to_string()),
            timeout: Some(Duration::from_secs(10)),
        };

        let proxied = build_http_client(&Credentials::default(), &options("other.invalid")).unwrap();
        assert!(proxied.get(server.url("/index.yaml")).send().await.is_err());
        assert_eq!(mock.hits_async().await, 0);

        let bypass = build_http_client(&Credentials::default(), &options("127.0.0.1")).unwrap();
        let response = bypass.get(server.url("/index.yaml")).send().await.unwrap();
        assert_eq!(response.text().await.unwrap(), "direct");
        assert_eq!(mock.hits_async().await, 1);

        let invalid = TransportOptions {
            proxy: Some("http://[invalid".to_string()),
            ..TransportOptions::default()
        };
        assert!(matches!(
            build_http_client(&Credentials::default(), &invalid),
            Err(Error::InvalidProxy(..))
        ));
    }

    #[test]
    fn test_missing_ca_is_an_error() {
        let creds = Credentials {
            ca_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Credentials::default()
        };
        assert!(matches!(
            build_http_client(&creds, &TransportOptions::default()),
            Err(Error::Io(..))
        ));
        assert!(matches!(
            oci_client_config(&creds, &TransportOptions::default()),
            Err(Error::Io(..))
        ));
    }

    #[test]
    fn test_split_pem_bundle() {
        let bundle = b"-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----\n\
-----BEGIN CERTIFICATE-----\nBBB\n-----END CERTIFICATE-----\n";
        let certs = split_pem_bundle(bundle);
        assert_eq!(certs.len(), 2);
        assert!(certs[1].starts_with(b"-----BEGIN CERTIFICATE-----\nBBB"));
    }

    #[test]
    fn test_oci_config_carries_options() {
        let options = TransportOptions {
            proxy: Some("http://proxy:3128".to_string()),
            no_proxy: Some("localhost".to_string()),
            timeout: Some(Duration::from_secs(7)),
        };
        let config = oci_client_config(&creds(None, None), &options).unwrap();
        assert_eq!(config.https_proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(config.no_proxy.as_deref(), Some("localhost"));
        assert_eq!(config.read_timeout, Some(Duration::from_secs(7)));
        assert!(!config.accept_invalid_certificates);
    }
}
