// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! URL helpers shared by the HTTP transports.

use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot append path segments to {0}")]
    NotABase(Url),
    #[error("Invalid URL {0}: {1}")]
    Parse(String, url::ParseError),
}

/// Append `path` to the path of `url`.
///
/// `Url::join` replaces the last segment when the URL does not end in a
/// slash, which is wrong for repository URLs such as `https://host/charts`.
pub fn append_url(url: &Url, path: &str) -> Result<Url, Error> {
    let mut appended = url.clone();
    appended
        .path_segments_mut()
        .map_err(|()| Error::NotABase(url.clone()))?
        .pop_if_empty()
        .extend(path.split('/'));
    Ok(appended)
}

/// Resolve a chart URL as published in an index.
///
/// Absolute URLs are used as is. Relative URLs are relative to the repository
/// directory, not to `index.yaml`.
pub fn resolve_chart_url(repo: &Url, chart_url: &str) -> Result<Url, Error> {
    match Url::parse(chart_url) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let mut base = repo.clone();
            if !base.path().ends_with('/') {
                base.set_path(&format!("{}/", base.path()));
            }
            base.join(chart_url)
                .map_err(|e| Error::Parse(chart_url.to_string(), e))
        }
        Err(e) => Err(Error::Parse(chart_url.to_string(), e)),
    }
}

/// True when both URLs address the same scheme, host and port.
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}
