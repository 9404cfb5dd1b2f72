// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Semantic version parsing and constraint based selection.
//!
//! Versions are parsed leniently: a leading `v` is dropped and missing minor or
//! patch numbers are filled with zero. Anything that still does not parse is
//! treated as "not a version" and skipped by [`max_version`]. The one parse
//! failure that is not skippable is a numeric component that does not fit in
//! 64 bits.

use std::fmt::Display;

use tap::Pipe;
use thiserror::Error;
use tracing::debug;

pub type Version = semver::Version;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid semantic version {0:?}: {1}")]
    InvalidVersion(String, semver::Error),
    #[error("Version component out of range in {0:?}")]
    Overflow(String),
    #[error("Invalid version constraint {0:?}: {1}")]
    InvalidConstraint(String, semver::Error),
    #[error("No version satisfies constraint {constraint} ({candidates} candidates considered)")]
    NotFound {
        constraint: String,
        candidates: usize,
    },
}

/// Parse a semver compliant version.
pub fn parse_version(tag: &str) -> Result<Version, Error> {
    let trimmed = tag.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);
    let parts: Vec<&str> = core.split('.').collect();

    for part in &parts {
        if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) && part.parse::<u64>().is_err()
        {
            return Err(Error::Overflow(tag.to_string()));
        }
    }

    let padded = match parts.len() {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };

    Version::parse(&padded)
        .map_err(|e| Error::InvalidVersion(tag.to_string(), e))?
        .pipe(Ok)
}

/// A version constraint such as `>=1.0.0, <2.0.0`, `~1.2 || ^3` or
/// `1.0 - 2.0, !=1.5.0`.
///
/// Comparators separated by commas or whitespace must all match; alternatives
/// separated by `||` are tried in turn. A bare version means exactly that
/// version. `a - b` is the inclusive range `>=a, <=b`, and `!=v` excludes the
/// versions `=v` would match.
#[derive(Clone, Debug)]
pub struct Constraint {
    raw: String,
    alternatives: Vec<Alternative>,
}

#[derive(Clone, Debug)]
struct Alternative {
    req: semver::VersionReq,
    excluded: Vec<semver::VersionReq>,
}

impl Alternative {
    fn parse(alternative: &str) -> Result<Self, semver::Error> {
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        for comparator in comparators(alternative) {
            let (op, version) = split_operator(&comparator);
            if op == "!=" {
                let req = match without_wildcards(version) {
                    Some(version) => semver::VersionReq::parse(&format!("={version}"))?,
                    None => semver::VersionReq::STAR,
                };
                excluded.push(req);
            } else {
                included.push(normalize_comparator(op, version));
            }
        }

        let req = if included.is_empty() {
            semver::VersionReq::STAR
        } else {
            semver::VersionReq::parse(&included.join(", "))?
        };
        Ok(Self { req, excluded })
    }

    fn matches(&self, version: &Version) -> bool {
        self.req.matches(version) && !self.excluded.iter().any(|req| req.matches(version))
    }
}

impl Constraint {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let alternatives = raw
            .split("||")
            .map(Alternative::parse)
            .collect::<Result<_, _>>()
            .map_err(|e| Error::InvalidConstraint(raw.to_string(), e))?;

        Ok(Self {
            raw: raw.trim().to_string(),
            alternatives,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|alt| alt.matches(version))
    }
}

impl Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for Constraint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

const fn is_operator_char(c: char) -> bool {
    matches!(c, '=' | '<' | '>' | '~' | '^' | '!')
}

fn is_operator(token: &str) -> bool {
    !token.is_empty() && token.chars().all(is_operator_char)
}

/// Split one `||` alternative into comparators, joining detached operators
/// to their versions and expanding hyphen ranges.
fn comparators(alternative: &str) -> Vec<String> {
    let spaced = alternative.replace(',', " ");
    let tokens: Vec<&str> = spaced.split_whitespace().collect();
    let mut comparators = Vec::new();
    let mut pending_operator: Option<&str> = None;

    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        if is_operator(token) {
            pending_operator = Some(token);
            i += 1;
            continue;
        }
        if pending_operator.is_none()
            && let [_, "-", upper, ..] = &tokens[i..]
        {
            comparators.push(format!(">={token}"));
            comparators.push(format!("<={upper}"));
            i += 3;
            continue;
        }
        match pending_operator.take() {
            Some(op) => comparators.push(format!("{op}{token}")),
            None => comparators.push(token.to_string()),
        }
        i += 1;
    }

    if let Some(op) = pending_operator {
        comparators.push(op.to_string());
    }
    comparators
}

fn split_operator(comparator: &str) -> (&str, &str) {
    let split = comparator
        .find(|c: char| !is_operator_char(c))
        .unwrap_or(comparator.len());
    let (op, version) = comparator.split_at(split);
    let version = version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version);
    (op, version)
}

fn is_wildcard(part: &str) -> bool {
    matches!(part, "*" | "x" | "X")
}

/// The dot separated numeric part, before any pre-release or build suffix.
fn core_components(version: &str) -> impl Iterator<Item = &str> {
    let end = version.find(['-', '+']).unwrap_or(version.len());
    version[..end].split('.')
}

/// `version` with its wildcard components dropped, or `None` if nothing is left.
fn without_wildcards(version: &str) -> Option<String> {
    if !core_components(version).any(is_wildcard) {
        return Some(version.to_string());
    }
    let fixed: Vec<&str> = core_components(version)
        .take_while(|part| !is_wildcard(part))
        .collect();
    (!fixed.is_empty()).then(|| fixed.join("."))
}

fn normalize_comparator(op: &str, version: &str) -> String {
    let wildcard = core_components(version).any(is_wildcard);
    if op.is_empty() && !wildcard && version.starts_with(|c: char| c.is_ascii_digit()) {
        format!("={version}")
    } else {
        format!("{op}{version}")
    }
}

/// Select the highest version in `candidates` that satisfies `constraint`.
pub fn max_version<'a>(
    candidates: impl IntoIterator<Item = &'a str>,
    constraint: &Constraint,
) -> Result<Version, Error> {
    let mut considered = 0;
    let mut best: Option<Version> = None;

    for candidate in candidates {
        considered += 1;
        let version = match parse_version(candidate) {
            Ok(version) => version,
            Err(Error::InvalidVersion(tag, err)) => {
                debug!(tag = %tag, error = %err, "skipping invalid semantic version");
                continue;
            }
            Err(err) => return Err(err),
        };

        if constraint.matches(&version) && best.as_ref().is_none_or(|b| version > *b) {
            best = Some(version);
        }
    }

    best.ok_or_else(|| Error::NotFound {
        constraint: constraint.to_string(),
        candidates: considered,
    })
}

/// Registry tags cannot contain `+`, so by convention it is stored as `_`.
pub fn escape_tag(version: &str) -> String {
    version.replace('+', "_")
}

pub fn unescape_tag(tag: &str) -> String {
    tag.replace('_', "+")
}
