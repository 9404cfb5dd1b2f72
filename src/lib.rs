// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Fetch, cache and unpack Helm charts, and resolve their values schemas.
//!
//! Charts come from Helm HTTP repositories, OCI registries or local
//! directories. Archives are cached on disk under a key derived from the
//! chart identity, and concurrent pulls of the same chart share one fetch.
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::use_self)]

pub mod archive;
pub mod config;
pub mod keylock;
pub mod logging;
pub mod repos;
pub mod schema;
pub mod transport;
pub mod urls;
pub mod utils;
pub mod versions;
