// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! The main chartcache program code
#![warn(missing_docs)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::use_self)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use clap::Subcommand;
use tabled::Table;
use tabled::Tabled;
use tabled::settings::object::Rows;
use tabled::settings::{Alignment, Modify, Style};
use tap::Pipe;
use tracing::debug;

use chartcache::config::{ByteSize, Config};
use chartcache::logging;
use chartcache::repos::cache::PathCache;
use chartcache::repos::{ChartClient, ChartIdentity, PullRequest, RepoKind};
use chartcache::schema::{self, ChartSource, GeneratorKind, SchemaReader};
use chartcache::transport::Credentials;
use chartcache::versions::Constraint;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = "Fetch and cache Helm charts")]
struct Args {
    #[clap(subcommand)]
    command: Request,

    /// Config file to read defaults from.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory of the chart cache.
    #[clap(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Project the cached charts belong to.
    #[clap(long, global = true)]
    project: Option<String>,

    /// Byte budget for extraction, e.g. `10M` or `512Ki`.
    #[clap(long, global = true)]
    max_extract_size: Option<ByteSize>,

    /// Increase logging, repeat for more.
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

/// Repository credentials and TLS material.
#[derive(clap::Args, Debug, Clone)]
struct CredentialArgs {
    /// Basic auth user name.
    #[clap(long)]
    username: Option<String>,
    /// Basic auth password.
    #[clap(long)]
    password: Option<String>,
    /// PEM bundle of extra CA certificates.
    #[clap(long)]
    ca_file: Option<PathBuf>,
    /// PEM client certificate.
    #[clap(long)]
    cert_file: Option<PathBuf>,
    /// PEM client key.
    #[clap(long)]
    key_file: Option<PathBuf>,
    /// Skip TLS certificate verification.
    #[clap(long)]
    insecure_skip_verify: bool,
}

impl CredentialArgs {
    fn credentials(&self) -> Result<Credentials> {
        let read = |path: &Option<PathBuf>| -> Result<Option<Vec<u8>>> {
            path.as_deref()
                .map(|path| {
                    std::fs::read(path).with_context(|| format!("Reading file {}", path.display()))
                })
                .transpose()
        };

        Ok(Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
            ca_path: self.ca_file.clone(),
            cert_data: read(&self.cert_file)?,
            key_data: read(&self.key_file)?,
            insecure_skip_verify: self.insecure_skip_verify,
        })
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Request {
    /// Pull a chart into the cache and print its path.
    Pull {
        /// Repository URL: `https://`, `oci://` or a local directory.
        repo_url: String,
        /// Chart name.
        chart: String,
        /// Chart version.
        #[clap(long, default_value = "")]
        version: String,
        /// Unpack the chart and print the chart directory instead.
        #[clap(long)]
        extract: bool,
        /// Send credentials to chart URLs on other hosts.
        #[clap(long)]
        pass_credentials: bool,
        #[clap(flatten)]
        creds: CredentialArgs,
    },

    /// Remove a chart from the cache.
    Clean {
        /// Repository URL.
        repo_url: String,
        /// Chart name.
        chart: String,
        /// Chart version.
        #[clap(long, default_value = "")]
        version: String,
    },

    /// List cached charts.
    List,

    /// Print the highest version matching a constraint.
    Resolve {
        /// Repository URL: `https://` or `oci://`.
        repo_url: String,
        /// Chart name.
        chart: String,
        /// Version constraint, e.g. `>=1.2, <2`.
        #[clap(long, default_value = "*")]
        constraint: String,
        #[clap(flatten)]
        creds: CredentialArgs,
    },

    /// Print the values schema of a chart.
    Schema {
        /// Where the schema comes from.
        #[clap(long, default_value = "auto")]
        generator: GeneratorKind,
        /// Schema sources, or the file inside the chart.
        #[clap(long)]
        path: Vec<String>,
        /// Repository URL of the chart.
        #[clap(long)]
        repo_url: Option<String>,
        /// Chart name.
        #[clap(long)]
        chart: Option<String>,
        /// Chart version.
        #[clap(long, default_value = "")]
        version: String,
        /// Send credentials to chart URLs on other hosts.
        #[clap(long)]
        pass_credentials: bool,
        #[clap(flatten)]
        creds: CredentialArgs,
    },
}

#[derive(Tabled)]
struct CacheEntry {
    chart: String,
    version: String,
    project: String,
    #[tabled(rename = "repository")]
    repo_url: String,
    path: String,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(cache_dir) = &args.cache_dir {
        config.cache_dir.clone_from(cache_dir);
    }
    if let Some(project) = &args.project {
        config.project.clone_from(project);
    }
    if let Some(size) = args.max_extract_size {
        config.max_extract_size = size;
    }
    Ok(config)
}

fn open_cache(path: &Path) -> Result<Arc<PathCache>> {
    PathCache::new(path)
        .with_context(|| format!("Opening cache {}", path.display()))?
        .pipe(Arc::new)
        .pipe(Ok)
}

fn list_cache(cache: &PathCache) -> Result<String> {
    let entries: Vec<CacheEntry> = cache
        .list_paths()
        .context("Listing cache")?
        .into_iter()
        .map(|(key, path)| {
            let identity = ChartIdentity::from_cache_key(&key)
                .unwrap_or_else(|| ChartIdentity::new("", &key, "", ""));
            CacheEntry {
                chart: identity.chart,
                version: identity.version,
                project: identity.project,
                repo_url: identity.repo_url,
                path: path.display().to_string(),
            }
        })
        .collect();

    Table::new(entries)
        .with(Style::markdown())
        .with(Modify::new(Rows::new(..)).with(Alignment::left()))
        .to_string()
        .pipe(Ok)
}

async fn do_task(args: &Args, config: &Config) -> Result<()> {
    let cache = open_cache(&config.cache_dir)?;
    let client = ChartClient::new(
        cache.clone(),
        config.project.clone(),
        config.extract_limit(),
        config.transport_options(),
        config.max_index_size.bytes(),
    );

    match &args.command {
        Request::Pull {
            repo_url,
            chart,
            version,
            extract,
            pass_credentials,
            creds,
        } => {
            let request = PullRequest {
                chart: chart.clone(),
                repo_url: repo_url.clone(),
                version: version.clone(),
                creds: creds.credentials()?,
                extract: *extract,
                pass_credentials: *pass_credentials,
            };
            let pulled = client
                .pull(&request)
                .await
                .with_context(|| format!("Pulling {chart} from {repo_url}"))?;
            println!("{}", pulled.keep().display());
        }
        Request::Clean {
            repo_url,
            chart,
            version,
        } => {
            client
                .repository(repo_url, Credentials::default())?
                .clean_chart_cache(chart, version, client.project())
                .await
                .with_context(|| format!("Cleaning {chart} from {repo_url}"))?;
        }
        Request::List => {
            println!("{}", list_cache(&cache)?);
        }
        Request::Resolve {
            repo_url,
            chart,
            constraint,
            creds,
        } => {
            let constraint = Constraint::parse(constraint)?;
            let repo = client.repository(repo_url, creds.credentials()?)?;
            let version = match repo.kind() {
                RepoKind::Http(_) => repo
                    .get_index(config.max_index_size.bytes())
                    .await?
                    .entries(chart)?
                    .max_version(&constraint)?,
                RepoKind::Oci(_) => repo.get_tags(chart).await?.max_version(&constraint)?,
                RepoKind::Local(_) => bail!("Cannot resolve versions in local repository {repo_url}"),
            };
            println!("{version}");
        }
        Request::Schema {
            generator,
            path,
            repo_url,
            chart,
            version,
            pass_credentials,
            creds,
        } => {
            let reader = SchemaReader::new(config.transport_options());
            let paths: Vec<&str> = path.iter().map(String::as_str).collect();

            let repo = match repo_url {
                Some(repo_url) => Some(client.repository(repo_url, creds.credentials()?)?),
                None => None,
            };
            let source = match (&repo, chart) {
                (Some(repo), Some(chart)) => Some(ChartSource {
                    repo,
                    chart,
                    version,
                    project: client.project(),
                    pass_credentials: *pass_credentials,
                    limit: config.extract_limit(),
                }),
                _ => None,
            };

            let schema = schema::chart::generate(&reader, *generator, &paths, source.as_ref())
                .await
                .context("Resolving schema")?;
            match schema {
                Some(schema) => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&schema)?;
                    stdout.write_all(b"\n")?;
                }
                None => debug!("no schema requested"),
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(err) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        return Err(anyhow::anyhow!(
            "Failed to install rustls crypto provider: {err:?}"
        ));
    }

    let args = Args::parse();
    logging::init(args.verbose);

    let config = load_config(&args)?;
    do_task(&args, &config).await
}
