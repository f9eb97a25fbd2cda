//! userpub CLI
//!
//! Operator tooling around the publish service: inspect the parsed
//! configuration, check how an identity resolves, and dry-run a retention
//! sweep.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use userpub::config::{self, CachedConfig, ConfigPaths, IssuerList, DEFAULT_ALLOWLIST_PATH, DEFAULT_CONFIG_PATH};
use userpub::context::local_hostname;
use userpub::identity::{Credentials, Ed25519Verifier, IdentityResolver};

#[derive(Parser)]
#[command(name = "userpub")]
#[command(about = "Publication gatekeeper and retention engine", version)]
struct Cli {
    /// Path to the operator config file
    #[arg(long, short = 'c', global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Path to the DN allow-list (grid-mapfile format)
    #[arg(long, global = true, default_value = DEFAULT_ALLOWLIST_PATH)]
    allowlist: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the parsed configuration as JSON
    ShowConfig,

    /// Resolve a certificate subject or bearer token to a principal
    Resolve {
        /// Client certificate subject
        #[arg(long, conflicts_with = "token")]
        dn: Option<String>,

        /// Bearer token (without the "Bearer " prefix)
        #[arg(long)]
        token: Option<String>,

        /// Address the request is treated as coming from
        #[arg(long, default_value = "127.0.0.1")]
        remote: IpAddr,
    },

    /// Show what a retention sweep of a repository would delete
    PlanSweep {
        /// Repository name as listed in a hostrepo entry
        repo: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let paths = ConfigPaths {
        config: cli.config,
        allowlist: cli.allowlist,
    };

    match cli.command {
        Commands::ShowConfig => run_show_config(&paths),
        Commands::Resolve { dn, token, remote } => run_resolve(&paths, dn, token, remote),
        Commands::PlanSweep { repo } => run_plan_sweep(&paths, &repo),
    }
}

fn run_show_config(paths: &ConfigPaths) -> Result<()> {
    let snapshot = config::load_snapshot(&paths.config)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn run_resolve(paths: &ConfigPaths, dn: Option<String>, token: Option<String>, remote: IpAddr) -> Result<()> {
    let snapshot = config::load_snapshot(&paths.config)?;
    let allowlist = if dn.is_some() {
        config::load_allowlist(&paths.allowlist)?
    } else {
        Default::default()
    };
    let issuers = match (&token, &snapshot.issuers_file) {
        (Some(_), Some(path)) => config::load_issuers(path)?,
        _ => IssuerList::default(),
    };

    let cached = CachedConfig {
        snapshot: Arc::new(snapshot),
        allowlist: Arc::new(allowlist),
        issuers: Arc::new(issuers),
    };
    let credentials = Credentials {
        remote_addr: remote,
        authorization: token.map(|t| format!("Bearer {}", t)),
        client_dn: dn,
    };

    let resolver = IdentityResolver::new(Arc::new(Ed25519Verifier), local_hostname());
    match resolver.resolve(&credentials, &cached, Utc::now()) {
        Ok(principal) => {
            println!("{}", principal);
            Ok(())
        }
        Err(e) => bail!("access denied: {}", e),
    }
}

fn run_plan_sweep(paths: &ConfigPaths, repo: &str) -> Result<()> {
    let snapshot = config::load_snapshot(&paths.config)?;
    let plan = userpub_worker::plan_configured(&snapshot, repo, SystemTime::now())
        .with_context(|| format!("cannot plan sweep from {}", paths.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}
