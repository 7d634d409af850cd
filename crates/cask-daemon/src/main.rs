//! caskd: the cask package manager daemon.
//!
//! Requests arrive as line-delimited JSON on stdin
//! (`{"method": "Install", "params": {...}}`), replies and events leave on
//! stdout the same way. The message-bus activation wrapper owns the real
//! transport; this keeps the daemon drivable from a terminal and from
//! tests.

mod dispatch;
mod sink;

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cask_core::{CommandCacheRunner, PackageManager};
use cask_repo::{DirRemote, Repo, RepoLayout};

use dispatch::Service;
use sink::StdoutSink;

#[derive(Debug, Parser)]
#[command(name = "caskd", about = "containerized-application package manager daemon")]
struct Args {
    /// Install root (defaults to CASK_ROOT or /var/lib/cask).
    #[arg(long)]
    root: Option<PathBuf>,

    /// Runtime directory with the lock and container states
    /// (defaults to CASK_RUN_ROOT or /run/cask).
    #[arg(long)]
    run_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct Request {
    method: String,
    #[serde(default)]
    params: Value,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut layout = RepoLayout::from_env();
    if args.root.is_some() || args.run_root.is_some() {
        let root = args
            .root
            .unwrap_or_else(|| layout.root().to_path_buf());
        let run_root = args
            .run_root
            .unwrap_or_else(|| layout.run_root().to_path_buf());
        layout = RepoLayout::new(root, run_root);
    }

    let remote_location = {
        // The remote comes from the persisted repo configuration; an empty
        // location leaves the daemon in local-only mode.
        let probe = Repo::open(layout.clone(), Box::new(DirRemote::new("/nonexistent")))
            .context("failed to open repo")?;
        let config = probe.config();
        config.repos.get(&config.default_repo).cloned()
    };
    let remote = DirRemote::new(remote_location.unwrap_or_default());
    let repo = Arc::new(Repo::open(layout, Box::new(remote)).context("failed to open repo")?);

    info!(root = %repo.layout().root().display(), "cask daemon starting");
    let service = Service::new(PackageManager::new(
        repo,
        Box::new(CommandCacheRunner::from_env()),
        Arc::new(StdoutSink::new()),
    ));

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                info!(method = %request.method, "dispatching");
                service.dispatch(&request.method, request.params)
            }
            Err(err) => {
                warn!(%err, "dropping malformed request");
                json!({ "code": cask_domain::codes::INVALID_ARGS,
                        "message": format!("malformed request: {err}") })
            }
        };
        let mut out = stdout.lock();
        writeln!(out, "{}", json!({ "reply": reply }))?;
    }

    info!("stdin closed, shutting down");
    service.package_manager().shutdown();
    Ok(())
}
