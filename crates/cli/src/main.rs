mod cli;
mod remote;

use crate::cli::Cli;
use crate::remote::{SshControlPlane, SshShell};
use clap::Parser;
use config::Config;
use orchestrator::clock::SystemClock;
use orchestrator::engine::{BatchItem, BatchRequest, ScanEngine, Services};
use orchestrator::gateway::ControlPlaneGateway;
use orchestrator::persistence::SqliteVulnStore;
use orchestrator::provision::ProvisioningEngine;
use orchestrator::publish::PublishMachine;
use orchestrator::scan::{ScanExecutor, ShellKevFeed};
use orchestrator::session::SessionPool;
use orchestrator::vault::{CredentialVault, Secret};
use orchestrator::{Error, HostId, ScanStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Vault resolving credential references to process environment variables,
/// so secrets never appear on the command line or in configuration.
#[derive(Debug, Default)]
struct EnvVault;

impl CredentialVault for EnvVault {
    fn reveal(&self, credential_ref: &str) -> Result<Secret, Error> {
        std::env::var(credential_ref)
            .map(Secret::new)
            .map_err(|_| Error::CredentialUnavailable(credential_ref.to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // NOTE: The verbosity flag takes precedence over the environment variable
    // for log control. For example, `SNAPSCAN_LOG=warn snapscan-rs -vvv` will
    // still log at the trace level. The environment variable (`SNAPSCAN_LOG`)
    // can only set the log level per crate, not override the verbosity flag.
    let env_filter = EnvFilter::builder()
        .with_default_directive("sqlx=warn".parse()?)
        .with_env_var("SNAPSCAN_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    // load config
    let mut config = match &cli.conffile {
        Some(path) => Config::load(path)?,
        _ => {
            let mut candidates = glob::glob("/etc/snapscan/config.d/*.toml")?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            candidates.insert(0, "/etc/snapscan/config.toml".into());
            trace!(?candidates, "config file candidates");
            Config::load_multiple(candidates)?
        }
    };
    if let Some(dbfile) = &cli.dbfile {
        config.persistence.db_path = (!dbfile.is_empty()).then(|| PathBuf::from(dbfile));
    }
    debug!(?config, ?cli);

    let store = match &config.persistence.db_path {
        Some(path) => SqliteVulnStore::open(path.clone()).await?,
        None => {
            warn!("no database path configured, findings are kept in memory");
            SqliteVulnStore::in_memory().await?
        }
    };

    let vault: Arc<dyn CredentialVault> = Arc::new(EnvVault);
    let clock = Arc::new(SystemClock);

    let pool = Arc::new(SessionPool::new(
        config.pool.clone(),
        Box::new(SshShell),
        vault.clone(),
        clock.clone(),
        Arc::new(store.clone()),
    ));

    let gateway = Arc::new(ControlPlaneGateway::new(
        config.control_plane.clone(),
        Box::new(SshControlPlane::default()),
        vault,
        clock.clone(),
    ));
    gateway.connect().await?;

    let machine = Arc::new(PublishMachine::new(
        config.publish.clone(),
        gateway,
        clock.clone(),
    ));
    let kev = Arc::new(ShellKevFeed::new(
        pool.clone(),
        config.scan.kev_feed_url.clone(),
    ));
    let services = Services {
        machine,
        pool: pool.clone(),
        provisioner: Arc::new(ProvisioningEngine::new(
            config.provision.clone(),
            pool.clone(),
        )),
        executor: Arc::new(ScanExecutor::new(config.scan.clone(), pool.clone())),
        store: Arc::new(store),
        kev,
        clock,
    };
    let engine = ScanEngine::new(services);

    // session keep-alive and sweep run alongside the batch
    let cancel = CancellationToken::new();
    let maintenance = tokio::spawn(pool.clone().run_maintenance(cancel.child_token()));

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling batch");
            signal_cancel.cancel();
        }
    });

    let request = BatchRequest {
        host: HostId::new(cli.host.clone()),
        username: cli.username.clone(),
        credential_ref: cli.credential_ref.clone(),
        scanner: cli.scanner,
        items: cli
            .items
            .iter()
            .map(|spec| BatchItem {
                item: spec.name.clone(),
                restore_point: spec.restore_point.clone(),
                disks: spec.disks.clone(),
            })
            .collect(),
    };

    let report = engine.run_batch(&request, &cancel).await;

    cancel.cancel();
    let _ = maintenance.await;
    pool.disconnect(&request.host).await;

    let report = report?;
    for outcome in &report.outcomes {
        match outcome.status {
            ScanStatus::Completed => info!(
                item = outcome.item,
                critical = outcome.counts.critical,
                high = outcome.counts.high,
                medium = outcome.counts.medium,
                low = outcome.counts.low,
                negligible = outcome.counts.negligible,
                "scan completed"
            ),
            _ => error!(
                item = outcome.item,
                status = ?outcome.status,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "scan did not complete"
            ),
        }
    }

    let failed = report.failed_items();
    if failed > 0 {
        anyhow::bail!("{failed} of {} items did not complete", report.outcomes.len());
    }
    Ok(())
}
