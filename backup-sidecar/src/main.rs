//! backup-sidecar - main entry point
//!
//! Backs up a live game server's data volume on a schedule.

use anyhow::{Context, Result};
use backup_sidecar::{
    config::Config,
    coordinator::{channel_from_config, Coordinator},
    daemon::shutdown::ShutdownCoordinator,
    gateway::{
        discord::{DiscordGateway, DiscordRest},
        CommandGateway,
    },
    health::{self, HealthReporter},
    notify::{
        webhook::{ChannelNotifier, WebhookNotifier},
        Fanout, Notifier,
    },
    record::RecordIndex,
    retention::RetentionPolicy,
    scheduler::{Scheduler, SchedulerSettings},
    snapshot::SnapshotEngine,
    upload::{drive::DriveStore, RetryPolicy, Uploader},
    utils, BackupStatus,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How long an in-flight backup may keep running after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(120);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Optional configuration file (TOML, JSON or YAML); env overrides it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Health probe port (overrides HEALTH_PORT)
    #[arg(long)]
    health_port: Option<u16>,

    /// Run a single backup and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("invalid configuration")?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        data_dir = %config.paths.data_dir.display(),
        backup_dir = %config.paths.backup_dir.display(),
        interval = %config.schedule.interval,
        "Starting backup-sidecar v{}",
        env!("CARGO_PKG_VERSION")
    );

    let channel = channel_from_config(&config.control.kind);
    if let Err(e) = channel.health_check().await {
        tracing::warn!(channel = channel.name(), error = %e, "Control channel not reachable yet");
    }
    let coordinator = Coordinator::new(channel, config.control.quiesce_timeout);

    let snapshot = SnapshotEngine::new(
        config.paths.backup_dir.clone(),
        config.snapshot.prefix.clone(),
        config.snapshot.compression_level,
    )
    .with_excludes(config.snapshot.exclude.clone());

    let drive = DriveStore::from_token_file(&config.remote.token_path)
        .await
        .with_context(|| format!("loading {}", config.remote.token_path.display()))?;
    if let Err(e) = drive.refresh().await {
        tracing::warn!(error = %e, "Initial Drive token refresh failed");
    }
    let uploader = Uploader::new(Arc::new(drive), RetryPolicy::from_config(&config.upload));

    let rest = DiscordRest::new(config.discord.bot_token.clone())?;
    let mut sinks: Vec<Arc<dyn Notifier>> =
        vec![Arc::new(WebhookNotifier::new(config.discord.webhook_url.clone())?)];
    if let Some(channel_id) = &config.discord.notify_channel_id {
        sinks.push(Arc::new(ChannelNotifier::new(rest.clone(), channel_id.clone())));
    }
    let notifier: Arc<dyn Notifier> = Arc::new(Fanout::new(sinks));

    let index = RecordIndex::load(&config.paths.backup_dir)?;
    let interval = config.schedule.interval.as_duration();
    let scheduler = Arc::new(Scheduler::new(
        SchedulerSettings {
            data_dir: config.paths.data_dir.clone(),
            artifact_prefix: config.snapshot.prefix.clone(),
            interval,
            archive_check: config.schedule.archive_check.as_duration(),
            remote_root: config.remote.folder_id.clone(),
        },
        RetentionPolicy::from_config(&config.retention),
        coordinator,
        snapshot,
        uploader,
        notifier.clone(),
        index,
    ));

    if args.once {
        let record = scheduler
            .trigger_manual(None)
            .await
            .map_err(|e| anyhow::anyhow!("backup could not run: {}", e))?;
        if record.status != BackupStatus::Completed {
            let reason = record
                .failure_reason
                .map(|r| r.to_string())
                .unwrap_or_default();
            anyhow::bail!("backup {} failed: {}", record.id, reason);
        }
        tracing::info!(record_id = %record.id, "Backup complete");
        return Ok(());
    }

    let reporter = HealthReporter::new(
        scheduler.status_handle(),
        interval,
        config.health.failure_window,
    );
    let shutdown = ShutdownCoordinator::new();

    scheduler.startup().await;
    let scheduler_handle = tokio::spawn(scheduler.clone().run(shutdown.token(), SHUTDOWN_GRACE));

    let port = args.health_port.unwrap_or(config.health.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding health probe on {}", addr))?;
    tracing::info!("Health endpoint: http://{}/health", addr);

    let server_token = shutdown.token();
    let server = axum::serve(listener, health::router(reporter.clone()))
        .with_graceful_shutdown(async move { server_token.cancelled().await });
    let server_handle = tokio::spawn(async move { server.await });

    let commands = Arc::new(CommandGateway::new(
        scheduler.clone(),
        reporter,
        notifier,
        config.discord.auth_roles.clone(),
    ));
    let gateway = DiscordGateway::new(
        config.discord.bot_token.clone(),
        config.discord.command_prefix.clone(),
        commands,
        rest,
        shutdown.token(),
    );
    let gateway_handle = tokio::spawn(async move { gateway.run().await });

    shutdown.wait_for_signal().await;

    let _ = tokio::time::timeout(Duration::from_secs(3), gateway_handle).await;

    match tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(5), scheduler_handle).await {
        Ok(Ok(())) => tracing::info!("Scheduler stopped"),
        Ok(Err(e)) => tracing::error!("Scheduler task panicked: {}", e),
        Err(_) => tracing::warn!("Scheduler shutdown timeout, forcing exit"),
    }

    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Health server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Health server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Health server task panicked: {}", e),
        Err(_) => tracing::warn!("Health server shutdown timeout, forcing exit"),
    }

    Ok(())
}
