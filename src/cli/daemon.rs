use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use tracing::{debug, info, warn};

use super::context::{LOG_FILE, Services};
use crate::core::heartbeat::HeartbeatProducer;
use crate::core::lifecycle::LifecycleManager;
use crate::core::sync::{CommandPoller, FlushWorker, HttpTransport, SyncError, Transport};
use crate::core::terminal::{GuideSection, print_info};

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Run the agent in the foreground until Ctrl-C.
pub async fn run_daemon(services: Services) -> Result<()> {
    // Fail before scheduling anything if stored credentials could never be read.
    let vault = services
        .vault()
        .context("the daemon needs the vault secret to start")?;
    let providers = vault.list_providers().await?;
    info!("[vault] {} credential provider(s) on record", providers.len());

    let schedule = services.config.schedule.clone();
    let agent_id = services.agent_id().to_string();
    let mut lifecycle = LifecycleManager::new().await?;

    let sweeper = Arc::new(services.sweeper());
    let startup = sweeper.run_once().await;
    if !startup.is_clean() {
        warn!(
            "[sweeper] Startup sweep left phases for later: {:?}",
            startup.failed_phases
        );
    }
    lifecycle
        .every("sweep", secs(schedule.sweep_interval_secs), move || {
            let sweeper = sweeper.clone();
            async move {
                sweeper.run_once().await;
            }
        })
        .await?;

    let coordinator = Arc::new(services.coordinator());
    let drainer = coordinator.clone();
    lifecycle
        .every("drain", secs(schedule.drain_interval_secs), move || {
            let coordinator = drainer.clone();
            async move {
                if let Err(e) = coordinator.drain_once().await {
                    warn!("[policy] Drain failed: {}", e);
                }
            }
        })
        .await?;

    let heartbeat = Arc::new(HeartbeatProducer::new(
        services.store.clone(),
        services.outbox.clone(),
        services.inbox.clone(),
        &agent_id,
    ));
    lifecycle
        .every("heartbeat", secs(schedule.heartbeat_interval_secs), move || {
            let heartbeat = heartbeat.clone();
            async move {
                if let Err(e) = heartbeat.produce_once().await {
                    warn!("[heartbeat] Could not queue heartbeat: {}", e);
                }
            }
        })
        .await?;

    match services.config.server.base_url.as_deref() {
        Some(base_url) => {
            let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
                base_url,
                secs(services.config.server.request_timeout_secs),
            )?);

            let flusher = Arc::new(FlushWorker::new(
                services.outbox.clone(),
                services.results.clone(),
                transport.clone(),
                &agent_id,
                services.config.limits.outbox_batch_size,
            ));
            lifecycle
                .every("flush", secs(schedule.flush_interval_secs), move || {
                    let flusher = flusher.clone();
                    async move {
                        match flusher.flush_once().await {
                            Ok(_) => {}
                            Err(SyncError::Transport(e)) => {
                                debug!("[sync] Flush deferred: {}", e)
                            }
                            Err(e) => warn!("[sync] Flush failed: {}", e),
                        }
                    }
                })
                .await?;

            let poller = Arc::new(CommandPoller::new(
                services.inbox.clone(),
                transport,
                &agent_id,
            ));
            lifecycle
                .every("poll", secs(schedule.poll_interval_secs), move || {
                    let poller = poller.clone();
                    async move {
                        if let Err(e) = poller.poll_once().await {
                            warn!("[sync] Command poll failed: {}", e);
                        }
                    }
                })
                .await?;
        }
        None => info!("[sync] No server configured, records stay queued locally"),
    }

    lifecycle.attach(Arc::new(services.store.clone()));
    lifecycle.attach(coordinator);
    lifecycle.start().await?;

    GuideSection::new("outpost daemon")
        .status("Agent", &format!("{}", style(&agent_id).bold()))
        .status("Role", &format!("{:?}", services.config.agent.role))
        .status(
            "Server",
            services
                .config
                .server
                .base_url
                .as_deref()
                .unwrap_or("offline"),
        )
        .status("Data", &services.data_dir.display().to_string())
        .status(
            "Log",
            &services.data_dir.join(LOG_FILE).display().to_string(),
        )
        .blank()
        .status(
            "Press Ctrl+C to stop.",
            &format!("{}", style("Ctrl+C").bold().yellow()),
        )
        .print();
    println!();

    tokio::signal::ctrl_c().await?;
    print_info("Shutting down...");
    lifecycle.shutdown().await?;
    Ok(())
}
