use std::path::Path;

use anyhow::{Context, Result, bail};
use console::style;

use super::context::Services;
use crate::core::inbox::{AcceptOutcome, InboxStatus, IncomingCommand};
use crate::core::terminal::{GuideSection, print_info, print_success, print_warn};

pub async fn show_status(services: &Services) -> Result<()> {
    let health = services.store.health();
    let outbox = services.outbox.stats().await?;
    let inbox = services.inbox.stats().await?;
    let running = services.results.list_running().await?;

    GuideSection::new("Agent")
        .status("Id", services.agent_id())
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
        .status("Retention", &format!("{} days", services.config.retention_days()))
        .print();

    let state = if health.is_healthy() {
        style(format!("{:?}", health.state)).green()
    } else {
        style(format!("{:?}", health.state)).red()
    };
    GuideSection::new("Store")
        .status("Path", &services.data_dir.display().to_string())
        .status("Breaker", &state.to_string())
        .status("Failures", &health.total_failures.to_string())
        .print();

    let mut section = GuideSection::new("Outbox");
    for (kind, counts) in &outbox.per_kind {
        section = section.status(
            kind.as_str(),
            &format!("{} unsent, {} sent", counts.unsent, counts.sent),
        );
    }
    if outbox.per_kind.is_empty() {
        section = section.text("empty");
    }
    section.print();

    GuideSection::new("Inbox")
        .status("Pending", &inbox.pending.to_string())
        .status("Completed", &inbox.completed.to_string())
        .status("Failed", &inbox.failed.to_string())
        .status("Expired", &inbox.expired.to_string())
        .status("Running policies", &running.len().to_string())
        .print();
    println!();
    Ok(())
}

pub async fn list_outbox(services: &Services, limit: usize) -> Result<()> {
    let records = services.outbox.list_recent(limit).await?;
    if records.is_empty() {
        print_info("Outbox is empty.");
        return Ok(());
    }
    for r in records {
        let sent = match (r.sent_to_server, r.server_response_code) {
            (true, Some(code)) => style(format!("sent ({})", code)).green(),
            (true, None) => style("sent".to_string()).green(),
            (false, _) => style("queued".to_string()).yellow(),
        };
        println!(
            "  #{:<6} {:<20} {:<8} {:>8}B  {}  {}",
            r.id,
            r.kind.as_str(),
            sent,
            r.payload_bytes,
            r.created_at.format("%Y-%m-%d %H:%M:%S"),
            r.execution_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn list_inbox(
    services: &Services,
    status: Option<InboxStatus>,
    limit: usize,
) -> Result<()> {
    let commands = services.inbox.list(status, limit).await?;
    if commands.is_empty() {
        print_info("No commands found.");
        return Ok(());
    }
    for c in commands {
        let status = match c.status {
            InboxStatus::Pending => style(c.status.as_str()).yellow(),
            InboxStatus::Completed => style(c.status.as_str()).green(),
            InboxStatus::Failed | InboxStatus::Expired => style(c.status.as_str()).red(),
        };
        println!(
            "  {:<36} {:<10} {:<24} expires {}",
            c.execution_id,
            status,
            c.payload.label(),
            c.expires_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(err) = c.error_message {
            println!("  {:<36} {}", "", style(err).dim());
        }
    }
    Ok(())
}

pub async fn accept_from_file(services: &Services, path: &Path) -> Result<()> {
    let body = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut command: IncomingCommand =
        serde_json::from_str(&body).with_context(|| format!("{} is not a command", path.display()))?;
    if command.agent_id.is_empty() {
        command.agent_id = services.agent_id().to_string();
    } else if command.agent_id != services.agent_id() {
        bail!(
            "command is addressed to agent '{}', this agent is '{}'",
            command.agent_id,
            services.agent_id()
        );
    }

    match services.inbox.accept(&command).await? {
        AcceptOutcome::Stored(record) => print_success(&format!(
            "Queued {} ({}), expires {}",
            record.execution_id,
            record.payload.label(),
            record.expires_at.format("%Y-%m-%d %H:%M:%S")
        )),
        AcceptOutcome::Duplicate => print_warn(&format!(
            "{} was already received, nothing changed",
            command.execution_id
        )),
    }
    Ok(())
}

pub async fn sweep(services: &Services) -> Result<()> {
    let report = services.sweeper().run_once().await;
    GuideSection::new("Sweep")
        .status("Expired commands", &report.expired.to_string())
        .status("Outbox purged", &report.outbox_purged.to_string())
        .status("Inbox purged", &report.inbox_purged.to_string())
        .status("Results purged", &report.results_purged.to_string())
        .status("Compacted", &report.compacted.to_string())
        .print();
    println!();
    if !report.is_clean() {
        bail!("sweep phases failed: {}", report.failed_phases.join(", "));
    }
    Ok(())
}

pub async fn drain(services: &Services) -> Result<()> {
    let report = services.coordinator().drain_once().await?;
    if report.fetched == 0 && report.abandoned == 0 {
        print_info("No pending commands.");
        return Ok(());
    }
    GuideSection::new("Drain")
        .status("Fetched", &report.fetched.to_string())
        .status("Succeeded", &report.succeeded.to_string())
        .status("Failed", &report.failed.to_string())
        .status("Recovered", &report.recovered.to_string())
        .status("Abandoned", &report.abandoned.to_string())
        .status("Errors", &report.errors.to_string())
        .print();
    println!();
    Ok(())
}
