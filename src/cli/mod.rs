mod context;
mod daemon;
mod queues;
mod vault_cmd;

use std::path::PathBuf;

use anyhow::{Result, bail};
use console::style;

use crate::core::config::OutpostConfig;
use crate::core::inbox::InboxStatus;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};
use context::{LOG_FILE, Services};

const DEFAULT_LIST_LIMIT: usize = 20;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Run")
        .command("daemon", "Run the agent: drain, sync, sweep and heartbeat")
        .command("drain", "Execute pending inbox commands once")
        .command("sweep", "Expire, purge and compact once")
        .print();

    GuideSection::new("Queues")
        .command("status", "Show store health and queue depths")
        .command("outbox list [--limit N]", "Show recent outbox records")
        .command(
            "inbox list [--status S] [--limit N]",
            "Show received commands",
        )
        .command("inbox accept <file>", "Queue a command from a JSON file")
        .print();

    GuideSection::new("Vault")
        .command("vault set <provider> <json-file>", "Encrypt and store credentials")
        .command("vault get <provider>", "Print decrypted credentials")
        .command("vault list", "List stored providers")
        .command("vault remove <provider>", "Delete a provider's credentials")
        .print();

    GuideSection::new("Environment")
        .status("OUTPOST_DATA_DIR", "Data directory (default ~/.outpost)")
        .status("OUTPOST_VAULT_SECRET", "Secret the vault key is derived from")
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("outpost").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ListArgs {
    pub limit: usize,
    pub status: Option<String>,
}

pub(crate) fn parse_list_args(args: &[String], start: usize) -> ListArgs {
    let mut limit = DEFAULT_LIST_LIMIT;
    let mut status = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--limit" | "-n" => {
                if i + 1 < args.len() {
                    limit = args[i + 1].parse().unwrap_or(DEFAULT_LIST_LIMIT);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--status" | "-s" => {
                if i + 1 < args.len() {
                    status = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    ListArgs { limit, status }
}

pub(crate) fn parse_status_filter(status: Option<&str>) -> Result<Option<InboxStatus>> {
    match status {
        None => Ok(None),
        Some(s) => match InboxStatus::from_status(s) {
            Some(status) => Ok(Some(status)),
            None => bail!(
                "unknown inbox status '{}', expected pending, completed, failed or expired",
                s
            ),
        },
    }
}

async fn open_services(data_dir: PathBuf) -> Result<Services> {
    let config = OutpostConfig::load(&data_dir).await?;
    Services::open(data_dir, config)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let data_dir = NativePlatform::data_dir();
    let cmd = args.get(1).map(String::as_str).unwrap_or("help");

    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    if cmd == "daemon" {
        let config = OutpostConfig::load(&data_dir).await?;
        crate::logging::init_logging(
            &config.logging.level,
            Some(&data_dir.join(LOG_FILE)),
            false,
        )?;
        let services = Services::open(data_dir, config)?;
        return daemon::run_daemon(services).await;
    }

    // One-shot commands only surface warnings on the terminal.
    crate::logging::init_logging("warn", None, false)?;

    match cmd {
        "status" => {
            let services = open_services(data_dir).await?;
            queues::show_status(&services).await?;
        }
        "drain" => {
            let services = open_services(data_dir).await?;
            queues::drain(&services).await?;
        }
        "sweep" => {
            let services = open_services(data_dir).await?;
            queues::sweep(&services).await?;
        }
        "outbox" => {
            let sub_cmd = args.get(2).map(String::as_str).unwrap_or("");
            match sub_cmd {
                "list" => {
                    let list = parse_list_args(&args, 3);
                    let services = open_services(data_dir).await?;
                    queues::list_outbox(&services, list.limit).await?;
                }
                _ => {
                    print_error("Unknown or missing outbox command. Expected: list");
                }
            }
        }
        "inbox" => {
            let sub_cmd = args.get(2).map(String::as_str).unwrap_or("");
            match sub_cmd {
                "list" => {
                    let list = parse_list_args(&args, 3);
                    let status = parse_status_filter(list.status.as_deref())?;
                    let services = open_services(data_dir).await?;
                    queues::list_inbox(&services, status, list.limit).await?;
                }
                "accept" => {
                    let Some(file) = args.get(3) else {
                        bail!("usage: outpost inbox accept <file>");
                    };
                    let services = open_services(data_dir).await?;
                    queues::accept_from_file(&services, &PathBuf::from(file)).await?;
                }
                _ => {
                    print_error("Unknown or missing inbox command. Expected: list, accept");
                }
            }
        }
        "vault" => {
            let services = open_services(data_dir).await?;
            vault_cmd::run_vault_command(&services, &args).await?;
        }
        other => {
            print_error(&format!("Unknown command '{}'", other));
            print_help();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_LIST_LIMIT, parse_list_args, parse_status_filter};
    use crate::core::inbox::InboxStatus;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_list_args_reads_limit_and_status() {
        let args = argv(&["outpost", "inbox", "list", "--status", "failed", "--limit", "5"]);
        let parsed = parse_list_args(&args, 3);
        assert_eq!(parsed.limit, 5);
        assert_eq!(parsed.status.as_deref(), Some("failed"));
    }

    #[test]
    fn parse_list_args_falls_back_on_bad_or_missing_values() {
        let args = argv(&["outpost", "outbox", "list", "--limit", "many"]);
        assert_eq!(parse_list_args(&args, 3).limit, DEFAULT_LIST_LIMIT);

        let args = argv(&["outpost", "outbox", "list", "--limit"]);
        let parsed = parse_list_args(&args, 3);
        assert_eq!(parsed.limit, DEFAULT_LIST_LIMIT);
        assert_eq!(parsed.status, None);
    }

    #[test]
    fn status_filter_accepts_known_statuses_only() {
        assert_eq!(parse_status_filter(None).unwrap(), None);
        assert_eq!(
            parse_status_filter(Some("pending")).unwrap(),
            Some(InboxStatus::Pending)
        );
        assert!(parse_status_filter(Some("done")).is_err());
    }
}
