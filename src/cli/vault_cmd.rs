use std::path::Path;

use anyhow::{Context, Result, bail};

use super::context::Services;
use crate::core::terminal::{GuideSection, print_error, print_info, print_success, print_warn};
use crate::core::vault::CredentialMap;

pub async fn run_vault_command(services: &Services, args: &[String]) -> Result<()> {
    let sub_cmd = args.get(2).map(String::as_str).unwrap_or("");
    let vault = services.vault()?;

    match sub_cmd {
        "set" => {
            let (Some(provider), Some(file)) = (args.get(3), args.get(4)) else {
                bail!("usage: outpost vault set <provider> <json-file>");
            };
            let body = tokio::fs::read_to_string(Path::new(file))
                .await
                .with_context(|| format!("failed to read {}", file))?;
            let credentials: CredentialMap = serde_json::from_str(&body)
                .with_context(|| format!("{} must hold a JSON object", file))?;
            vault.store_credentials(provider, &credentials).await?;
            print_success(&format!(
                "Stored {} field(s) for provider '{}'",
                credentials.len(),
                provider
            ));
        }
        "get" => {
            let Some(provider) = args.get(3) else {
                bail!("usage: outpost vault get <provider>");
            };
            match vault.load_credentials(provider).await? {
                Some(credentials) => println!("{}", serde_json::to_string_pretty(&credentials)?),
                None => print_warn(&format!("No credentials stored for '{}'", provider)),
            }
        }
        "list" => {
            let entries = vault.list_providers().await?;
            if entries.is_empty() {
                print_info("The vault is empty.");
                return Ok(());
            }
            let mut section = GuideSection::new("Credential providers");
            for entry in &entries {
                section = section.status(
                    &entry.provider,
                    &format!("updated {}", entry.updated_at.format("%Y-%m-%d %H:%M:%S")),
                );
            }
            section.print();
            println!();
        }
        "remove" => {
            let Some(provider) = args.get(3) else {
                bail!("usage: outpost vault remove <provider>");
            };
            if vault.remove_credentials(provider).await? {
                print_success(&format!("Removed credentials for '{}'", provider));
            } else {
                print_warn(&format!("No credentials stored for '{}'", provider));
            }
        }
        _ => {
            print_error("Unknown or missing vault command. Expected: set, get, list, remove");
        }
    }
    Ok(())
}
