//! Configuration view and validation commands: `sitecraft config`.

use std::path::Path;

use anyhow::{Context, Result};
use sitecraft::config::SitecraftToml;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Sitecraft Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {}; showing defaults.", config_path.display());
            }
            println!();

            let mut config = SitecraftToml::load_or_default(config_path)?;
            config.apply_env();
            let shown = toml::to_string_pretty(&config.redacted())
                .context("Failed to render configuration")?;
            println!("{}", shown);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let mut config = SitecraftToml::load_or_default(config_path)?;
            config.apply_env();
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists.", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            SitecraftToml::default().save(config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [github] app_id, installation_id, private_key_path");
            println!("  - [provisioning] install_command, dev_command, timeouts");
            println!("  - [[sites]] one entry per previewable repository");
            println!();
        }
    }

    Ok(())
}
