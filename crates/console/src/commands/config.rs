//! Configuration commands

use anyhow::Result;
use clap::Subcommand;
use forensicvm_common::Error;
use std::path::PathBuf;

use super::Context;
use crate::config::{validate_server_address, ConsoleConfig, ShareConfig};
use crate::output::{print_info, print_success, OutputFormat};

const MASK: &str = "********";

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the configuration with secrets masked
    Show,

    /// Derive share settings from the case image location
    Autofill,

    /// Set a single value, e.g. `server.address 10.0.0.5:8000`
    Set {
        key: String,
        value: String,
    },
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> forensicvm_common::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{}: invalid value {:?}", key, value)))
}

/// Apply `key = value` to the configuration
pub fn apply_setting(config: &mut ConsoleConfig, key: &str, value: &str) -> forensicvm_common::Result<()> {
    match key {
        "server.address" => {
            if !validate_server_address(value) {
                return Err(Error::InvalidConfig(format!("server.address: {:?} is not an address", value)));
            }
            config.server.address = value.trim().to_string();
        }
        "server.api_key" => config.server.api_key = value.trim().to_string(),
        "server.poll_interval_ms" => config.server.poll_interval_ms = parse(key, value)?,
        "server.request_timeout_secs" => config.server.request_timeout_secs = parse(key, value)?,
        "ssh.host" => config.ssh.host = value.trim().to_string(),
        "ssh.port" => config.ssh.port = parse(key, value)?,
        "ssh.username" => config.ssh.username = value.trim().to_string(),
        "ssh.key_path" => config.ssh.key_path = PathBuf::from(value.trim()),
        "ssh.ssh_binary" => config.ssh.ssh_binary = value.trim().to_string(),
        "ssh.terminal" => config.ssh.terminal = value.split_whitespace().map(str::to_string).collect(),
        "ssh.conversion_tool" => config.ssh.conversion_tool = value.trim().to_string(),
        "ssh.wait_command" => config.ssh.wait_command = value.trim().to_string(),
        "ssh.negotiate_timeout_secs" => config.ssh.negotiate_timeout_secs = parse(key, value)?,
        "share.windows_share" => config.share.windows_share = value.trim().to_string(),
        "share.login" => config.share.login = value.to_string(),
        "share.password" => config.share.password = value.to_string(),
        "share.equivalence" => config.share.equivalence = value.trim().to_string(),
        other => return Err(Error::InvalidConfig(format!("unknown setting: {}", other))),
    }
    Ok(())
}

fn masked(config: &ConsoleConfig) -> ConsoleConfig {
    let mut config = config.clone();
    if !config.server.api_key.is_empty() {
        config.server.api_key = MASK.to_string();
    }
    if !config.share.password.is_empty() {
        config.share.password = MASK.to_string();
    }
    config
}

fn print_share(share: &ShareConfig) {
    print_info(&format!("share:       {}", share.windows_share));
    print_info(&format!("equivalence: {}", share.equivalence));
}

pub async fn execute(cmd: ConfigCommands, ctx: &Context) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let shown = masked(&ctx.config);
            match ctx.format {
                OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&shown)?),
                _ => println!("{}", serde_json::to_string_pretty(&shown)?),
            }
        }

        ConfigCommands::Autofill => {
            let case = ctx.case()?;
            let mut config = ctx.config.clone();
            config.share.autofill(&case.image_path);
            config.save(&ctx.config_path)?;
            config.share.save_for_case(&case)?;
            print_share(&config.share);
            print_success(&format!("Saved {}", ctx.config_path.display()));
        }

        ConfigCommands::Set { key, value } => {
            let mut config = ctx.config.clone();
            apply_setting(&mut config, &key, &value)?;
            config.save(&ctx.config_path)?;
            print_success(&format!("{} updated", key));
        }
    }
    Ok(())
}
