//! SSH key management

use anyhow::{Context as _, Result};
use clap::Subcommand;

use super::Context;
use crate::output::{print_info, print_success};

#[derive(Subcommand, Debug)]
pub enum SshCommands {
    /// Check that the key logs in to the SSH host
    Test,

    /// Generate the key pair if needed and register it with the server
    InstallKey,
}

pub async fn execute(cmd: SshCommands, ctx: &Context) -> Result<()> {
    if ctx.config.ssh.host.trim().is_empty() {
        anyhow::bail!("ssh.host is not set; run `forensicvm config set ssh.host <address>`");
    }
    let tunnel = ctx.tunnel();

    match cmd {
        SshCommands::Test => {
            tunnel.probe().await?;
            print_success(&format!("Key login to {} works", ctx.config.ssh.destination()));
        }
        SshCommands::InstallKey => {
            if tunnel.ensure_keypair().await? {
                print_info(&format!("Generated {}", ctx.config.ssh.key_path.display()));
            }
            let public_key_path = tunnel.public_key_path();
            let public_key = tokio::fs::read_to_string(&public_key_path)
                .await
                .with_context(|| format!("reading {}", public_key_path.display()))?;

            let client = ctx.client()?;
            let message = client.register_ssh_key(&public_key).await?;
            print_info(&message);

            tunnel.probe().await?;
            print_success("SSH key installed");
        }
    }
    Ok(())
}
