//! Network tap commands

use anyhow::Result;
use clap::Subcommand;

use super::Context;
use crate::output::{print_message, print_success};
use crate::reconciler::Affordance;

#[derive(Subcommand, Debug)]
pub enum TapCommands {
    /// Show whether traffic capture is enabled
    Status,
    /// Start capturing the VM's traffic
    Enable,
    /// Stop capturing
    Disable,
}

pub async fn execute(cmd: TapCommands, ctx: &Context) -> Result<()> {
    let attached = ctx.attach().await?;
    attached.reconciler.require(Affordance::NetworkTap)?;
    let vm_id = attached.reconciler.vm_id();
    let client = &attached.client;

    match cmd {
        TapCommands::Status => {
            let enabled = client.check_network_tap(&vm_id).await?;
            print_message(if enabled { "tap enabled" } else { "tap disabled" }, ctx.format);
        }
        TapCommands::Enable => print_success(&client.enable_network_tap(&vm_id).await?),
        TapCommands::Disable => print_success(&client.disable_network_tap(&vm_id).await?),
    }
    Ok(())
}
