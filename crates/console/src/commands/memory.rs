//! Memory size commands

use anyhow::{bail, Result};
use clap::Subcommand;

use super::Context;
use crate::output::{print_message, print_success};
use crate::reconciler::Affordance;

#[derive(Subcommand, Debug)]
pub enum MemoryCommands {
    /// Show the configured memory size
    Get,

    /// Change the memory size (VM must be stopped)
    Set {
        /// Size in MB
        mb: u64,
    },
}

pub async fn execute(cmd: MemoryCommands, ctx: &Context) -> Result<()> {
    let attached = ctx.attach().await?;
    attached.reconciler.require(Affordance::MemorySize)?;
    let vm_id = attached.reconciler.vm_id();

    match cmd {
        MemoryCommands::Get => {
            let mb = attached.client.get_memory_size(&vm_id).await?;
            print_message(&format!("{} MB", mb), ctx.format);
        }
        MemoryCommands::Set { mb } => {
            if mb == 0 {
                bail!("memory size must be greater than zero");
            }
            let message = attached.client.set_memory_size(&vm_id, mb).await?;
            print_success(&message);
        }
    }
    Ok(())
}
