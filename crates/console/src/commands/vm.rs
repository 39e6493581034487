//! VM lifecycle commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use super::{await_task, describe_outcome, prompt_yes, Context};
use crate::output::{print_item, print_list, print_message, print_success, print_warning, TableDisplay};
use crate::reconciler::{Command, CommandOutcome};

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommands {
    /// Convert the image into a VM with a full disk copy
    Convert,
    /// Create a VM backed by the image on the share (snapshot mode)
    Link,
    /// Start the VM
    Start,
    /// Power the VM off
    Stop,
    /// Ask the guest to shut down
    Shutdown,
    /// Hard-reset the VM
    Reset,
    /// Delete the VM (asks twice)
    Delete,
    /// Recreate the evidence folders from the case tags (asks twice)
    RecreateFolders,
}

impl From<LifecycleCommands> for Command {
    fn from(cmd: LifecycleCommands) -> Self {
        match cmd {
            LifecycleCommands::Convert => Command::Convert,
            LifecycleCommands::Link => Command::Link,
            LifecycleCommands::Start => Command::Start,
            LifecycleCommands::Stop => Command::Stop,
            LifecycleCommands::Shutdown => Command::Shutdown,
            LifecycleCommands::Reset => Command::Reset,
            LifecycleCommands::Delete => Command::Delete,
            LifecycleCommands::RecreateFolders => Command::RecreateFolders,
        }
    }
}

pub async fn execute(cmd: LifecycleCommands, ctx: &Context) -> Result<()> {
    if matches!(cmd, LifecycleCommands::Convert | LifecycleCommands::Link) {
        ctx.config.validate_tunnel()?;
    }

    let mut attached = ctx.attach().await?;
    let vm_id = attached.reconciler.vm_id();
    let reconciler = &mut attached.reconciler;

    let mut outcome = reconciler.handle(cmd.into()).await?;
    loop {
        match outcome {
            CommandOutcome::ConfirmationRequired { action, remaining } => {
                let question = format!(
                    "Really {} VM {}? ({} confirmation(s) left)",
                    action, vm_id, remaining
                );
                if prompt_yes(&question).await? {
                    outcome = reconciler.handle(Command::Confirm).await?;
                } else {
                    reconciler.handle(Command::Abort).await?;
                    print_warning(&format!("{} aborted", action));
                    return Ok(());
                }
            }
            CommandOutcome::TaskStarted(id) => {
                let message = await_task(reconciler, id, "recreate-folders").await?;
                print_success(&message);
                return Ok(());
            }
            done @ (CommandOutcome::Done(_) | CommandOutcome::Launched(_)) => {
                print_success(&describe_outcome(&done));
                return Ok(());
            }
        }
    }
}

/// Poll once and print the session view
pub async fn status(ctx: &Context) -> Result<()> {
    let attached = ctx.attach().await?;
    print_item(&attached.reconciler.view(), ctx.format);
    Ok(())
}

/// Print the VM id of the case without contacting the server
pub fn id(ctx: &Context) -> Result<()> {
    let case = ctx.case()?;
    print_message(&case.vm_id()?.to_string(), ctx.format);
    Ok(())
}

#[derive(Serialize)]
pub struct UrlRow {
    pub name: &'static str,
    pub url: String,
}

impl TableDisplay for UrlRow {
    fn headers() -> Vec<&'static str> {
        vec!["Page", "URL"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.name.to_string(), self.url.clone()]
    }
}

pub fn urls(ctx: &Context) -> Result<()> {
    let urls = ctx.config.web_urls();
    let rows = vec![
        UrlRow {
            name: "console",
            url: urls.console,
        },
        UrlRow {
            name: "shell",
            url: urls.shell,
        },
        UrlRow {
            name: "netdata",
            url: urls.netdata,
        },
    ];
    print_list(&rows, ctx.format);
    Ok(())
}
