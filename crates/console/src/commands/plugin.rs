//! Server-side analysis plugins

use anyhow::Result;
use clap::Subcommand;
use forensicvm_common::PluginInfo;
use serde::Serialize;

use super::Context;
use crate::output::{print_list, print_message, TableDisplay};
use crate::reconciler::Affordance;

#[derive(Subcommand, Debug)]
pub enum PluginCommands {
    /// List installed plugins
    List,

    /// Run a plugin against the VM disk
    Run {
        /// Plugin directory name
        dir: String,
    },
}

#[derive(Serialize)]
pub struct PluginDisplay(PluginInfo);

impl TableDisplay for PluginDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Plugin", "Name", "Description"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.0.dir.clone(), self.0.name.clone(), self.0.description.clone()]
    }
}

pub async fn execute(cmd: PluginCommands, ctx: &Context) -> Result<()> {
    let attached = ctx.attach().await?;
    attached.reconciler.require(Affordance::Plugins)?;

    match cmd {
        PluginCommands::List => {
            let plugins: Vec<PluginDisplay> = attached
                .client
                .list_plugins()
                .await?
                .into_iter()
                .map(PluginDisplay)
                .collect();
            print_list(&plugins, ctx.format);
        }
        PluginCommands::Run { dir } => {
            let output = attached
                .client
                .run_plugin(&attached.reconciler.vm_id(), &dir)
                .await?;
            print_message(&output, ctx.format);
        }
    }
    Ok(())
}
