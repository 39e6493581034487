//! Snapshot Commands

use anyhow::Result;
use clap::Subcommand;
use forensicvm_common::SnapshotEntry;
use serde::Serialize;

use super::Context;
use crate::output::{format_mb, print_list, print_success, TableDisplay};
use crate::reconciler::Affordance;

#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// List the VM's snapshots
    List,

    /// Take a snapshot
    Create,

    /// Roll the VM back to a snapshot
    Rollback {
        /// Snapshot tag
        tag: String,
    },

    /// Delete a snapshot
    Delete {
        /// Snapshot tag
        tag: String,
    },
}

/// Snapshot display wrapper for serialization
#[derive(Serialize)]
pub struct SnapshotDisplay {
    pub tag: String,
    pub size_mb: f64,
}

impl From<SnapshotEntry> for SnapshotDisplay {
    fn from(entry: SnapshotEntry) -> Self {
        Self {
            tag: entry.tag,
            size_mb: entry.size_mb,
        }
    }
}

impl TableDisplay for SnapshotDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Tag", "Size"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.tag.clone(), format_mb(self.size_mb)]
    }
}

pub async fn execute(cmd: SnapshotCommands, ctx: &Context) -> Result<()> {
    let attached = ctx.attach().await?;
    attached.reconciler.require(Affordance::Snapshots)?;
    let vm_id = attached.reconciler.vm_id();
    let client = &attached.client;

    match cmd {
        SnapshotCommands::List => {
            let snapshots = client.list_snapshots(&vm_id).await?;
            let displays: Vec<SnapshotDisplay> = snapshots.into_iter().map(SnapshotDisplay::from).collect();
            print_list(&displays, ctx.format);
        }

        SnapshotCommands::Create => {
            let message = client.create_snapshot(&vm_id).await?;
            print_success(&message);
        }

        SnapshotCommands::Rollback { tag } => {
            let message = client.rollback_snapshot(&vm_id, &tag).await?;
            print_success(&format!("Rolled back to '{}': {}", tag, message));
        }

        SnapshotCommands::Delete { tag } => {
            let message = client.delete_snapshot(&vm_id, &tag).await?;
            print_success(&format!("Snapshot '{}' deleted: {}", tag, message));
        }
    }

    Ok(())
}
