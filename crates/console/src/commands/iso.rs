//! ISO library and CD-ROM commands

use anyhow::{anyhow, Result};
use clap::Subcommand;
use serde::Serialize;
use std::path::PathBuf;

use super::{ensure_file, Context};
use crate::output::{print_list, print_success, print_warning, transfer_bar, TableDisplay};
use crate::reconciler::Affordance;
use crate::worker::{TaskEvent, TaskKind, TaskQueue};

#[derive(Subcommand, Debug)]
pub enum IsoCommands {
    /// List ISO images stored on the server
    List,

    /// Upload an ISO image
    Upload {
        /// Local ISO file
        path: PathBuf,
    },

    /// Delete an ISO image from the server
    Delete {
        name: String,
    },

    /// Insert an ISO into the VM's CD-ROM drive
    Insert {
        name: String,
    },

    /// Eject the VM's CD-ROM
    Eject,
}

#[derive(Serialize)]
pub struct IsoDisplay {
    pub name: String,
}

impl TableDisplay for IsoDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ISO"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.name.clone()]
    }
}

pub async fn execute(cmd: IsoCommands, ctx: &Context) -> Result<()> {
    let attached = ctx.attach().await?;
    let vm_id = attached.reconciler.vm_id();
    let client = attached.client.clone();

    match cmd {
        IsoCommands::List => {
            attached.reconciler.require(Affordance::ManageIso)?;
            let isos: Vec<IsoDisplay> = client
                .list_iso()
                .await?
                .into_iter()
                .map(|name| IsoDisplay { name })
                .collect();
            print_list(&isos, ctx.format);
        }

        IsoCommands::Upload { path } => {
            attached.reconciler.require(Affordance::ManageIso)?;
            ensure_file(&path)?;
            let label = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "iso".to_string());

            let (mut queue, mut events) = TaskQueue::new();
            let id = queue.spawn(TaskKind::UploadIso, move |task| async move {
                client.upload_iso(&path, task.cancel.clone(), task.progress_fn()).await
            });

            let bar = transfer_bar(&label, None);
            let mut interrupted = false;
            let outcome = loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c(), if !interrupted => {
                        interrupted = true;
                        queue.cancel(id);
                    }
                    event = events.recv() => match event.ok_or_else(|| anyhow!("upload task vanished"))? {
                        TaskEvent::Progress { done, total, .. } => {
                            if let (Some(total), None) = (total, bar.length()) {
                                bar.set_length(total);
                                bar.set_style(crate::output::transfer_style(Some(total)));
                            }
                            bar.set_position(done);
                        }
                        TaskEvent::Finished { outcome, .. } => break outcome,
                    }
                }
            };
            queue.complete(id);
            bar.finish_and_clear();

            match outcome {
                Ok(message) => print_success(&format!("Uploaded {}: {}", label, message)),
                Err(forensicvm_common::Error::Cancelled) => print_warning("Upload cancelled"),
                Err(e) => return Err(e.into()),
            }
        }

        IsoCommands::Delete { name } => {
            attached.reconciler.require(Affordance::ManageIso)?;
            print_success(&client.delete_iso(&name).await?);
        }

        IsoCommands::Insert { name } => {
            attached.reconciler.require(Affordance::Cdrom)?;
            print_success(&client.insert_cdrom(&vm_id, &name).await?);
        }

        IsoCommands::Eject => {
            attached.reconciler.require(Affordance::Cdrom)?;
            print_success(&client.eject_cdrom(&vm_id).await?);
        }
    }

    Ok(())
}
