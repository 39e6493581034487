//! Evidence downloads

use anyhow::Result;
use clap::Args;
use forensicvm_common::{ArtifactKind, Error};
use std::path::PathBuf;

use super::{await_task, Context};
use crate::output::{print_success, print_warning};
use crate::reconciler::{Command, CommandOutcome};

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// evidence-disk, memory-dump, screenshots or pcap
    pub kind: ArtifactKind,

    /// Destination directory (defaults to the case folder of the VM)
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

pub async fn execute(args: DownloadArgs, ctx: &Context) -> Result<()> {
    let mut attached = ctx.attach().await?;
    let dest_dir = match args.out {
        Some(dir) => dir,
        None => attached.case.case_image_folder()?,
    };

    let command = Command::Download {
        kind: args.kind,
        dest_dir,
    };
    let id = match attached.reconciler.handle(command).await? {
        CommandOutcome::TaskStarted(id) => id,
        other => anyhow::bail!("unexpected outcome: {:?}", other),
    };

    match await_task(&mut attached.reconciler, id, args.kind.as_str()).await {
        Ok(path) => {
            print_success(&format!("Saved {}", path));
            Ok(())
        }
        Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::Cancelled)) => {
            print_warning("Download cancelled; partial file removed");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
