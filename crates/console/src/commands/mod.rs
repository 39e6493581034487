//! CLI command implementations

pub mod artifact;
pub mod config;
pub mod iso;
pub mod memory;
pub mod network;
pub mod plugin;
pub mod snapshot;
pub mod ssh;
pub mod vm;
pub mod watch;

use anyhow::{anyhow, bail, Context as _, Result};
use clap::Args;
use forensicvm_common::CaseIdentity;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::client::RemoteControlClient;
use crate::config::ConsoleConfig;
use crate::output::{print_warning, transfer_bar, transfer_style, OutputFormat};
use crate::reconciler::{CommandOutcome, LifecycleReconciler, Phase};
use crate::tunnel::OpenSshTunnel;
use crate::worker::{TaskEvent, TaskId};

/// Case the session is attached to
#[derive(Args, Debug, Clone, Default)]
pub struct CaseArgs {
    /// Forensic image path as seen by the examiner workstation
    #[arg(long, global = true, requires_all = ["case_dir", "case_name"])]
    pub image: Option<String>,

    /// Case directory of the forensic suite
    #[arg(long, global = true)]
    pub case_dir: Option<String>,

    /// Case name
    #[arg(long, global = true)]
    pub case_name: Option<String>,

    #[arg(long, global = true)]
    pub case_number: Option<String>,

    #[arg(long, global = true)]
    pub case_examiner: Option<String>,

    /// Case file written by an earlier session
    #[arg(long, global = true, env = "FORENSICVM_CASE")]
    pub case_file: Option<PathBuf>,
}

impl CaseArgs {
    fn case_file(&self) -> PathBuf {
        self.case_file
            .clone()
            .unwrap_or_else(|| forensicvm_common::default_store_path().join("case-config.json"))
    }

    /// Case from explicit arguments (remembered for later sessions) or from the case file
    pub fn resolve(&self) -> Result<CaseIdentity> {
        if let (Some(image), Some(dir), Some(name)) = (&self.image, &self.case_dir, &self.case_name) {
            let mut case = CaseIdentity::new(image.as_str(), dir.as_str(), name.as_str());
            if let Some(number) = &self.case_number {
                case.case_number = number.clone();
            }
            if let Some(examiner) = &self.case_examiner {
                case.case_examiner = examiner.clone();
            }
            case.vm_id()?;
            case.save(&self.case_file())?;
            return Ok(case);
        }

        let path = self.case_file();
        CaseIdentity::load(&path).with_context(|| {
            format!(
                "no case given; pass --image, --case-dir and --case-name (or a valid {})",
                path.display()
            )
        })
    }
}

/// Everything a command needs
pub struct Context {
    pub config: ConsoleConfig,
    pub config_path: PathBuf,
    pub format: OutputFormat,
    pub case_args: CaseArgs,
}

/// Reconciler attached to the session's case, after its first poll
pub struct Attached {
    pub reconciler: LifecycleReconciler,
    pub client: Arc<RemoteControlClient>,
    pub case: CaseIdentity,
}

impl Context {
    pub fn case(&self) -> Result<CaseIdentity> {
        self.case_args.resolve()
    }

    pub fn client(&self) -> Result<Arc<RemoteControlClient>> {
        self.config.validate()?;
        Ok(Arc::new(RemoteControlClient::new(&self.config.server)?))
    }

    pub fn tunnel(&self) -> OpenSshTunnel {
        OpenSshTunnel::new(self.config.ssh.clone())
    }

    /// Build the reconciler for the case and poll once
    pub async fn attach(&self) -> Result<Attached> {
        let case = self.case()?;
        let client = self.client()?;
        let share = self.config.share.with_case_override(&case)?;

        let mut reconciler = LifecycleReconciler::new(case.clone(), share, client.clone(), Arc::new(self.tunnel()))?
            .with_poll_interval(self.config.server.poll_interval());
        let phase = reconciler.tick().await;
        debug!("Attached to {} in phase {}", reconciler.vm_id(), phase);

        // Let first-contact provisioning finish before the process can exit
        while reconciler.flags().provisioning_in_flight {
            match reconciler.next_task_event().await {
                Some(event) => {
                    reconciler.apply_task_event(event);
                }
                None => break,
            }
        }

        if let Phase::ServerOffline { .. } = phase {
            if let Some(banner) = reconciler.view().banner {
                print_warning(&banner);
            }
        }

        Ok(Attached {
            reconciler,
            client,
            case,
        })
    }
}

/// Wait for a background task, rendering its progress and cancelling it on Ctrl-C
pub async fn await_task(reconciler: &mut LifecycleReconciler, id: TaskId, label: &str) -> Result<String> {
    let bar = transfer_bar(label, None);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                bar.set_message(format!("{} (cancelling)", label));
                reconciler.handle(crate::reconciler::Command::CancelTask(id)).await?;
            }
            event = reconciler.next_task_event() => {
                let event = event.ok_or_else(|| anyhow!("task queue closed"))?;
                if let TaskEvent::Progress { id: progress_id, done, total } = &event {
                    if *progress_id == id {
                        if let Some(total) = total {
                            if bar.length() != Some(*total) {
                                bar.set_length(*total);
                                bar.set_style(transfer_style(Some(*total)));
                            }
                        }
                        bar.set_position(*done);
                    }
                }
                if let Some(done) = reconciler.apply_task_event(event) {
                    if done.id == id {
                        bar.finish_and_clear();
                        return done.outcome.map_err(Into::into);
                    }
                }
            }
        }
    }
}

/// Ask the operator on stdin; anything but `yes` declines
pub async fn prompt_yes(question: &str) -> Result<bool> {
    println!("{} [yes/no]", question);
    // std's stdin keeps one shared buffer, so consecutive prompts see piped answers
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

/// Render the outcome of a reconciler command
pub fn describe_outcome(outcome: &CommandOutcome) -> String {
    match outcome {
        CommandOutcome::Done(message) => message.clone(),
        CommandOutcome::ConfirmationRequired { action, remaining } => {
            format!("{} needs {} more confirmation(s)", action, remaining)
        }
        CommandOutcome::TaskStarted(id) => format!("task {} started", id),
        CommandOutcome::Launched(handle) => format!(
            "tunnel to {}\\{} on remote port {}",
            handle.local_share_host, handle.local_share_name, handle.remote_ephemeral_port
        ),
    }
}

pub(crate) fn ensure_file(path: &std::path::Path) -> Result<()> {
    if !path.is_file() {
        bail!("{} is not a file", path.display());
    }
    Ok(())
}
