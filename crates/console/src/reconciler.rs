//! Lifecycle reconciliation loop
//!
//! Polls the control plane on a fixed interval, derives the session phase and
//! the set of permitted actions from what it observes, and executes operator
//! commands against that phase. Nothing about the phase is cached between
//! ticks: every tick recomputes it from the server's answers.

use forensicvm_common::{
    ArtifactKind, CaseIdentity, Error, Result, RunningMode, ServerReachability, VmId, VmState, VmStatus,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ControlPlane;
use crate::config::ShareConfig;
use crate::provisioner::EvidenceProvisioner;
use crate::session::{SessionFlags, SessionState};
use crate::tunnel::{TunnelHandle, TunnelLauncher, TunnelMode, TunnelRequest};
use crate::worker::{TaskEvent, TaskId, TaskKind, TaskQueue};

/// Confirmations needed before a destructive action runs
pub const REQUIRED_CONFIRMATIONS: u8 = 2;

/// Proof that the operator confirmed a delete twice. Only the reconciler can
/// create one.
#[derive(Debug)]
pub struct DeleteConfirmation {
    _sealed: (),
}

impl DeleteConfirmation {
    fn new() -> Self {
        Self { _sealed: () }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineReason {
    Unreachable,
    Unauthorized,
    StatusError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    ServerUnknown,
    ServerOffline { reason: OfflineReason },
    VmAbsent,
    VmStopped { mode: RunningMode },
    VmRunning { mode: RunningMode },
}

impl Phase {
    pub fn from_status(status: &VmStatus) -> Self {
        match status.state {
            VmState::Absent => Phase::VmAbsent,
            VmState::Stopped => Phase::VmStopped {
                mode: status.running_mode,
            },
            VmState::Running => Phase::VmRunning {
                mode: status.running_mode,
            },
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Phase::VmAbsent | Phase::VmStopped { .. } | Phase::VmRunning { .. })
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::ServerUnknown => write!(f, "server unknown"),
            Phase::ServerOffline { reason } => match reason {
                OfflineReason::Unreachable => write!(f, "server offline"),
                OfflineReason::Unauthorized => write!(f, "access denied"),
                OfflineReason::StatusError => write!(f, "status unavailable"),
            },
            Phase::VmAbsent => write!(f, "vm absent"),
            Phase::VmStopped { mode } => write!(f, "vm stopped ({})", mode),
            Phase::VmRunning { mode } => write!(f, "vm running ({})", mode),
        }
    }
}

/// Operator-visible actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Affordance {
    Convert,
    Link,
    Start,
    Stop,
    Shutdown,
    Reset,
    Delete,
    RecreateFolders,
    Snapshots,
    MemorySize,
    NetworkTap,
    Cdrom,
    Plugins,
    DownloadEvidence,
    DownloadMemoryDump,
    DownloadScreenshots,
    DownloadPcap,
    OpenConsole,
    WebShell,
    ManageIso,
}

impl Affordance {
    pub fn for_download(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::EvidenceDisk => Affordance::DownloadEvidence,
            ArtifactKind::MemoryDump => Affordance::DownloadMemoryDump,
            ArtifactKind::Screenshots => Affordance::DownloadScreenshots,
            ArtifactKind::Pcap => Affordance::DownloadPcap,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Affordance::Convert => "convert",
            Affordance::Link => "link",
            Affordance::Start => "start",
            Affordance::Stop => "stop",
            Affordance::Shutdown => "shutdown",
            Affordance::Reset => "reset",
            Affordance::Delete => "delete",
            Affordance::RecreateFolders => "recreate-folders",
            Affordance::Snapshots => "snapshots",
            Affordance::MemorySize => "memory-size",
            Affordance::NetworkTap => "network-tap",
            Affordance::Cdrom => "cdrom",
            Affordance::Plugins => "plugins",
            Affordance::DownloadEvidence => "download-evidence",
            Affordance::DownloadMemoryDump => "download-memory-dump",
            Affordance::DownloadScreenshots => "download-screenshots",
            Affordance::DownloadPcap => "download-pcap",
            Affordance::OpenConsole => "open-console",
            Affordance::WebShell => "web-shell",
            Affordance::ManageIso => "manage-iso",
        }
    }
}

impl std::fmt::Display for Affordance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of enabled actions for a phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Affordances(BTreeSet<Affordance>);

impl Affordances {
    pub fn for_phase(phase: Phase) -> Self {
        use Affordance::*;

        let enabled: &[Affordance] = match phase {
            Phase::ServerUnknown | Phase::ServerOffline { .. } => &[],
            Phase::VmAbsent => &[Convert, Link, ManageIso],
            Phase::VmStopped { .. } => &[
                Start,
                Delete,
                RecreateFolders,
                Snapshots,
                MemorySize,
                Cdrom,
                Plugins,
                DownloadEvidence,
                DownloadMemoryDump,
                DownloadScreenshots,
                DownloadPcap,
                WebShell,
                ManageIso,
            ],
            Phase::VmRunning { .. } => &[
                Stop,
                Shutdown,
                Reset,
                OpenConsole,
                WebShell,
                Snapshots,
                NetworkTap,
                Cdrom,
                DownloadMemoryDump,
                DownloadScreenshots,
                DownloadPcap,
                ManageIso,
            ],
        };
        Self(enabled.iter().copied().collect())
    }

    pub fn allows(&self, affordance: Affordance) -> bool {
        self.0.contains(&affordance)
    }

    pub fn iter(&self) -> impl Iterator<Item = Affordance> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Destructive actions gated behind confirmations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PendingAction {
    Delete,
    RecreateFolders,
}

impl PendingAction {
    fn affordance(&self) -> Affordance {
        match self {
            PendingAction::Delete => Affordance::Delete,
            PendingAction::RecreateFolders => Affordance::RecreateFolders,
        }
    }
}

impl std::fmt::Display for PendingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.affordance().as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingConfirmation {
    action: PendingAction,
    confirmations: u8,
}

/// Operator commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Convert,
    Link,
    Start,
    Stop,
    Shutdown,
    Reset,
    Delete,
    RecreateFolders,
    Confirm,
    Abort,
    Reconnect,
    Download { kind: ArtifactKind, dest_dir: PathBuf },
    CancelTask(TaskId),
}

#[derive(Debug)]
pub enum CommandOutcome {
    Done(String),
    ConfirmationRequired { action: PendingAction, remaining: u8 },
    TaskStarted(TaskId),
    Launched(TunnelHandle),
}

/// Command sent to a running loop, with a channel for its outcome
pub struct CommandRequest {
    pub command: Command,
    pub reply: oneshot::Sender<Result<CommandOutcome>>,
}

/// A background task that finished
#[derive(Debug)]
pub struct TaskCompletion {
    pub id: TaskId,
    pub kind: TaskKind,
    pub outcome: Result<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub kind: String,
    pub done: u64,
    pub total: Option<u64>,
}

/// Snapshot of the session published to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsoleView {
    pub vm_id: VmId,
    pub case_name: String,
    #[serde(flatten)]
    pub phase: Phase,
    pub websocket_port: Option<u16>,
    pub affordances: Affordances,
    pub banner: Option<String>,
    pub pending_confirmation: Option<PendingAction>,
    pub tasks: Vec<TaskView>,
    pub last_message: Option<String>,
    /// Outcome and time of the last server check
    pub reachability: Option<ServerReachability>,
}

/// Drives one case's VM through its lifecycle
pub struct LifecycleReconciler {
    case: CaseIdentity,
    vm_id: VmId,
    share: ShareConfig,
    client: Arc<dyn ControlPlane>,
    tunnel: Arc<dyn TunnelLauncher>,
    provisioner: EvidenceProvisioner,
    session: SessionState,
    phase: Phase,
    affordances: Affordances,
    pending: Option<PendingConfirmation>,
    tasks: TaskQueue,
    task_events: mpsc::UnboundedReceiver<TaskEvent>,
    progress: BTreeMap<TaskId, TaskView>,
    banner: Option<String>,
    last_message: Option<String>,
    poll_interval: Duration,
}

impl LifecycleReconciler {
    /// Create a new reconciler
    pub fn new(
        case: CaseIdentity,
        share: ShareConfig,
        client: Arc<dyn ControlPlane>,
        tunnel: Arc<dyn TunnelLauncher>,
    ) -> Result<Self> {
        let vm_id = case.vm_id()?;
        let provisioner = EvidenceProvisioner::new(client.clone(), vm_id, case.case_tags_path());
        let (tasks, task_events) = TaskQueue::new();

        Ok(Self {
            case,
            vm_id,
            share,
            client,
            tunnel,
            provisioner,
            session: SessionState::new(),
            phase: Phase::ServerUnknown,
            affordances: Affordances::default(),
            pending: None,
            tasks,
            task_events,
            progress: BTreeMap::new(),
            banner: None,
            last_message: None,
            poll_interval: Duration::from_secs(1),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn affordances(&self) -> &Affordances {
        &self.affordances
    }

    pub fn flags(&self) -> SessionFlags {
        self.session.flags
    }

    pub fn pending_confirmation(&self) -> Option<(PendingAction, u8)> {
        self.pending
            .map(|p| (p.action, REQUIRED_CONFIRMATIONS - p.confirmations))
    }

    /// Poll the server once and recompute phase and affordances
    pub async fn tick(&mut self) -> Phase {
        if self.session.flags.auth_rejected {
            debug!("Probing paused until reconnect");
            return self.phase;
        }

        let phase = match self.client.test_auth().await {
            Ok(()) => {
                self.session.reachability = Some(ServerReachability::now(true));
                match self.client.get_status(&self.vm_id).await {
                    Ok(status) => {
                        self.session.status = Some(status);
                        self.banner = None;
                        Phase::from_status(&status)
                    }
                    Err(e) => self.offline(e),
                }
            }
            Err(e) => {
                let reachable = !e.is_retryable();
                self.session.reachability = Some(ServerReachability::now(reachable));
                self.offline(e)
            }
        };

        self.session.flags.server_offline = !phase.is_online();
        self.session.flags.first_poll_done = true;
        self.set_phase(phase);

        if let Phase::VmStopped { .. } = phase {
            self.maybe_provision();
        }
        phase
    }

    fn offline(&mut self, error: Error) -> Phase {
        let reason = if error.is_unauthorized() {
            self.session.flags.auth_rejected = true;
            warn!("API key rejected: {}", error);
            self.banner = Some("API key rejected by the server; fix the key and reconnect".to_string());
            OfflineReason::Unauthorized
        } else if error.is_retryable() {
            if !self.session.flags.server_offline {
                warn!("{}", error);
            }
            self.banner = Some(error.to_string());
            OfflineReason::Unreachable
        } else {
            warn!("Status poll failed: {}", error);
            self.banner = Some(error.to_string());
            OfflineReason::StatusError
        };
        self.session.status = None;
        Phase::ServerOffline { reason }
    }

    fn set_phase(&mut self, phase: Phase) {
        if phase != self.phase {
            info!("{}: {} -> {}", self.vm_id, self.phase, phase);
        }
        self.phase = phase;
        self.affordances = Affordances::for_phase(phase);

        if let Some(pending) = self.pending {
            if !self.affordances.allows(pending.action.affordance()) {
                info!("Pending {} confirmation cleared ({})", pending.action, phase);
                self.pending = None;
            }
        }
    }

    fn maybe_provision(&mut self) {
        let state = self.session.status.map(|s| s.state).unwrap_or_default();
        if !self.session.flags.begin_provisioning(state) {
            return;
        }
        let provisioner = self.provisioner.clone();
        let id = self
            .tasks
            .spawn(TaskKind::ProvisionFolders, move |_| async move { provisioner.provision().await });
        self.track(id, TaskKind::ProvisionFolders);
    }

    fn track(&mut self, id: TaskId, kind: TaskKind) {
        self.progress.insert(
            id,
            TaskView {
                id,
                kind: kind.to_string(),
                done: 0,
                total: None,
            },
        );
    }

    /// Fail with `NotPermitted` unless the current phase enables `affordance`
    pub fn require(&self, affordance: Affordance) -> Result<()> {
        if self.affordances.allows(affordance) {
            Ok(())
        } else {
            Err(Error::NotPermitted {
                action: affordance.to_string(),
                phase: self.phase.to_string(),
            })
        }
    }

    /// Wait for the next background task event
    pub async fn next_task_event(&mut self) -> Option<TaskEvent> {
        self.task_events.recv().await
    }

    /// Fold a task event into the session
    pub fn apply_task_event(&mut self, event: TaskEvent) -> Option<TaskCompletion> {
        match event {
            TaskEvent::Progress { id, done, total } => {
                if let Some(view) = self.progress.get_mut(&id) {
                    view.done = done;
                    view.total = total;
                }
                None
            }
            TaskEvent::Finished { id, kind, outcome } => {
                self.tasks.complete(id);
                self.progress.remove(&id);

                if kind == TaskKind::ProvisionFolders {
                    self.session.flags.finish_provisioning(outcome.is_ok());
                }
                match &outcome {
                    Ok(message) => {
                        info!("Task {} ({}) finished: {}", id, kind, message);
                        self.last_message = Some(format!("{}: {}", kind, message));
                    }
                    Err(Error::Cancelled) => {
                        info!("Task {} ({}) cancelled", id, kind);
                        self.last_message = Some(format!("{}: cancelled", kind));
                    }
                    Err(e) => {
                        warn!("Task {} ({}) failed: {}", id, kind, e);
                        self.last_message = Some(format!("{} failed: {}", kind, e));
                    }
                }
                Some(TaskCompletion { id, kind, outcome })
            }
        }
    }

    /// Execute an operator command against the current phase
    pub async fn handle(&mut self, command: Command) -> Result<CommandOutcome> {
        if !matches!(command, Command::Confirm | Command::Abort) {
            if let Some(pending) = self.pending.take() {
                info!("Pending {} confirmation cleared", pending.action);
            }
        }

        match command {
            Command::Convert => self.materialize(RunningMode::Copy, Affordance::Convert).await,
            Command::Link => self.materialize(RunningMode::Snap, Affordance::Link).await,
            Command::Start => {
                self.require(Affordance::Start)?;
                if let Phase::VmStopped { mode: RunningMode::Snap } = self.phase {
                    let handle = self.tunnel.launch(&self.tunnel_request(TunnelMode::KeepAlive)).await?;
                    info!("Share tunnel live on remote port {}", handle.remote_ephemeral_port);
                }
                let message = self.client.start(&self.vm_id).await?;
                Ok(CommandOutcome::Done(message))
            }
            Command::Stop => {
                self.require(Affordance::Stop)?;
                Ok(CommandOutcome::Done(self.client.stop(&self.vm_id).await?))
            }
            Command::Shutdown => {
                self.require(Affordance::Shutdown)?;
                Ok(CommandOutcome::Done(self.client.shutdown(&self.vm_id).await?))
            }
            Command::Reset => {
                self.require(Affordance::Reset)?;
                Ok(CommandOutcome::Done(self.client.reset(&self.vm_id).await?))
            }
            Command::Delete => self.request_confirmation(PendingAction::Delete),
            Command::RecreateFolders => self.request_confirmation(PendingAction::RecreateFolders),
            Command::Confirm => self.confirm().await,
            Command::Abort => match self.pending.take() {
                Some(pending) => Ok(CommandOutcome::Done(format!("{} aborted", pending.action))),
                None => Ok(CommandOutcome::Done("nothing to abort".to_string())),
            },
            Command::Reconnect => {
                self.session.flags.auth_rejected = false;
                self.banner = None;
                let phase = self.tick().await;
                Ok(CommandOutcome::Done(phase.to_string()))
            }
            Command::Download { kind, dest_dir } => {
                self.require(Affordance::for_download(kind))?;
                let task = TaskKind::Download(kind);
                if self.tasks.is_running(task) {
                    return Err(Error::NotPermitted {
                        action: format!("download {}", kind),
                        phase: "already downloading".to_string(),
                    });
                }
                let client = self.client.clone();
                let vm_id = self.vm_id;
                let id = self.tasks.spawn(task, move |ctx| async move {
                    let path = client
                        .download_artifact(kind, &vm_id, &dest_dir, ctx.cancel.clone(), ctx.progress_fn())
                        .await?;
                    Ok(path.display().to_string())
                });
                self.track(id, task);
                Ok(CommandOutcome::TaskStarted(id))
            }
            Command::CancelTask(id) => {
                if self.tasks.cancel(id) {
                    Ok(CommandOutcome::Done(format!("cancelling task {}", id)))
                } else {
                    Err(Error::NotFound {
                        kind: "task".to_string(),
                        id: id.to_string(),
                    })
                }
            }
        }
    }

    fn tunnel_request(&self, mode: TunnelMode) -> TunnelRequest {
        TunnelRequest {
            vm_id: self.vm_id,
            image_path: self.case.image_path.clone(),
            share: self.share.clone(),
            mode,
        }
    }

    async fn materialize(&mut self, mode: RunningMode, affordance: Affordance) -> Result<CommandOutcome> {
        self.require(affordance)?;
        info!("Materializing {} from {} ({})", self.vm_id, self.case.image_path, mode);
        let handle = self.tunnel.launch(&self.tunnel_request(TunnelMode::Convert(mode))).await?;
        Ok(CommandOutcome::Launched(handle))
    }

    fn request_confirmation(&mut self, action: PendingAction) -> Result<CommandOutcome> {
        self.require(action.affordance())?;
        self.pending = Some(PendingConfirmation {
            action,
            confirmations: 0,
        });
        Ok(CommandOutcome::ConfirmationRequired {
            action,
            remaining: REQUIRED_CONFIRMATIONS,
        })
    }

    async fn confirm(&mut self) -> Result<CommandOutcome> {
        let mut pending = self.pending.take().ok_or_else(|| Error::NotPermitted {
            action: "confirm".to_string(),
            phase: "no pending confirmation".to_string(),
        })?;

        pending.confirmations += 1;
        if pending.confirmations < REQUIRED_CONFIRMATIONS {
            self.pending = Some(pending);
            return Ok(CommandOutcome::ConfirmationRequired {
                action: pending.action,
                remaining: REQUIRED_CONFIRMATIONS - pending.confirmations,
            });
        }

        // The VM may have changed since the request
        self.tick().await;
        self.require(pending.action.affordance())?;

        match pending.action {
            PendingAction::Delete => {
                let message = self.client.delete(&self.vm_id, DeleteConfirmation::new()).await?;
                info!("Deleted {}", self.vm_id);
                Ok(CommandOutcome::Done(message))
            }
            PendingAction::RecreateFolders => {
                let provisioner = self.provisioner.clone();
                let id = self
                    .tasks
                    .spawn(TaskKind::RecreateFolders, move |_| async move { provisioner.recreate().await });
                self.track(id, TaskKind::RecreateFolders);
                Ok(CommandOutcome::TaskStarted(id))
            }
        }
    }

    /// Current session snapshot
    pub fn view(&self) -> ConsoleView {
        ConsoleView {
            vm_id: self.vm_id,
            case_name: self.case.case_name.clone(),
            phase: self.phase,
            websocket_port: self.session.status.and_then(|s| s.websocket_port),
            affordances: self.affordances.clone(),
            banner: self.banner.clone(),
            pending_confirmation: self.pending.map(|p| p.action),
            tasks: self.progress.values().cloned().collect(),
            last_message: self.last_message.clone(),
            reachability: self.session.reachability,
        }
    }

    /// Run until shutdown or until every command sender is gone
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<CommandRequest>,
        view: watch::Sender<ConsoleView>,
        shutdown: CancellationToken,
    ) {
        info!("Reconciler started for {} ({})", self.vm_id, self.case.case_name);

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
                request = commands.recv() => {
                    let Some(CommandRequest { command, reply }) = request else {
                        break;
                    };
                    debug!("Command: {:?}", command);
                    let outcome = self.handle(command).await;
                    match &outcome {
                        Ok(CommandOutcome::Done(message)) => self.last_message = Some(message.clone()),
                        Ok(_) => {}
                        Err(e) => self.last_message = Some(e.to_string()),
                    }
                    let _ = reply.send(outcome);
                }
                Some(event) = self.task_events.recv() => {
                    self.apply_task_event(event);
                }
            }
            view.send_replace(self.view());
        }

        for (id, kind) in self.tasks.active() {
            info!("Cancelling task {} ({})", id, kind);
        }
        self.tasks.shutdown();
        info!("Reconciler stopped");
    }
}
