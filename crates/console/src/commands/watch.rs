//! Interactive session: runs the reconciler loop and reads commands from stdin

use anyhow::Result;
use forensicvm_common::ArtifactKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{describe_outcome, Context};
use crate::output::{print_error, print_info};
use crate::reconciler::{Command, CommandRequest, ConsoleView, LifecycleReconciler};

const HELP: &str = "\
commands:
  convert | link                      materialize the VM (copy / snapshot mode)
  start | stop | shutdown | reset     control the VM
  delete | recreate-folders           destructive, confirm twice
  confirm (yes) | abort (no)          answer a pending confirmation
  download <kind> [dir]               evidence-disk, memory-dump, screenshots, pcap
  cancel <task>                       cancel a running task
  reconnect                           retry after the API key was rejected
  quit";

/// What an input line asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(Command),
    Help,
    Quit,
    Empty,
}

/// Parse one line typed into the watch session
pub fn parse_console_line(line: &str, default_dir: &Path) -> std::result::Result<ConsoleInput, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(ConsoleInput::Empty);
    };
    let args: Vec<&str> = words.collect();

    let command = match verb.to_ascii_lowercase().as_str() {
        "help" | "?" => return Ok(ConsoleInput::Help),
        "quit" | "exit" | "q" => return Ok(ConsoleInput::Quit),
        "convert" => Command::Convert,
        "link" => Command::Link,
        "start" => Command::Start,
        "stop" => Command::Stop,
        "shutdown" => Command::Shutdown,
        "reset" => Command::Reset,
        "delete" => Command::Delete,
        "recreate-folders" | "recreate" => Command::RecreateFolders,
        "confirm" | "yes" | "y" => Command::Confirm,
        "abort" | "no" | "n" => Command::Abort,
        "reconnect" => Command::Reconnect,
        "download" => {
            let kind: ArtifactKind = args
                .first()
                .ok_or_else(|| "usage: download <kind> [dir]".to_string())?
                .parse()
                .map_err(|e: forensicvm_common::Error| e.to_string())?;
            let dest_dir = args
                .get(1)
                .map(PathBuf::from)
                .unwrap_or_else(|| default_dir.to_path_buf());
            Command::Download { kind, dest_dir }
        }
        "cancel" => {
            let id = args
                .first()
                .and_then(|id| id.parse().ok())
                .ok_or_else(|| "usage: cancel <task>".to_string())?;
            Command::CancelTask(id)
        }
        other => return Err(format!("unknown command: {} (try `help`)", other)),
    };
    Ok(ConsoleInput::Command(command))
}

/// Lines worth printing when the view moves from `prev` to `next`
pub fn render_changes(prev: &ConsoleView, next: &ConsoleView) -> Vec<String> {
    let mut lines = Vec::new();

    if prev.phase != next.phase {
        let actions: Vec<&str> = next.affordances.iter().map(|a| a.as_str()).collect();
        lines.push(format!("{} [{}]", next.phase, actions.join(" ")));
    }
    if prev.banner != next.banner {
        if let Some(banner) = &next.banner {
            lines.push(format!("! {}", banner));
        }
    }
    if prev.pending_confirmation != next.pending_confirmation {
        if let Some(action) = next.pending_confirmation {
            lines.push(format!("{} pending: type `confirm` or `abort`", action));
        }
    }
    for task in &next.tasks {
        if !prev.tasks.iter().any(|t| t.id == task.id) {
            lines.push(format!("task {} started: {}", task.id, task.kind));
        }
    }
    if prev.last_message != next.last_message {
        if let Some(message) = &next.last_message {
            lines.push(message.clone());
        }
    }
    lines
}

pub async fn execute(ctx: &Context) -> Result<()> {
    let case = ctx.case()?;
    let client = ctx.client()?;
    let share = ctx.config.share.with_case_override(&case)?;
    let default_dir = case.case_image_folder()?;

    let reconciler = LifecycleReconciler::new(case, share, client, Arc::new(ctx.tunnel()))?
        .with_poll_interval(ctx.config.server.poll_interval());
    print_info(&format!("Watching VM {} (type `help` for commands)", reconciler.vm_id()));

    let (commands, command_rx) = mpsc::channel(16);
    let (view_tx, mut view_rx) = watch::channel(reconciler.view());
    let shutdown = CancellationToken::new();
    let session = tokio::spawn(reconciler.run(command_rx, view_tx, shutdown.clone()));

    let printer = tokio::spawn(async move {
        let mut last = view_rx.borrow().clone();
        while view_rx.changed().await.is_ok() {
            let next = view_rx.borrow_and_update().clone();
            for line in render_changes(&last, &next) {
                println!("{}", line);
            }
            last = next;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        match parse_console_line(&line, &default_dir) {
            Ok(ConsoleInput::Empty) => {}
            Ok(ConsoleInput::Help) => println!("{}", HELP),
            Ok(ConsoleInput::Quit) => break,
            Ok(ConsoleInput::Command(command)) => {
                let (reply, outcome) = oneshot::channel();
                if commands.send(CommandRequest { command, reply }).await.is_err() {
                    break;
                }
                match outcome.await {
                    Ok(Ok(outcome)) => print_info(&describe_outcome(&outcome)),
                    Ok(Err(e)) => print_error(&e.to_string()),
                    Err(_) => break,
                }
            }
            Err(message) => print_error(&message),
        }
    }

    shutdown.cancel();
    let _ = session.await;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::{Affordances, Phase, PendingAction};
    use forensicvm_common::RunningMode;

    fn dir() -> PathBuf {
        PathBuf::from("/cases/c1")
    }

    fn parse(line: &str) -> ConsoleInput {
        parse_console_line(line, &dir()).unwrap()
    }

    #[test]
    fn test_parse_lifecycle_words() {
        assert_eq!(parse("start"), ConsoleInput::Command(Command::Start));
        assert_eq!(parse("  STOP "), ConsoleInput::Command(Command::Stop));
        assert_eq!(parse("recreate"), ConsoleInput::Command(Command::RecreateFolders));
        assert_eq!(parse("yes"), ConsoleInput::Command(Command::Confirm));
        assert_eq!(parse("no"), ConsoleInput::Command(Command::Abort));
        assert_eq!(parse(""), ConsoleInput::Empty);
        assert_eq!(parse("exit"), ConsoleInput::Quit);
    }

    #[test]
    fn test_parse_download() {
        assert_eq!(
            parse("download pcap"),
            ConsoleInput::Command(Command::Download {
                kind: ArtifactKind::Pcap,
                dest_dir: dir(),
            })
        );
        assert_eq!(
            parse("download memory /tmp/out"),
            ConsoleInput::Command(Command::Download {
                kind: ArtifactKind::MemoryDump,
                dest_dir: PathBuf::from("/tmp/out"),
            })
        );
        assert!(parse_console_line("download", &dir()).is_err());
        assert!(parse_console_line("download floppy", &dir()).is_err());
    }

    #[test]
    fn test_parse_cancel_and_unknown() {
        assert_eq!(parse("cancel 7"), ConsoleInput::Command(Command::CancelTask(7)));
        assert!(parse_console_line("cancel seven", &dir()).is_err());
        assert!(parse_console_line("format c:", &dir()).is_err());
    }

    fn view(phase: Phase) -> ConsoleView {
        ConsoleView {
            vm_id: forensicvm_common::resolve("img", "case").unwrap(),
            case_name: "case".to_string(),
            phase,
            websocket_port: None,
            affordances: Affordances::for_phase(phase),
            banner: None,
            pending_confirmation: None,
            tasks: Vec::new(),
            last_message: None,
            reachability: None,
        }
    }

    #[test]
    fn test_render_changes() {
        let prev = view(Phase::VmAbsent);
        assert!(render_changes(&prev, &prev).is_empty());

        let mut next = view(Phase::VmStopped { mode: RunningMode::Copy });
        next.pending_confirmation = Some(PendingAction::Delete);
        let lines = render_changes(&prev, &next);
        assert!(lines[0].starts_with("vm stopped (copy) [start delete"));
        assert_eq!(lines[1], "delete pending: type `confirm` or `abort`");
    }
}
