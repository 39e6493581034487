//! Reverse SSH tunnel to the examiner's SMB share
//!
//! A VM is materialized by the forensic server reading the image straight off
//! the examiner's Windows share. The share is exposed on the server through a
//! reverse forward carried by the system `ssh` client:
//!
//! 1. a short negotiation session asks the server for a free port (`-R 0:...`)
//! 2. a long-lived session binds that port and runs the conversion tool (or
//!    the keep-alive script for snapshot-mode VMs) on the server

use async_trait::async_trait;
use forensicvm_common::{Error, Result, RunningMode, TunnelStage, VmId};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::{ShareConfig, SshConfig};

/// SMB port on the share host
pub const SMB_PORT: u16 = 445;

const SSH_KEYGEN: &str = "ssh-keygen";

static ALLOCATED_PORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Allocated port (\d+) for remote forward").expect("valid port pattern"));

/// What the long-lived session runs on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Convert the image into a VM; `Copy` blocks until conversion finishes
    Convert(RunningMode),
    /// Keep the share reachable for an existing snapshot-mode VM
    KeepAlive,
}

/// Stdio wiring of the long-lived session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionIo {
    /// Shares the console's terminal
    Inherit,
    Detached,
}

/// The blocking copy conversion reports on the console's terminal. The
/// keep-alive script waits for a `y` on stdin, so it keeps the terminal unless
/// a launcher gives it a window of its own.
fn session_io(mode: TunnelMode, terminal: &[String]) -> SessionIo {
    match mode {
        TunnelMode::Convert(RunningMode::Copy) => SessionIo::Inherit,
        TunnelMode::KeepAlive if terminal.is_empty() => SessionIo::Inherit,
        _ => SessionIo::Detached,
    }
}

#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub vm_id: VmId,
    pub image_path: String,
    pub share: ShareConfig,
    pub mode: TunnelMode,
}

/// A reverse forward that was established
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    pub remote_ephemeral_port: u16,
    pub local_share_host: String,
    pub local_share_name: String,
}

/// Launches reverse tunnels
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn launch(&self, request: &TunnelRequest) -> Result<TunnelHandle>;
}

/// Split `\\host\share` into its host and share name
pub fn parse_windows_share(share: &str) -> Result<(String, String)> {
    let trimmed = share
        .trim()
        .trim_start_matches(['\\', '/'])
        .trim_end_matches(['\\', '/']);
    let (host, name) = trimmed
        .split_once(['\\', '/'])
        .ok_or_else(|| Error::tunnel(TunnelStage::Parse, format!("malformed share address: {:?}", share)))?;

    if host.is_empty() || name.is_empty() || name.contains(['\\', '/']) {
        return Err(Error::tunnel(
            TunnelStage::Parse,
            format!("malformed share address: {:?}", share),
        ));
    }
    Ok((host.to_string(), name.to_string()))
}

/// Map a local image path to its location under the share root.
///
/// The equivalence prefix is compared case-insensitively, as Windows paths
/// are. The result always uses `/` and starts with one.
pub fn rewrite_image_path(image_path: &str, equivalence: &str) -> String {
    let image = image_path.trim().replace('\\', "/");
    let prefix = equivalence.trim().replace('\\', "/");
    let prefix = prefix.trim_end_matches('/');

    let mut relative = image.as_str();
    if !prefix.is_empty() && image.is_char_boundary(prefix.len()) && image.len() >= prefix.len() {
        let (head, rest) = image.split_at(prefix.len());
        if head.eq_ignore_ascii_case(prefix) && (rest.is_empty() || rest.starts_with('/')) {
            relative = rest;
        }
    }

    format!("/{}", relative.trim_start_matches('/'))
}

/// Port number from an `Allocated port N for remote forward` line
pub fn parse_allocated_port(line: &str) -> Option<u16> {
    ALLOCATED_PORT.captures(line)?.get(1)?.as_str().parse().ok()
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Conversion tool invocation run on the server
pub fn conversion_command(
    ssh: &SshConfig,
    share: &ShareConfig,
    share_name: &str,
    image_path: &str,
    vm_id: &VmId,
    mode: RunningMode,
    port: u16,
) -> String {
    [
        "sudo".to_string(),
        ssh.conversion_tool.clone(),
        "--windows-share".to_string(),
        shell_quote(share_name),
        "--share-login".to_string(),
        shell_quote(&share.login),
        "--share-password".to_string(),
        shell_quote(&share.password),
        "--forensic-image-path".to_string(),
        shell_quote(image_path),
        "--folder-uuid".to_string(),
        vm_id.to_string(),
        "--copy".to_string(),
        mode.as_flag().to_string(),
        "--share-port".to_string(),
        port.to_string(),
    ]
    .join(" ")
}

/// Tunnel launcher backed by the system OpenSSH client
pub struct OpenSshTunnel {
    ssh: SshConfig,
    share_port: u16,
    probe_timeout: Duration,
    settle: Duration,
}

impl OpenSshTunnel {
    pub fn new(ssh: SshConfig) -> Self {
        Self {
            ssh,
            share_port: SMB_PORT,
            probe_timeout: Duration::from_secs(3),
            settle: Duration::from_secs(3),
        }
    }

    pub fn with_share_port(mut self, port: u16) -> Self {
        self.share_port = port;
        self
    }

    /// How long a detached session must stay up to count as live
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn public_key_path(&self) -> PathBuf {
        let mut path = self.ssh.key_path.clone().into_os_string();
        path.push(".pub");
        PathBuf::from(path)
    }

    fn auth_args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.ssh.key_path.display().to_string(),
            "-p".to_string(),
            self.ssh.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
        ]
    }

    /// Arguments of the long-lived session, after the ssh binary
    pub fn session_args(&self, share_host: &str, port: u16, remote_command: &str) -> Vec<String> {
        let mut args = vec!["-t".to_string()];
        args.extend(self.auth_args());
        args.push("-o".to_string());
        args.push("ExitOnForwardFailure=yes".to_string());
        args.push("-R".to_string());
        args.push(format!("{}:{}:{}", port, share_host, self.share_port));
        args.push(self.ssh.destination());
        args.push(remote_command.to_string());
        args
    }

    fn negotiate_args(&self, share_host: &str) -> Vec<String> {
        let mut args = vec!["-N".to_string()];
        args.extend(self.auth_args());
        for option in ["BatchMode=yes", "ExitOnForwardFailure=yes"] {
            args.push("-o".to_string());
            args.push(option.to_string());
        }
        args.push("-R".to_string());
        args.push(format!("0:{}:{}", share_host, self.share_port));
        args.push(self.ssh.destination());
        args
    }

    async fn probe_share(&self, host: &str) -> Result<()> {
        let address = format!("{}:{}", host, self.share_port);
        match tokio::time::timeout(self.probe_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::tunnel(
                TunnelStage::ShareUnreachable,
                format!("{}: {}", address, e),
            )),
            Err(_) => Err(Error::tunnel(
                TunnelStage::ShareUnreachable,
                format!("{}: connection timed out", address),
            )),
        }
    }

    /// Ask the server for a free port, then drop the negotiation session
    async fn negotiate(&self, share_host: &str) -> Result<u16> {
        let args = self.negotiate_args(share_host);
        debug!("Negotiating reverse forward: {} {}", self.ssh.ssh_binary, args.join(" "));

        let mut child = Command::new(&self.ssh.ssh_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::tunnel(TunnelStage::Negotiate, format!("failed to spawn ssh: {}", e)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::tunnel(TunnelStage::Negotiate, "ssh stderr not captured"))?;

        let read = async {
            let mut lines = BufReader::new(stderr).lines();
            let mut last = String::new();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| Error::tunnel(TunnelStage::Negotiate, e.to_string()))?
            {
                if let Some(port) = parse_allocated_port(&line) {
                    return Ok(port);
                }
                debug!("ssh: {}", line);
                if !line.trim().is_empty() {
                    last = line;
                }
            }
            Err(Error::tunnel(
                TunnelStage::Negotiate,
                if last.is_empty() {
                    "ssh exited before a port was allocated".to_string()
                } else {
                    last
                },
            ))
        };

        let result = match tokio::time::timeout(self.ssh.negotiate_timeout(), read).await {
            Ok(result) => result,
            Err(_) => Err(Error::tunnel(
                TunnelStage::Negotiate,
                format!("no port allocated within {:?}", self.ssh.negotiate_timeout()),
            )),
        };

        if let Err(e) = child.kill().await {
            debug!("Negotiation session already gone: {}", e);
        }
        result
    }

    fn session_command(&self, args: &[String], io: SessionIo) -> Command {
        let mut command = match self.ssh.terminal.split_first() {
            Some((launcher, prefix)) => {
                let mut command = Command::new(launcher);
                command.args(prefix).arg(&self.ssh.ssh_binary);
                command
            }
            None => Command::new(&self.ssh.ssh_binary),
        };
        command.args(args);
        if io == SessionIo::Detached {
            command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        }
        command
    }

    /// Wait out the settle window; a session still running afterwards is live
    async fn confirm_live(&self, mut child: Child) -> Result<()> {
        match tokio::time::timeout(self.settle, child.wait()).await {
            Err(_) => {
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) => info!("Tunnel session ended ({})", status),
                        Err(e) => warn!("Tunnel session wait failed: {}", e),
                    }
                });
                Ok(())
            }
            // A terminal launcher hands the session off and returns
            Ok(Ok(status)) if status.success() && !self.ssh.terminal.is_empty() => Ok(()),
            Ok(Ok(status)) => Err(Error::tunnel(
                TunnelStage::Session,
                format!("session exited early ({})", status),
            )),
            Ok(Err(e)) => Err(Error::tunnel(TunnelStage::Session, e.to_string())),
        }
    }

    /// Check key-based login by running a trivial remote command
    pub async fn probe(&self) -> Result<String> {
        let output = Command::new(&self.ssh.ssh_binary)
            .args(self.auth_args())
            .args(["-o", "BatchMode=yes"])
            .arg(self.ssh.destination())
            .arg("ls -al")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.ssh.negotiate_timeout(), output)
            .await
            .map_err(|_| Error::tunnel(TunnelStage::Key, "ssh login timed out"))?
            .map_err(|e| Error::tunnel(TunnelStage::Key, format!("failed to spawn ssh: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(Error::tunnel(
                TunnelStage::Key,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Generate the RSA key pair when missing. Returns whether a key was created.
    pub async fn ensure_keypair(&self) -> Result<bool> {
        if self.ssh.key_path.exists() {
            return Ok(false);
        }
        if let Some(parent) = self.ssh.key_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Generating SSH key pair at {}", self.ssh.key_path.display());
        let output = Command::new(SSH_KEYGEN)
            .args(["-t", "rsa", "-b", "2048", "-N", "", "-q", "-f"])
            .arg(&self.ssh.key_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::tunnel(TunnelStage::Key, format!("failed to run {}: {}", SSH_KEYGEN, e)))?;

        if !output.status.success() {
            return Err(Error::tunnel(
                TunnelStage::Key,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(true)
    }
}

#[async_trait]
impl TunnelLauncher for OpenSshTunnel {
    async fn launch(&self, request: &TunnelRequest) -> Result<TunnelHandle> {
        let (share_host, share_name) = parse_windows_share(&request.share.windows_share)?;
        let image_path = rewrite_image_path(&request.image_path, &request.share.equivalence);

        self.probe_share(&share_host).await?;
        let port = self.negotiate(&share_host).await?;
        info!("Server allocated port {} for share {}\\{}", port, share_host, share_name);

        let remote_command = match request.mode {
            TunnelMode::Convert(mode) => conversion_command(
                &self.ssh,
                &request.share,
                &share_name,
                &image_path,
                &request.vm_id,
                mode,
                port,
            ),
            TunnelMode::KeepAlive => self.ssh.wait_command.clone(),
        };

        let handle = TunnelHandle {
            remote_ephemeral_port: port,
            local_share_host: share_host.clone(),
            local_share_name: share_name,
        };

        let args = self.session_args(&share_host, port, &remote_command);
        let blocking = request.mode == TunnelMode::Convert(RunningMode::Copy);
        let mut session = self.session_command(&args, session_io(request.mode, &self.ssh.terminal));
        let mut child = session
            .spawn()
            .map_err(|e| Error::tunnel(TunnelStage::Session, format!("failed to spawn ssh: {}", e)))?;

        if blocking {
            info!("Converting {} (copy); waiting for the session to finish", request.vm_id);
            let status = child
                .wait()
                .await
                .map_err(|e| Error::tunnel(TunnelStage::Session, e.to_string()))?;
            if !status.success() {
                return Err(Error::tunnel(
                    TunnelStage::Session,
                    format!("session exited with {}", status),
                ));
            }
        } else {
            self.confirm_live(child).await?;
            info!("Tunnel session live on remote port {}", port);
        }

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> VmId {
        forensicvm_common::resolve(r"D:\img\case1.E01", "CASE1").unwrap()
    }

    #[test]
    fn test_parse_windows_share() {
        assert_eq!(
            parse_windows_share(r"\\127.0.0.1\share").unwrap(),
            ("127.0.0.1".to_string(), "share".to_string())
        );
        assert_eq!(
            parse_windows_share(r"\\fileserver\evidence\").unwrap(),
            ("fileserver".to_string(), "evidence".to_string())
        );
        for bad in ["", r"\\hostonly", r"\\\share", r"\\h\a\b"] {
            match parse_windows_share(bad) {
                Err(Error::Tunnel { stage, .. }) => assert_eq!(stage, TunnelStage::Parse),
                other => panic!("{:?} parsed as {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_rewrite_image_path() {
        assert_eq!(
            rewrite_image_path(r"\\127.0.0.1\share\sub\img.E01", r"\\127.0.0.1\share"),
            "/sub/img.E01"
        );
        assert_eq!(rewrite_image_path(r"D:\Evidence\disk.E01", r"d:\evidence\"), "/disk.E01");
        // prefix must end on a path boundary
        assert_eq!(rewrite_image_path(r"D:\evidence2\disk.E01", r"D:\evidence"), "/D:/evidence2/disk.E01");
        assert_eq!(rewrite_image_path(r"D:\evidence\disk.E01", ""), "/D:/evidence/disk.E01");
    }

    #[test]
    fn test_parse_allocated_port() {
        assert_eq!(
            parse_allocated_port("Allocated port 41234 for remote forward to 127.0.0.1:445"),
            Some(41234)
        );
        assert_eq!(parse_allocated_port("Warning: Permanently added"), None);
        assert_eq!(parse_allocated_port("Allocated port 99999 for remote forward"), None);
    }

    #[test]
    fn test_conversion_command() {
        let ssh = SshConfig::default();
        let share = ShareConfig {
            windows_share: r"\\127.0.0.1\share".to_string(),
            login: "examiner".to_string(),
            password: "p@ss word".to_string(),
            equivalence: String::new(),
        };
        let command = conversion_command(&ssh, &share, "share", "/sub/img.E01", &vm(), RunningMode::Snap, 40001);

        assert!(command.starts_with("sudo /forensicVM/bin/run-or-convert.sh --windows-share share"));
        assert!(command.contains("--share-login examiner"));
        assert!(command.contains("--share-password 'p@ss word'"));
        assert!(command.contains("--forensic-image-path /sub/img.E01"));
        assert!(command.contains(&format!("--folder-uuid {}", vm())));
        assert!(command.ends_with("--copy snap --share-port 40001"));
    }

    #[test]
    fn test_keep_alive_session_keeps_terminal() {
        let window = vec!["cmd".to_string(), "/c".to_string(), "start".to_string(), "/wait".to_string()];
        assert_eq!(session_io(TunnelMode::KeepAlive, &[]), SessionIo::Inherit);
        assert_eq!(session_io(TunnelMode::KeepAlive, &window), SessionIo::Detached);
        assert_eq!(session_io(TunnelMode::Convert(RunningMode::Copy), &[]), SessionIo::Inherit);
        assert_eq!(session_io(TunnelMode::Convert(RunningMode::Copy), &window), SessionIo::Inherit);
        assert_eq!(session_io(TunnelMode::Convert(RunningMode::Snap), &[]), SessionIo::Detached);
    }

    #[test]
    fn test_session_args() {
        let ssh = SshConfig {
            host: "10.0.0.5".to_string(),
            port: 2222,
            ..Default::default()
        };
        let tunnel = OpenSshTunnel::new(ssh);
        let args = tunnel.session_args("127.0.0.1", 40001, "/home/forensicinvestigator/wait-y.sh");

        assert_eq!(args[0], "-t");
        let joined = args.join(" ");
        assert!(joined.contains("-p 2222"));
        assert!(joined.contains("-R 40001:127.0.0.1:445"));
        assert!(joined.contains("forensicinvestigator@10.0.0.5"));
        assert_eq!(args.last().unwrap(), "/home/forensicinvestigator/wait-y.sh");
    }

    #[tokio::test]
    async fn test_unreachable_share_fails_before_ssh() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let ssh = SshConfig {
            ssh_binary: "/nonexistent/ssh".to_string(),
            ..Default::default()
        };
        let tunnel = OpenSshTunnel::new(ssh).with_share_port(port);
        let request = TunnelRequest {
            vm_id: vm(),
            image_path: r"\\127.0.0.1\share\img.E01".to_string(),
            share: ShareConfig {
                windows_share: r"\\127.0.0.1\share".to_string(),
                ..Default::default()
            },
            mode: TunnelMode::KeepAlive,
        };

        match tunnel.launch(&request).await {
            Err(Error::Tunnel { stage, .. }) => assert_eq!(stage, TunnelStage::ShareUnreachable),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[cfg(unix)]
    fn fake_ssh(dir: &std::path::Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_with_fake_ssh() {
        let dir = tempfile::tempdir().unwrap();
        let share = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let share_port = share.local_addr().unwrap().port();
        let args_file = dir.path().join("session-args");

        let working = fake_ssh(
            dir.path(),
            "ssh-ok",
            &format!(
                r#"for arg in "$@"; do
  if [ "$arg" = "-N" ]; then
    echo "Allocated port 40001 for remote forward to 127.0.0.1:{port}" >&2
    exec sleep 30
  fi
done
echo "$@" > "{file}"
exec sleep 5"#,
                port = share_port,
                file = args_file.display()
            ),
        );
        let request = TunnelRequest {
            vm_id: vm(),
            image_path: r"\\127.0.0.1\share\img.E01".to_string(),
            share: ShareConfig {
                windows_share: r"\\127.0.0.1\share".to_string(),
                ..Default::default()
            },
            mode: TunnelMode::KeepAlive,
        };

        let tunnel = OpenSshTunnel::new(SshConfig {
            ssh_binary: working,
            host: "forensic.local".to_string(),
            ..Default::default()
        })
        .with_share_port(share_port)
        .with_settle(Duration::from_millis(300));

        let handle = tunnel.launch(&request).await.unwrap();
        assert_eq!(handle.remote_ephemeral_port, 40001);
        assert_eq!(handle.local_share_host, "127.0.0.1");
        assert_eq!(handle.local_share_name, "share");

        let recorded = std::fs::read_to_string(&args_file).unwrap();
        assert!(recorded.contains(&format!("-R 40001:127.0.0.1:{}", share_port)));
        assert!(recorded.contains("/home/forensicinvestigator/wait-y.sh"));

        let refused = fake_ssh(
            dir.path(),
            "ssh-denied",
            r#"echo "forensicinvestigator@forensic.local: Permission denied (publickey)." >&2
exit 255"#,
        );
        let tunnel = OpenSshTunnel::new(SshConfig {
            ssh_binary: refused,
            ..Default::default()
        })
        .with_share_port(share_port);

        match tunnel.launch(&request).await {
            Err(Error::Tunnel { stage, cause }) => {
                assert_eq!(stage, TunnelStage::Negotiate);
                assert!(cause.contains("Permission denied"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
