//! ForensicVM console
//!
//! Drives a forensic image through its VM lifecycle on a remote forensic VM
//! server: materializing the VM over a reverse SSH tunnel to the examiner's
//! share, controlling it through the server's HTTP API and collecting the
//! evidence it produces.

pub mod client;
pub mod commands;
pub mod config;
pub mod output;
pub mod provisioner;
pub mod reconciler;
pub mod session;
pub mod tunnel;
pub mod worker;

pub use client::{ControlPlane, RemoteControlClient};
pub use config::ConsoleConfig;
pub use reconciler::{Command, CommandOutcome, LifecycleReconciler, Phase};
pub use tunnel::{OpenSshTunnel, TunnelLauncher};
