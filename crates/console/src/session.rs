//! Per-session state owned by the reconciler

use forensicvm_common::{ServerReachability, VmState, VmStatus};

/// Process-local flags, reset when a session starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub server_offline: bool,
    pub evidence_folders_created: bool,
    pub first_poll_done: bool,
    pub provisioning_in_flight: bool,
    /// The API key was rejected; probing is paused until a reconnect
    pub auth_rejected: bool,
}

impl SessionFlags {
    /// Claim the provisioning slot. Only succeeds once per session unless a
    /// previous attempt failed.
    pub fn begin_provisioning(&mut self, state: VmState) -> bool {
        if state != VmState::Stopped || self.evidence_folders_created || self.provisioning_in_flight {
            return false;
        }
        self.provisioning_in_flight = true;
        true
    }

    pub fn finish_provisioning(&mut self, success: bool) {
        self.provisioning_in_flight = false;
        if success {
            self.evidence_folders_created = true;
        }
    }
}

/// Everything the reconciler knows about the session
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub flags: SessionFlags,
    pub reachability: Option<ServerReachability>,
    pub status: Option<VmStatus>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }
}
