//! Core types for the ForensicVM console

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Deterministic VM identifier, primary key of every remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(pub Uuid);

impl VmId {
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Case inputs the session was started with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseIdentity {
    pub image_path: String,
    pub case_directory: String,
    pub case_name: String,
    #[serde(default = "default_dash")]
    pub case_number: String,
    #[serde(default = "default_dash")]
    pub case_examiner: String,
}

fn default_dash() -> String {
    "-".to_string()
}

impl CaseIdentity {
    pub fn new(
        image_path: impl Into<String>,
        case_directory: impl Into<String>,
        case_name: impl Into<String>,
    ) -> Self {
        Self {
            image_path: image_path.into(),
            case_directory: case_directory.into(),
            case_name: case_name.into(),
            case_number: default_dash(),
            case_examiner: default_dash(),
        }
    }

    /// VM identifier for this case
    pub fn vm_id(&self) -> Result<VmId> {
        crate::identity::resolve(&self.image_path, &self.case_name)
    }

    /// Per-case working folder, `<case_directory>/<uuid>`
    pub fn case_image_folder(&self) -> Result<PathBuf> {
        Ok(Path::new(&self.case_directory).join(self.vm_id()?.to_string()))
    }

    /// Case tag export written by the forensic suite plugin
    pub fn case_tags_path(&self) -> PathBuf {
        Path::new(&self.case_directory).join("case_tags.json")
    }

    /// Load a case file written by an earlier session
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let case: Self = serde_json::from_str(&content)?;
        case.vm_id()?;
        Ok(case)
    }

    /// Persist the case so later sessions reattach to the same VM
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Server reachability derived from the auth probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerReachability {
    pub reachable: bool,
    pub last_checked_at: i64,
}

impl ServerReachability {
    pub fn now(reachable: bool) -> Self {
        Self {
            reachable,
            last_checked_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Local wall-clock time of the last check
    pub fn checked_label(&self) -> String {
        match chrono::DateTime::from_timestamp(self.last_checked_at, 0) {
            Some(at) => at.with_timezone(&chrono::Local).format("%H:%M:%S").to_string(),
            None => "-".to_string(),
        }
    }
}

/// VM state as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Absent,
    Stopped,
    Running,
}

impl Default for VmState {
    fn default() -> Self {
        Self::Absent
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Absent => write!(f, "absent"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::Running => write!(f, "running"),
        }
    }
}

/// Whether the VM disk is a full copy or a differencing link to the share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningMode {
    Copy,
    Snap,
}

impl Default for RunningMode {
    fn default() -> Self {
        Self::Copy
    }
}

impl RunningMode {
    /// Value passed to the conversion tool's `--copy` flag
    pub fn as_flag(&self) -> &'static str {
        match self {
            RunningMode::Copy => "copy",
            RunningMode::Snap => "snap",
        }
    }
}

impl std::fmt::Display for RunningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_flag())
    }
}

impl std::str::FromStr for RunningMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "copy" => Ok(RunningMode::Copy),
            "snap" | "snapshot" => Ok(RunningMode::Snap),
            other => Err(Error::Application(format!("unknown running mode: {}", other))),
        }
    }
}

/// VM status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatus {
    pub exists: bool,
    pub state: VmState,
    pub running_mode: RunningMode,
    pub websocket_port: Option<u16>,
}

impl VmStatus {
    /// No VM object exists yet for the id
    pub fn absent() -> Self {
        Self {
            exists: false,
            state: VmState::Absent,
            running_mode: RunningMode::Copy,
            websocket_port: None,
        }
    }

    pub fn stopped(running_mode: RunningMode) -> Self {
        Self {
            exists: true,
            state: VmState::Stopped,
            running_mode,
            websocket_port: None,
        }
    }

    pub fn running(running_mode: RunningMode, websocket_port: Option<u16>) -> Self {
        Self {
            exists: true,
            state: VmState::Running,
            running_mode,
            websocket_port,
        }
    }
}

/// Snapshot listed for a VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub tag: String,
    pub size_mb: f64,
}

static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(([^()]+)\)").expect("valid tag pattern"));
static SIZE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(MiB|MB|GiB|GB)\b").expect("valid size pattern"));

impl SnapshotEntry {
    /// Parse a display line such as `1 (before-triage) 512.5 MB 2023-05-01`.
    ///
    /// Returns `None` when the line carries no bracketed tag.
    pub fn parse_display(line: &str) -> Option<Self> {
        let tag = TAG_PATTERN.captures(line)?.get(1)?.as_str().trim().to_string();
        if tag.is_empty() {
            return None;
        }

        let size_mb = SIZE_PATTERN
            .captures(line)
            .and_then(|c| {
                let value: f64 = c.get(1)?.as_str().parse().ok()?;
                let unit = c.get(2)?.as_str().to_ascii_lowercase();
                Some(if unit.starts_with('g') { value * 1024.0 } else { value })
            })
            .unwrap_or(0.0);

        Some(Self { tag, size_mb })
    }

    /// Parse a listing, keeping creation order and dropping duplicate tags
    pub fn parse_listing<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<Self> {
        let mut entries: Vec<Self> = Vec::new();
        for line in lines {
            if let Some(entry) = Self::parse_display(line) {
                if !entries.iter().any(|e| e.tag == entry.tag) {
                    entries.push(entry);
                }
            }
        }
        entries
    }
}

/// Artifacts that can be downloaded from a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    EvidenceDisk,
    MemoryDump,
    Screenshots,
    Pcap,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::EvidenceDisk,
        ArtifactKind::MemoryDump,
        ArtifactKind::Screenshots,
        ArtifactKind::Pcap,
    ];

    /// Endpoint segment under `/api/`
    pub fn endpoint(&self) -> &'static str {
        match self {
            ArtifactKind::EvidenceDisk => "download-evidence",
            ArtifactKind::MemoryDump => "download-memory-dump",
            ArtifactKind::Screenshots => "download-screenshots",
            ArtifactKind::Pcap => "download_pcap",
        }
    }

    /// Extension used when the server does not name the file
    pub fn default_extension(&self) -> &'static str {
        match self {
            ArtifactKind::EvidenceDisk => "qcow2",
            ArtifactKind::MemoryDump => "raw",
            ArtifactKind::Screenshots => "zip",
            ArtifactKind::Pcap => "pcap",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::EvidenceDisk => "evidence-disk",
            ArtifactKind::MemoryDump => "memory-dump",
            ArtifactKind::Screenshots => "screenshots",
            ArtifactKind::Pcap => "pcap",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evidence-disk" | "evidence" => Ok(ArtifactKind::EvidenceDisk),
            "memory-dump" | "memory" => Ok(ArtifactKind::MemoryDump),
            "screenshots" => Ok(ArtifactKind::Screenshots),
            "pcap" => Ok(ArtifactKind::Pcap),
            other => Err(Error::InvalidConfig(format!("unknown artifact kind: {}", other))),
        }
    }
}

/// Plugin installed on the forensic VM server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub dir: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_label() {
        let reachability = ServerReachability::now(true);
        let label = reachability.checked_label();
        assert_eq!(label.len(), 8);
        assert_eq!(label.matches(':').count(), 2);

        let bogus = ServerReachability {
            reachable: false,
            last_checked_at: i64::MAX,
        };
        assert_eq!(bogus.checked_label(), "-");
    }

    #[test]
    fn test_snapshot_tag_from_display() {
        let entry = SnapshotEntry::parse_display("1 (before-triage) 512.5 MB 2023-05-01 10:00").unwrap();
        assert_eq!(entry.tag, "before-triage");
        assert_eq!(entry.size_mb, 512.5);
    }

    #[test]
    fn test_snapshot_size_in_gb_and_missing() {
        let entry = SnapshotEntry::parse_display("snap (s1) 2 GiB").unwrap();
        assert_eq!(entry.size_mb, 2048.0);

        let entry = SnapshotEntry::parse_display("(s2)").unwrap();
        assert_eq!(entry.size_mb, 0.0);
    }

    #[test]
    fn test_snapshot_listing_skips_untagged_and_duplicates() {
        let lines = ["ID TAG SIZE", "1 (a) 10 MB", "2 (b) 20 MB", "3 (a) 30 MB", "()"];
        let entries = SnapshotEntry::parse_listing(lines);
        let tags: Vec<_> = entries.iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, vec!["a", "b"]);
        assert_eq!(entries[0].size_mb, 10.0);
    }

    #[test]
    fn test_artifact_kind_round_trip_names() {
        for kind in ArtifactKind::ALL {
            assert_eq!(kind.as_str().parse::<ArtifactKind>().unwrap(), kind);
        }
        assert_eq!(ArtifactKind::Pcap.endpoint(), "download_pcap");
        assert!("dump".parse::<ArtifactKind>().is_err());
    }

    #[test]
    fn test_running_mode_flags() {
        assert_eq!("snap".parse::<RunningMode>().unwrap(), RunningMode::Snap);
        assert_eq!("COPY".parse::<RunningMode>().unwrap().as_flag(), "copy");
    }

    #[test]
    fn test_case_identity_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("case-config.json");

        let case = CaseIdentity::new(r"D:\img\case1.E01", r"C:\cases\c1", "CASE1");
        case.save(&path).unwrap();
        let loaded = CaseIdentity::load(&path).unwrap();

        assert_eq!(loaded, case);
        assert_eq!(loaded.case_number, "-");
        assert_eq!(loaded.vm_id().unwrap(), case.vm_id().unwrap());
    }
}
