//! Console configuration

use forensicvm_common::{CaseIdentity, Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// File holding the share settings of a single case, inside its uuid folder
pub const CASE_SHARE_FILE: &str = "image-share.json";

/// Console configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Control-plane API access
    pub server: ServerConfig,

    /// SSH host that carries the reverse tunnel
    pub ssh: SshConfig,

    /// Local Windows share exposing the forensic image
    pub share: ShareConfig,
}

/// Control-plane configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Base address of the forensic VM server
    pub address: String,

    /// API key sent as `X-API-KEY`
    pub api_key: String,

    /// Reconciliation tick
    pub poll_interval_ms: u64,

    /// Timeout applied to every control-plane request except downloads/uploads
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            api_key: String::new(),
            poll_interval_ms: 1000,
            request_timeout_secs: 3,
        }
    }
}

impl ServerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Base URL with a scheme and without trailing slashes
    pub fn base_url(&self) -> String {
        let trimmed = self.address.trim().trim_end_matches('/');
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        }
    }
}

/// SSH configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,

    pub port: u16,

    /// Remote account provisioned for investigators
    pub username: String,

    /// Private key used for every session
    pub key_path: PathBuf,

    /// OpenSSH client binary
    pub ssh_binary: String,

    /// Launcher prefix for the interactive session, e.g. `["cmd", "/c", "start", "/wait"]`.
    /// Empty runs the copy conversion and the keep-alive session attached to the
    /// current terminal, whose stdin answers the keep-alive script's `y` prompt.
    /// A snap conversion always runs detached.
    pub terminal: Vec<String>,

    /// Conversion/link tool on the hypervisor host
    pub conversion_tool: String,

    /// Remote script holding a keep-alive tunnel open
    pub wait_command: String,

    /// Upper bound for the reverse forward negotiation
    pub negotiate_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: "forensicinvestigator".to_string(),
            key_path: forensicvm_common::default_key_path(),
            ssh_binary: "ssh".to_string(),
            terminal: Vec::new(),
            conversion_tool: "/forensicVM/bin/run-or-convert.sh".to_string(),
            wait_command: "/home/forensicinvestigator/wait-y.sh".to_string(),
            negotiate_timeout_secs: 15,
        }
    }
}

impl SshConfig {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    pub fn negotiate_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiate_timeout_secs.max(1))
    }
}

/// Windows share configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShareConfig {
    /// Share address, `\\host\share`
    #[serde(alias = "folder_share_server")]
    pub windows_share: String,

    #[serde(alias = "share_login")]
    pub login: String,

    #[serde(alias = "share_password")]
    pub password: String,

    /// Local prefix of the image path that maps to the share root
    pub equivalence: String,
}

impl ShareConfig {
    /// Derive share settings from the image location: the image's folder is
    /// shared from the local host under its own name.
    pub fn autofill(&mut self, image_path: &str) {
        let normalized = image_path.replace('/', "\\");
        let parent = match normalized.rfind('\\') {
            Some(idx) => &normalized[..idx],
            None => "",
        };
        let folder = parent.rsplit('\\').next().unwrap_or_default();
        self.equivalence = parent.to_string();
        self.windows_share = format!("\\\\127.0.0.1\\{}", folder);
    }

    /// Per-case override file
    pub fn case_path(case: &CaseIdentity) -> Result<PathBuf> {
        Ok(case.case_image_folder()?.join(CASE_SHARE_FILE))
    }

    /// Share settings stored for a case, falling back to `self` for missing fields
    pub fn with_case_override(&self, case: &CaseIdentity) -> Result<Self> {
        let path = Self::case_path(case)?;
        if !path.exists() {
            return Ok(self.clone());
        }
        let content = std::fs::read_to_string(&path)?;
        let stored: ShareConfig = serde_json::from_str(&content).map_err(|e| {
            Error::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        let pick = |stored: String, base: &String| if stored.is_empty() { base.clone() } else { stored };
        Ok(Self {
            windows_share: pick(stored.windows_share, &self.windows_share),
            login: pick(stored.login, &self.login),
            password: pick(stored.password, &self.password),
            equivalence: pick(stored.equivalence, &self.equivalence),
        })
    }

    pub fn save_for_case(&self, case: &CaseIdentity) -> Result<()> {
        let path = Self::case_path(case)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

static IPV4_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(https?://)?\d{1,3}(\.\d{1,3}){3}(:\d+)?(/\S*)?$").expect("valid ipv4 pattern"));
static HOST_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?://)?(localhost|[\w-]+(\.[\w-]+)*\.[A-Za-z]{2,})(:\d+)?(/\S*)?$").expect("valid host pattern")
});

/// Check a server address the way it is typed into the configuration
pub fn validate_server_address(address: &str) -> bool {
    let address = address.trim();
    IPV4_ADDRESS.is_match(address) || HOST_ADDRESS.is_match(address)
}

/// Single-level `config.json` written by earlier clients
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyConfig {
    server_address: String,
    forensic_api: String,
    ssh_server_address: String,
    /// Stored as typed into a text field, so either a string or a number
    ssh_server_port: serde_json::Value,
    #[serde(flatten)]
    share: ShareConfig,
}

const LEGACY_KEYS: &[&str] = &[
    "server_address",
    "forensic_api",
    "ssh_server_address",
    "ssh_server_port",
    "folder_share_server",
    "share_login",
    "share_password",
];

impl LegacyConfig {
    /// A document without any section key but with at least one legacy key
    fn matches(doc: &serde_json::Value) -> bool {
        let Some(map) = doc.as_object() else {
            return false;
        };
        let sectioned = ["server", "ssh", "share"].iter().any(|k| map.contains_key(*k));
        !sectioned && LEGACY_KEYS.iter().any(|k| map.contains_key(*k))
    }

    fn port(&self) -> Result<Option<u16>> {
        let port = match &self.ssh_server_port {
            serde_json::Value::Null => return Ok(None),
            serde_json::Value::String(s) if s.trim().is_empty() => return Ok(None),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            _ => None,
        };
        port.map(Some)
            .ok_or_else(|| Error::InvalidConfig(format!("ssh_server_port is not a port: {}", self.ssh_server_port)))
    }

    fn into_config(self) -> Result<ConsoleConfig> {
        let mut config = ConsoleConfig::default();
        if let Some(port) = self.port()? {
            config.ssh.port = port;
        }
        config.server.address = self.server_address;
        config.server.api_key = self.forensic_api;
        config.ssh.host = self.ssh_server_address;
        config.share = self.share;
        Ok(config)
    }
}

impl ConsoleConfig {
    /// Load configuration from file.
    ///
    /// Accepts both the sectioned layout written by [`ConsoleConfig::save`] and
    /// the flat legacy layout; the latter is rewritten on the next save.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let corrupted = |e: serde_json::Error| {
            Error::InvalidConfig(format!(
                "{} is corrupted ({}); fix or remove it and reconfigure",
                path.display(),
                e
            ))
        };
        let doc: serde_json::Value = serde_json::from_str(&content).map_err(corrupted)?;
        if LegacyConfig::matches(&doc) {
            debug!("Reading legacy flat configuration from {}", path.display());
            let legacy: LegacyConfig = serde_json::from_value(doc).map_err(corrupted)?;
            return legacy.into_config();
        }
        serde_json::from_value(doc).map_err(corrupted)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Fields required before the console can talk to the server
    pub fn validate(&self) -> Result<()> {
        if self.server.address.trim().is_empty() {
            return Err(Error::InvalidConfig("server.address is not set".to_string()));
        }
        if !validate_server_address(&self.server.address) {
            return Err(Error::InvalidConfig(format!(
                "server.address is not a valid address: {}",
                self.server.address
            )));
        }
        if self.server.api_key.trim().is_empty() {
            return Err(Error::InvalidConfig("server.api_key is not set".to_string()));
        }
        Ok(())
    }

    /// Fields required before a tunnel can be opened
    pub fn validate_tunnel(&self) -> Result<()> {
        if self.ssh.host.trim().is_empty() {
            return Err(Error::InvalidConfig("ssh.host is not set".to_string()));
        }
        if self.share.windows_share.trim().is_empty() {
            return Err(Error::InvalidConfig("share.windows_share is not set".to_string()));
        }
        Ok(())
    }

    /// Web console URLs served by the forensic VM server
    pub fn web_urls(&self) -> WebUrls {
        let base = self.server.base_url();
        WebUrls {
            console: format!("{}/", base),
            shell: format!("{}/shell", base),
            netdata: format!("{}/netdata", base),
        }
    }
}

/// Browser entry points on the server
#[derive(Debug, Clone, Serialize)]
pub struct WebUrls {
    pub console: String,
    pub shell: String,
    pub netdata: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConsoleConfig::load(&dir.path().join("none.json")).unwrap();
        assert_eq!(config.server.poll_interval_ms, 1000);
        assert_eq!(config.ssh.username, "forensicinvestigator");
        assert_eq!(config.ssh.port, 22);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = ConsoleConfig::default();
        config.server.address = "forensic.example.org".to_string();
        config.server.api_key = "k".to_string();
        config.ssh.host = "10.0.0.5".to_string();
        config.ssh.port = 8228;
        config.save(&path).unwrap();

        let loaded = ConsoleConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_corrupted_file_is_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(ConsoleConfig::load(&path), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_share_section_accepts_legacy_key_names() {
        let json = r#"{
            "server": {"address": "10.1.1.1", "api_key": "abc"},
            "share": {"folder_share_server": "\\\\127.0.0.1\\imgs", "share_login": "u"}
        }"#;
        let config: ConsoleConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.address, "10.1.1.1");
        assert_eq!(config.share.windows_share, r"\\127.0.0.1\imgs");
        assert_eq!(config.share.login, "u");
    }

    #[test]
    fn test_flat_legacy_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "server_address": "10.1.1.1:8000",
                "forensic_api": "abc",
                "ssh_server_address": "10.1.1.2",
                "ssh_server_port": "8228",
                "folder_share_server": "\\\\127.0.0.1\\imgs",
                "share_login": "u",
                "share_password": "p",
                "equivalence": "D:\\imgs"
            }"#,
        )
        .unwrap();

        let config = ConsoleConfig::load(&path).unwrap();
        assert_eq!(config.server.address, "10.1.1.1:8000");
        assert_eq!(config.server.api_key, "abc");
        assert_eq!(config.ssh.host, "10.1.1.2");
        assert_eq!(config.ssh.port, 8228);
        assert_eq!(config.ssh.username, "forensicinvestigator");
        assert_eq!(config.share.windows_share, r"\\127.0.0.1\imgs");
        assert_eq!(config.share.login, "u");
        assert_eq!(config.share.password, "p");
        assert_eq!(config.share.equivalence, r"D:\imgs");
        config.validate().unwrap();
    }

    #[test]
    fn test_flat_legacy_file_with_blank_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"server_address": "10.1.1.1", "ssh_server_port": ""}"#).unwrap();
        let config = ConsoleConfig::load(&path).unwrap();
        assert_eq!(config.ssh.port, 22);

        std::fs::write(&path, r#"{"server_address": "10.1.1.1", "ssh_server_port": "ssh"}"#).unwrap();
        assert!(matches!(ConsoleConfig::load(&path), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_base_url_normalization() {
        let mut server = ServerConfig::default();
        server.address = "forensic.example.org/".to_string();
        assert_eq!(server.base_url(), "http://forensic.example.org");
        server.address = "https://forensic.example.org:4443".to_string();
        assert_eq!(server.base_url(), "https://forensic.example.org:4443");
    }

    #[test]
    fn test_server_address_validation() {
        assert!(validate_server_address("192.168.1.10"));
        assert!(validate_server_address("http://192.168.1.10:8000"));
        assert!(validate_server_address("https://forensic.example.org"));
        assert!(validate_server_address("localhost:8000"));
        assert!(!validate_server_address("not an address"));
        assert!(!validate_server_address(""));
    }

    #[test]
    fn test_autofill_from_image_path() {
        let mut share = ShareConfig::default();
        share.autofill(r"D:\evidence\case1\disk.E01");
        assert_eq!(share.equivalence, r"D:\evidence\case1");
        assert_eq!(share.windows_share, r"\\127.0.0.1\case1");
    }

    #[test]
    fn test_case_override_merges_fields() {
        let dir = tempfile::tempdir().unwrap();
        let case = CaseIdentity::new(r"D:\img\a.E01", dir.path().to_string_lossy(), "CASE1");

        let base = ShareConfig {
            windows_share: r"\\127.0.0.1\base".to_string(),
            login: "base".to_string(),
            password: "pw".to_string(),
            equivalence: r"D:\img".to_string(),
        };
        assert_eq!(base.with_case_override(&case).unwrap(), base);

        let stored = ShareConfig {
            windows_share: r"\\127.0.0.1\case".to_string(),
            login: String::new(),
            ..Default::default()
        };
        stored.save_for_case(&case).unwrap();

        let merged = base.with_case_override(&case).unwrap();
        assert_eq!(merged.windows_share, r"\\127.0.0.1\case");
        assert_eq!(merged.login, "base");
        assert_eq!(merged.equivalence, r"D:\img");
    }

    #[test]
    fn test_web_urls() {
        let mut config = ConsoleConfig::default();
        config.server.address = "10.0.0.1:8000".to_string();
        let urls = config.web_urls();
        assert_eq!(urls.console, "http://10.0.0.1:8000/");
        assert_eq!(urls.shell, "http://10.0.0.1:8000/shell");
        assert_eq!(urls.netdata, "http://10.0.0.1:8000/netdata");
    }
}
