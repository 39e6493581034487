//! Evidence folder provisioning
//!
//! Case tags exported by the forensic suite become folders inside the VM's
//! evidence volume, so examiners can file findings by tag.

use forensicvm_common::{Error, Result, VmId};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::client::ControlPlane;

#[derive(Debug, Deserialize)]
struct CaseTag {
    name: String,
}

/// Folder-safe version of a tag name, `None` when nothing usable remains
pub fn sanitize_folder_name(name: &str) -> Option<String> {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| c.is_whitespace() || c == '.');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Sanitize and dedupe (case-insensitively) a list of tags, keeping order
pub fn sanitize_tags<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter_map(|name| sanitize_folder_name(name.as_ref()))
        .filter(|name| seen.insert(name.to_lowercase()))
        .collect()
}

/// Read `case_tags.json`; a missing file means no tags
pub async fn load_case_tags(path: &Path) -> Result<Vec<String>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No case tags at {}", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(Error::LocalIo(e)),
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let tags: Vec<CaseTag> = serde_json::from_str(&content)?;
    Ok(sanitize_tags(tags.into_iter().map(|t| t.name)))
}

/// Creates (or recreates) the evidence folders of one VM
#[derive(Clone)]
pub struct EvidenceProvisioner {
    client: Arc<dyn ControlPlane>,
    vm_id: VmId,
    tags_path: PathBuf,
}

impl EvidenceProvisioner {
    pub fn new(client: Arc<dyn ControlPlane>, vm_id: VmId, tags_path: PathBuf) -> Self {
        Self {
            client,
            vm_id,
            tags_path,
        }
    }

    pub async fn provision(&self) -> Result<String> {
        let folders = load_case_tags(&self.tags_path).await?;
        info!("Creating {} evidence folders for {}", folders.len(), self.vm_id);
        self.client.create_folders(&self.vm_id, &folders).await
    }

    /// Destructive: drops existing folder contents on the server
    pub async fn recreate(&self) -> Result<String> {
        let folders = load_case_tags(&self.tags_path).await?;
        info!("Recreating {} evidence folders for {}", folders.len(), self.vm_id);
        self.client.recreate_folders(&self.vm_id, &folders).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_folder_name() {
        assert_eq!(sanitize_folder_name("Malware/C2").as_deref(), Some("Malware_C2"));
        assert_eq!(sanitize_folder_name("  ..Notes..  ").as_deref(), Some("Notes"));
        assert_eq!(sanitize_folder_name("v1.2 final-draft").as_deref(), Some("v1.2 final-draft"));
        assert_eq!(sanitize_folder_name(" . "), None);
        assert_eq!(sanitize_folder_name("").as_deref(), None);
    }

    #[test]
    fn test_sanitize_tags_dedupes_case_insensitively() {
        let tags = sanitize_tags(["Images", "Chat:Logs", "images", "", "Chat?Logs", "Docs"]);
        assert_eq!(tags, vec!["Images", "Chat_Logs", "Docs"]);
    }

    #[tokio::test]
    async fn test_load_case_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("case_tags.json");

        assert!(load_case_tags(&path).await.unwrap().is_empty());

        std::fs::write(&path, r#"[{"name": "Evidence"}, {"name": "Web/History"}, {"name": "evidence"}]"#).unwrap();
        assert_eq!(load_case_tags(&path).await.unwrap(), vec!["Evidence", "Web_History"]);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(load_case_tags(&path).await, Err(Error::Serialization(_))));
    }
}
