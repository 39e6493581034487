//! Control-plane HTTP client
//!
//! Typed wrapper over the forensic VM server REST API. Every call is
//! authenticated with the `X-API-KEY` header and every failure is normalized
//! into one of the console error classes:
//!
//! - [`Error::Unreachable`]: no response (connection refused, timeout)
//! - [`Error::Unauthorized`]: 401/403
//! - [`Error::NotFound`]: 404
//! - [`Error::Application`]: the server answered but rejected the operation

use async_trait::async_trait;
use forensicvm_common::{
    ArtifactKind, Error, PluginInfo, Result, RunningMode, SnapshotEntry, VmId, VmStatus,
};
use futures::{StreamExt, TryStreamExt};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::reconciler::DeleteConfirmation;

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "X-API-KEY";

/// Progress callback, `(bytes_done, total_bytes)`
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Control-plane surface the reconciler and its background tasks depend on
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Authentication probe, also used as the reachability check
    async fn test_auth(&self) -> Result<()>;

    /// Current status; a VM that does not exist is reported as absent
    async fn get_status(&self, id: &VmId) -> Result<VmStatus>;

    async fn start(&self, id: &VmId) -> Result<String>;
    async fn stop(&self, id: &VmId) -> Result<String>;
    async fn reset(&self, id: &VmId) -> Result<String>;
    async fn shutdown(&self, id: &VmId) -> Result<String>;

    /// Delete the VM. The confirmation can only be obtained from the
    /// reconciler's two-step gate.
    async fn delete(&self, id: &VmId, confirmation: DeleteConfirmation) -> Result<String>;

    async fn create_folders(&self, id: &VmId, folders: &[String]) -> Result<String>;
    async fn recreate_folders(&self, id: &VmId, folders: &[String]) -> Result<String>;

    /// Stream an artifact into `dest_dir`. A cancelled or failed download
    /// leaves no file behind.
    async fn download_artifact(
        &self,
        kind: ArtifactKind,
        id: &VmId,
        dest_dir: &Path,
        cancel: CancellationToken,
        progress: ProgressFn,
    ) -> Result<PathBuf>;
}

/// Client for the forensic VM server
#[derive(Clone)]
pub struct RemoteControlClient {
    base: Url,
    api_key: String,
    /// Short-timeout client for request/response calls
    http: reqwest::Client,
    /// Client without a total timeout for transfers
    transfer: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    vm_status: String,
    #[serde(default)]
    running_mode: Option<String>,
    #[serde(default)]
    websocket_port: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PluginItem {
    Info(PluginInfo),
    Dir(String),
}

impl RemoteControlClient {
    /// Create a new client
    pub fn new(server: &ServerConfig) -> Result<Self> {
        let base = Url::parse(&server.base_url())
            .map_err(|e| Error::InvalidConfig(format!("server.address: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidConfig(format!("server.address: {} cannot be a base URL", base)));
        }

        let http = reqwest::Client::builder()
            .timeout(server.request_timeout())
            .connect_timeout(server.request_timeout())
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        let transfer = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            base,
            api_key: server.api_key.clone(),
            http,
            transfer,
        })
    }

    /// `<base>/api/<segments...>/`
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("api").extend(segments).push("");
        }
        url
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        read_reply(response).await
    }

    async fn get(&self, segments: &[&str]) -> Result<Value> {
        let url = self.endpoint(segments);
        debug!("GET {}", url);
        self.send(self.http.get(url)).await
    }

    async fn post(&self, segments: &[&str], body: Value) -> Result<Value> {
        let url = self.endpoint(segments);
        debug!("POST {}", url);
        self.send(self.http.post(url).json(&body)).await
    }

    async fn lifecycle(&self, action: &str, id: &VmId) -> Result<String> {
        let id = id.to_string();
        let reply = self.post(&[action, &id], json!({})).await?;
        let message = message_of(&reply);
        info!("{} {}: {}", action, id, message);
        Ok(message)
    }

    /// `GET /api/check-vm-exists/{uuid}/`
    pub async fn vm_exists(&self, id: &VmId) -> Result<bool> {
        let reply = self.get(&["check-vm-exists", &id.to_string()]).await?;
        Ok(reply.get("vm_exists").and_then(Value::as_bool).unwrap_or(false))
    }

    // Snapshots

    pub async fn list_snapshots(&self, id: &VmId) -> Result<Vec<SnapshotEntry>> {
        let reply = self.get(&["list-snapshots", &id.to_string()]).await?;
        let listing = reply.get("snapshots").cloned().unwrap_or(reply);
        let lines: Vec<String> = match listing {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            Value::String(text) => text.lines().map(str::to_string).collect(),
            _ => Vec::new(),
        };
        Ok(SnapshotEntry::parse_listing(lines.iter().map(String::as_str)))
    }

    pub async fn create_snapshot(&self, id: &VmId) -> Result<String> {
        let reply = self.post(&["create-snapshot", &id.to_string()], json!({})).await?;
        Ok(message_of(&reply))
    }

    pub async fn rollback_snapshot(&self, id: &VmId, tag: &str) -> Result<String> {
        let reply = self
            .post(&["rollback-snapshot", &id.to_string()], json!({ "snapshot_name": tag }))
            .await?;
        Ok(message_of(&reply))
    }

    pub async fn delete_snapshot(&self, id: &VmId, tag: &str) -> Result<String> {
        let reply = self
            .post(&["delete-snapshot", &id.to_string()], json!({ "snapshot_name": tag }))
            .await?;
        Ok(message_of(&reply))
    }

    // Memory

    pub async fn get_memory_size(&self, id: &VmId) -> Result<u64> {
        let reply = self.get(&["get-memory-size", &id.to_string()]).await?;
        reply
            .get("memory_size")
            .and_then(value_as_u64)
            .ok_or_else(|| Error::Application(format!("unexpected memory size reply: {}", reply)))
    }

    pub async fn set_memory_size(&self, id: &VmId, mb: u64) -> Result<String> {
        let reply = self
            .post(&["change-memory-size", &id.to_string()], json!({ "memory_size": mb }))
            .await?;
        Ok(message_of(&reply))
    }

    // Network tap

    pub async fn check_network_tap(&self, id: &VmId) -> Result<bool> {
        let url = self.endpoint(&["check_tap"]);
        let reply = self
            .send(self.http.get(url).query(&[("uuid", id.to_string())]))
            .await?;
        Ok(reply.get("tap_enabled").and_then(Value::as_bool).unwrap_or(false))
    }

    pub async fn enable_network_tap(&self, id: &VmId) -> Result<String> {
        let reply = self.post(&["start_tap"], json!({ "uuid": id.to_string() })).await?;
        Ok(message_of(&reply))
    }

    pub async fn disable_network_tap(&self, id: &VmId) -> Result<String> {
        let reply = self.post(&["stop_tap"], json!({ "uuid": id.to_string() })).await?;
        Ok(message_of(&reply))
    }

    // ISO images and CD-ROM

    pub async fn list_iso(&self) -> Result<Vec<String>> {
        let reply = self.get(&["list-iso-files"]).await?;
        Ok(reply
            .get("iso_files")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default())
    }

    /// Stream a local ISO to the server as a multipart upload
    pub async fn upload_iso(&self, path: &Path, cancel: CancellationToken, progress: ProgressFn) -> Result<String> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::InvalidConfig(format!("{} is not a file", path.display())))?;
        let file = tokio::fs::File::open(path).await?;
        let total = file.metadata().await?.len();

        let sent = Arc::new(AtomicU64::new(0));
        let stream = ReaderStream::new(file).inspect_ok(move |chunk| {
            let done = sent.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
            progress(done, Some(total));
        });
        let part = reqwest::multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
            .file_name(file_name.clone());
        let form = reqwest::multipart::Form::new().part("file", part);

        let request = self
            .transfer
            .post(self.endpoint(&["upload-iso"]))
            .header(API_KEY_HEADER, &self.api_key)
            .multipart(form);

        info!("Uploading {} ({} bytes)", file_name, total);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = request.send() => response.map_err(transport_error)?,
        };
        let reply = read_reply(response).await?;
        Ok(message_of(&reply))
    }

    pub async fn delete_iso(&self, name: &str) -> Result<String> {
        let reply = self.post(&["delete-iso", name], json!({})).await?;
        Ok(message_of(&reply))
    }

    pub async fn insert_cdrom(&self, id: &VmId, name: &str) -> Result<String> {
        let reply = self.get(&["insert-cdrom", &id.to_string(), name]).await?;
        Ok(message_of(&reply))
    }

    pub async fn eject_cdrom(&self, id: &VmId) -> Result<String> {
        let reply = self.get(&["eject-cdrom", &id.to_string()]).await?;
        Ok(message_of(&reply))
    }

    // Plugins

    pub async fn list_plugins(&self) -> Result<Vec<PluginInfo>> {
        let reply = self.get(&["list-plugins"]).await?;
        let items = reply.get("plugins").cloned().unwrap_or(reply);
        let items: Vec<PluginItem> = serde_json::from_value(items)
            .map_err(|e| Error::Application(format!("unexpected plugin listing: {}", e)))?;
        Ok(items
            .into_iter()
            .map(|item| match item {
                PluginItem::Info(info) => info,
                PluginItem::Dir(dir) => PluginInfo {
                    name: dir.clone(),
                    dir,
                    description: String::new(),
                },
            })
            .collect())
    }

    pub async fn run_plugin(&self, id: &VmId, plugin_dir: &str) -> Result<String> {
        let url = self.endpoint(&["run-plugin"]);
        let reply = self
            .send(
                self.transfer
                    .get(url)
                    .query(&[("uuid", id.to_string()), ("plugin_dir", plugin_dir.to_string())]),
            )
            .await?;
        Ok(reply
            .get("output")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| message_of(&reply)))
    }

    /// Register the console's public key for the SSH account
    pub async fn register_ssh_key(&self, public_key: &str) -> Result<String> {
        let url = self.endpoint(&["create-ssh-keys"]);
        let reply = self
            .send(self.http.post(url).form(&[("public_key", public_key.trim())]))
            .await?;
        Ok(message_of(&reply))
    }
}

#[async_trait]
impl ControlPlane for RemoteControlClient {
    async fn test_auth(&self) -> Result<()> {
        self.get(&["test"]).await.map(|_| ())
    }

    async fn get_status(&self, id: &VmId) -> Result<VmStatus> {
        if !self.vm_exists(id).await? {
            return Ok(VmStatus::absent());
        }
        match self.get(&["forensic-image-vm-status", &id.to_string()]).await {
            Ok(reply) => parse_status(reply),
            Err(Error::NotFound { .. }) => Ok(VmStatus::absent()),
            Err(e) => Err(e),
        }
    }

    async fn start(&self, id: &VmId) -> Result<String> {
        self.lifecycle("start-vm", id).await
    }

    async fn stop(&self, id: &VmId) -> Result<String> {
        self.lifecycle("stop-vm", id).await
    }

    async fn reset(&self, id: &VmId) -> Result<String> {
        self.lifecycle("reset-vm", id).await
    }

    async fn shutdown(&self, id: &VmId) -> Result<String> {
        self.lifecycle("shutdown-vm", id).await
    }

    async fn delete(&self, id: &VmId, _confirmation: DeleteConfirmation) -> Result<String> {
        self.lifecycle("delete-vm", id).await
    }

    async fn create_folders(&self, id: &VmId, folders: &[String]) -> Result<String> {
        let reply = self
            .post(&["create-folders"], json!({ "uuid": id.to_string(), "folders": folders }))
            .await?;
        Ok(message_of(&reply))
    }

    async fn recreate_folders(&self, id: &VmId, folders: &[String]) -> Result<String> {
        let reply = self
            .post(&["recreate-folders"], json!({ "uuid": id.to_string(), "folders": folders }))
            .await?;
        Ok(message_of(&reply))
    }

    async fn download_artifact(
        &self,
        kind: ArtifactKind,
        id: &VmId,
        dest_dir: &Path,
        cancel: CancellationToken,
        progress: ProgressFn,
    ) -> Result<PathBuf> {
        let url = self.endpoint(&[kind.endpoint(), &id.to_string()]);
        debug!("GET {} (download)", url);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = self.transfer.get(url).header(API_KEY_HEADER, &self.api_key).send() => {
                response.map_err(transport_error)?
            }
        };
        let response = check_status(response).await?;

        let total = response.content_length();
        let file_name = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename)
            .unwrap_or_else(|| format!("{}-{}.{}", id, kind, kind.default_extension()));

        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(&file_name);
        // An earlier artifact at `path` survives until the new body is complete.
        let part = dest_dir.join(format!("{}.part", file_name));

        let outcome: Result<u64> = async {
            let written = write_body(response, &part, total, &cancel, &progress).await?;
            tokio::fs::rename(&part, &path).await?;
            Ok(written)
        }
        .await;

        match outcome {
            Ok(written) => {
                info!("Downloaded {} ({} bytes) to {}", kind, written, path.display());
                Ok(path)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&part).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove partial download {}: {}", part.display(), rm);
                    }
                }
                Err(e)
            }
        }
    }
}

async fn write_body(
    response: Response,
    path: &Path,
    total: Option<u64>,
    cancel: &CancellationToken,
    progress: &ProgressFn,
) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            next = stream.next() => next,
        };
        match next {
            None => break,
            Some(Err(e)) => return Err(transport_error(e)),
            Some(Ok(chunk)) => {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
                progress(written, total);
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    file.flush().await?;

    if let Some(total) = total {
        if written < total {
            return Err(Error::Unreachable(format!(
                "download truncated at {} of {} bytes",
                written, total
            )));
        }
    }
    Ok(written)
}

/// Map a transport failure; anything without a response is `Unreachable`
fn transport_error(e: reqwest::Error) -> Error {
    if e.is_decode() {
        return Error::Application(format!("malformed response: {}", e));
    }
    Error::Unreachable(e.to_string())
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let path = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &path, &body))
}

fn status_error(status: StatusCode, path: &str, body: &str) -> Error {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| error_message(&v))
        .unwrap_or_else(|| {
            let text = body.trim();
            if text.is_empty() {
                status.to_string()
            } else {
                text.to_string()
            }
        });

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized(detail),
        StatusCode::NOT_FOUND => Error::NotFound {
            kind: "endpoint".to_string(),
            id: path.to_string(),
        },
        _ => Error::Application(format!("{} ({})", detail, status)),
    }
}

async fn read_reply(response: Response) -> Result<Value> {
    let response = check_status(response).await?;
    let text = response.text().await.map_err(transport_error)?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
    if let Some(message) = error_message(&value) {
        return Err(Error::Application(message));
    }
    Ok(value)
}

/// Error payload carried by an otherwise well-formed reply
fn error_message(value: &Value) -> Option<String> {
    if let Some(err) = value.get("error") {
        return Some(match err {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    if value.get("status").and_then(Value::as_str) == Some("error") {
        return Some(
            value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("operation failed")
                .to_string(),
        );
    }
    None
}

fn message_of(value: &Value) -> String {
    match value {
        Value::Null => "ok".to_string(),
        Value::String(s) => s.clone(),
        other => ["message", "status", "result"]
            .iter()
            .find_map(|key| other.get(*key).and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| other.to_string()),
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_status(reply: Value) -> Result<VmStatus> {
    let reply: StatusReply = serde_json::from_value(reply)
        .map_err(|e| Error::Application(format!("unexpected status reply: {}", e)))?;

    let mode = match reply.running_mode.as_deref() {
        Some(mode) if !mode.trim().is_empty() => mode.parse::<RunningMode>()?,
        _ => RunningMode::Copy,
    };
    let port = reply
        .websocket_port
        .as_ref()
        .and_then(value_as_u64)
        .and_then(|p| u16::try_from(p).ok());

    match reply.vm_status.trim().to_ascii_lowercase().as_str() {
        "running" => Ok(VmStatus::running(mode, port)),
        "stopped" => Ok(VmStatus::stopped(mode)),
        other => Err(Error::Application(format!("unexpected vm_status: {}", other))),
    }
}

/// File name from a `Content-Disposition` header, stripped of any directory part
fn disposition_filename(header: &str) -> Option<String> {
    let raw = header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))?
        .trim_matches('"');
    let name = raw.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_classes() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "/api/test/", ""),
            Error::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "/api/test/", "Access denied"),
            Error::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "/api/x/", ""),
            Error::NotFound { .. }
        ));
        match status_error(StatusCode::BAD_REQUEST, "/api/x/", r#"{"error": "VM not stopped"}"#) {
            Error::Application(msg) => assert!(msg.starts_with("VM not stopped")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_message_shapes() {
        assert_eq!(error_message(&json!({"error": "VM not stopped"})).as_deref(), Some("VM not stopped"));
        assert_eq!(
            error_message(&json!({"status": "error", "message": "busy"})).as_deref(),
            Some("busy")
        );
        assert_eq!(error_message(&json!({"status": "ok"})), None);
        assert_eq!(error_message(&json!("running")), None);
    }

    #[test]
    fn test_parse_status() {
        let status = parse_status(json!({"vm_status": "stopped", "running_mode": "copy"})).unwrap();
        assert_eq!(status, VmStatus::stopped(RunningMode::Copy));

        let status =
            parse_status(json!({"vm_status": "running", "running_mode": "snap", "websocket_port": "5701"})).unwrap();
        assert_eq!(status, VmStatus::running(RunningMode::Snap, Some(5701)));

        assert!(matches!(
            parse_status(json!({"vm_status": "exploded"})),
            Err(Error::Application(_))
        ));
    }

    #[test]
    fn test_message_of() {
        assert_eq!(message_of(&Value::Null), "ok");
        assert_eq!(message_of(&json!("running")), "running");
        assert_eq!(message_of(&json!({"message": "VM started"})), "VM started");
        assert_eq!(message_of(&json!({"vm_stopped": true})), r#"{"vm_stopped":true}"#);
    }

    #[test]
    fn test_disposition_filename() {
        assert_eq!(
            disposition_filename(r#"attachment; filename="evidence.qcow2""#).as_deref(),
            Some("evidence.qcow2")
        );
        assert_eq!(
            disposition_filename("attachment; filename=../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(disposition_filename("inline"), None);
    }

    #[test]
    fn test_endpoint_building() {
        let server = ServerConfig {
            address: "10.0.0.1:8000/".to_string(),
            ..Default::default()
        };
        let client = RemoteControlClient::new(&server).unwrap();
        assert_eq!(client.endpoint(&["test"]).as_str(), "http://10.0.0.1:8000/api/test/");
        assert_eq!(
            client.endpoint(&["insert-cdrom", "abc", "my disk.iso"]).as_str(),
            "http://10.0.0.1:8000/api/insert-cdrom/abc/my%20disk.iso/"
        );
    }
}
