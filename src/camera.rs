// src/camera.rs - Snapshot capture over HTTP
//
// Captures run on the async runtime and report their outcome as a value;
// nothing here panics or blocks the command hooks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use lapse_shared::config::CameraConfig;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Camera request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Camera returned HTTP {0}")]
    Status(u16),
    #[error("Camera returned an empty image")]
    EmptyImage,
    #[error("Failed to write snapshot: {0}")]
    Io(#[from] std::io::Error),
}

/// What to capture and where to store it.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub print_name: String,
    pub sequence: u32,
    pub output_dir: PathBuf,
    pub filename_template: String,
}

impl CaptureRequest {
    /// Expands `{print_name}`, `{sequence}` (zero padded to six digits) and
    /// `{timestamp}` in the filename template.
    pub fn output_path(&self, now: DateTime<Local>) -> PathBuf {
        let filename = self
            .filename_template
            .replace("{print_name}", &sanitize(&self.print_name))
            .replace("{sequence}", &format!("{:06}", self.sequence))
            .replace("{timestamp}", &now.format("%Y%m%d%H%M%S").to_string());
        self.output_dir.join(filename)
    }
}

fn sanitize(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "print".to_string() } else { cleaned }
}

#[async_trait]
pub trait SnapshotCapture: Send + Sync {
    /// Captures one image and returns the path it was written to.
    async fn capture(&self, request: CaptureRequest) -> Result<PathBuf, CameraError>;
}

pub struct HttpCamera {
    client: reqwest::Client,
    config: CameraConfig,
    timeout: Duration,
    guard: Arc<Mutex<()>>,
}

impl HttpCamera {
    pub fn new(config: CameraConfig) -> Result<Self, CameraError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            config,
            timeout,
            guard: Arc::new(Mutex::new(())),
        })
    }

    async fn fetch(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<Vec<u8>, CameraError> {
        let response = client.get(url).send().await.map_err(|e| map_timeout(e, timeout))?;
        if !response.status().is_success() {
            return Err(CameraError::Status(response.status().as_u16()));
        }
        let body = response.bytes().await.map_err(|e| map_timeout(e, timeout))?;
        Ok(body.to_vec())
    }

    /// Sends each configured camera setting. Requests run in the background
    /// and failures are only logged.
    pub fn apply_settings(&self) -> Vec<JoinHandle<()>> {
        let Some(template) = &self.config.settings_url_template else {
            return Vec::new();
        };
        self.config
            .settings
            .iter()
            .map(|setting| {
                let url = template.replace("{name}", &setting.name).replace("{value}", &setting.value);
                let client = self.client.clone();
                let guard = self.guard.clone();
                let serialize = self.config.serialize_requests;
                let timeout = self.timeout;
                let name = setting.name.clone();
                tokio::spawn(async move {
                    let _lock = if serialize { Some(guard.lock().await) } else { None };
                    match Self::fetch(&client, &url, timeout).await {
                        Ok(_) => tracing::debug!("Applied camera setting '{}'", name),
                        Err(e) => tracing::warn!("Failed to apply camera setting '{}': {}", name, e),
                    }
                })
            })
            .collect()
    }
}

fn map_timeout(error: reqwest::Error, timeout: Duration) -> CameraError {
    if error.is_timeout() {
        CameraError::Timeout(timeout)
    } else {
        CameraError::Http(error)
    }
}

#[async_trait]
impl SnapshotCapture for HttpCamera {
    async fn capture(&self, request: CaptureRequest) -> Result<PathBuf, CameraError> {
        let _lock = if self.config.serialize_requests { Some(self.guard.lock().await) } else { None };
        let image = Self::fetch(&self.client, &self.config.snapshot_url, self.timeout).await?;
        if image.is_empty() {
            return Err(CameraError::EmptyImage);
        }
        let path = request.output_path(Local::now());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &image).await?;
        tracing::info!("Saved snapshot {} ({} bytes)", path.display(), image.len());
        Ok(path)
    }
}
