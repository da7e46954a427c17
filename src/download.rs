use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::InstallerError;
use crate::progress::{format_size, ProgressFn, ProgressRange};
use crate::task_control::{ensure_not_cancelled, TaskControl};

/// Fetches a remote artifact into local storage.
///
/// The orchestrator only depends on this seam; production uses
/// [`HttpDownloader`], tests substitute a fake that materializes a fixture.
#[async_trait]
pub trait ArtifactDownloader: Send + Sync {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        range: ProgressRange,
        on_progress: &ProgressFn,
        control: &TaskControl,
    ) -> Result<(), InstallerError>;
}

/// Streaming HTTP downloader.
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, InstallerError> {
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| InstallerError::Network(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactDownloader for HttpDownloader {
    /// Stream the response body to `destination` chunk by chunk, never
    /// buffering the whole payload. When the content length is known the
    /// stage-local percentage is mapped into `range` and emitted only when
    /// the mapped integer changes; the message carries a remaining-size
    /// estimate. The caller forces `range.end` after this returns.
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        range: ProgressRange,
        on_progress: &ProgressFn,
        control: &TaskControl,
    ) -> Result<(), InstallerError> {
        ensure_not_cancelled(control, "download")?;

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(InstallerError::Network(format!(
                "download failed for '{}': HTTP {}",
                url,
                response.status()
            )));
        }

        let total_bytes = response.content_length();
        if total_bytes.is_none() {
            debug!(url, "content length unknown, download progress will be coarse");
        }

        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;
        let mut last_emitted: i32 = -1;

        while let Some(next_chunk) = stream.next().await {
            ensure_not_cancelled(control, "download")?;
            let chunk = next_chunk
                .map_err(|err| InstallerError::Network(format!("stream error for '{url}': {err}")))?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;

            if let Some(total) = total_bytes {
                let inner = ((received.min(total) * 100) / total.max(1)) as u8;
                let mapped = range.map(inner);
                if i32::from(mapped) != last_emitted {
                    last_emitted = i32::from(mapped);
                    let remaining = total.saturating_sub(received);
                    on_progress(
                        mapped,
                        format!(
                            "Downloading... {}%, {} remaining",
                            inner,
                            format_size(remaining)
                        ),
                    );
                }
            }
        }

        file.flush().await?;
        Ok(())
    }
}
