//! Release feed resolution.
//!
//! The feed is fetched once per process, concurrently with startup; the
//! orchestrator gates on the readiness signal before selecting a download
//! URL. A failed or malformed feed is never fatal — it only means URL
//! selection falls through to the default artifact.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::arch::Architecture;
use crate::error::InstallerError;
use crate::models::VersionMetadata;

const FEED_URL: &str = "https://dist.harbor-launcher.dev/releases/latest_version.json";
const DEFAULT_ARTIFACT_URL: &str =
    "https://dist.harbor-launcher.dev/releases/HarborLauncher_1.2.4.0_x64.zip";
const FEED_TIMEOUT: Duration = Duration::from_secs(10);
const OFFICIAL_MIRROR: &str = "official";

fn feed_url() -> String {
    std::env::var("HARBOR_FEED_URL").unwrap_or_else(|_| FEED_URL.to_string())
}

/// Hardcoded fallback artifact, used whenever the feed cannot supply a URL.
pub fn default_artifact_url() -> String {
    std::env::var("HARBOR_DEFAULT_ARTIFACT_URL").unwrap_or_else(|_| DEFAULT_ARTIFACT_URL.to_string())
}

/// Readiness state observed by the orchestrator.
#[derive(Debug, Clone, Default)]
pub enum FeedState {
    #[default]
    Pending,
    /// Fetch finished; `None` means "use defaults".
    Ready(Option<VersionMetadata>),
}

/// Start the feed fetch as an independent task and hand back the receiver
/// the orchestrator will gate on. The state transitions to `Ready` exactly
/// once, on success or failure alike.
pub fn spawn_feed_fetch() -> watch::Receiver<FeedState> {
    let (tx, rx) = watch::channel(FeedState::Pending);
    tokio::spawn(async move {
        let metadata = match fetch_latest().await {
            Ok(metadata) => {
                info!(version = %metadata.version, mirrors = metadata.download_mirrors.len(),
                    "release feed loaded");
                Some(metadata)
            }
            Err(err) => {
                warn!(error = %err, "release feed unavailable, the default artifact will be used");
                None
            }
        };
        let _ = tx.send(FeedState::Ready(metadata));
    });
    rx
}

/// A receiver that is already `Ready`. Used by tests and offline runs.
pub fn preresolved(metadata: Option<VersionMetadata>) -> watch::Receiver<FeedState> {
    let (_tx, rx) = watch::channel(FeedState::Ready(metadata));
    rx
}

/// Block until the feed task has finished, returning its result.
pub async fn wait_ready(rx: &mut watch::Receiver<FeedState>) -> Option<VersionMetadata> {
    loop {
        {
            let state = rx.borrow();
            if let FeedState::Ready(metadata) = &*state {
                return metadata.clone();
            }
        }
        if rx.changed().await.is_err() {
            // Fetch task dropped the sender without publishing; fall back.
            return None;
        }
    }
}

/// The feed is occasionally published with tokens wrapped in backticks;
/// strip those before handing the payload to the JSON parser.
pub(crate) fn sanitize_feed_payload(raw: &str) -> String {
    raw.replace(" `", " ").replace("` ", " ")
}

async fn fetch_latest() -> Result<VersionMetadata, InstallerError> {
    let client = reqwest::Client::builder()
        .user_agent(crate::USER_AGENT)
        .timeout(FEED_TIMEOUT)
        .build()
        .map_err(|err| InstallerError::Network(err.to_string()))?;

    let url = feed_url();
    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(InstallerError::Network(format!(
            "feed returned HTTP {} for '{}'",
            response.status(),
            url
        )));
    }

    let body = response.text().await?;
    let cleaned = sanitize_feed_payload(&body);
    let metadata: VersionMetadata = serde_json::from_str(&cleaned)?;
    Ok(metadata)
}

/// Pick the download URL for `architecture`.
///
/// Precedence: no metadata or no mirrors → default URL; otherwise the mirror
/// named "official" (first mirror when absent); from that mirror the
/// architecture-specific URL, then its generic URL, then the default. The
/// chosen mirror never falls back to another mirror's URLs.
pub fn select_download_url(
    metadata: Option<&VersionMetadata>,
    architecture: Architecture,
) -> String {
    let Some(metadata) = metadata else {
        return default_artifact_url();
    };
    if metadata.download_mirrors.is_empty() {
        return default_artifact_url();
    }

    let mirror = metadata
        .download_mirrors
        .iter()
        .find(|mirror| mirror.name == OFFICIAL_MIRROR)
        .unwrap_or(&metadata.download_mirrors[0]);

    if let Some(url) = mirror.arch_urls.get(architecture.as_str()) {
        return url.clone();
    }
    if !mirror.url.is_empty() {
        return mirror.url.clone();
    }
    default_artifact_url()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Mirror;
    use std::collections::HashMap;

    fn mirror(name: &str, url: &str, arch_urls: &[(&str, &str)]) -> Mirror {
        Mirror {
            name: name.to_string(),
            url: url.to_string(),
            arch_urls: arch_urls
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn metadata_with(mirrors: Vec<Mirror>) -> VersionMetadata {
        VersionMetadata {
            version: "1.3.0".to_string(),
            release_time: String::new(),
            download_mirrors: mirrors,
            changelog: Vec::new(),
            important_update: false,
        }
    }

    #[test]
    fn test_no_metadata_yields_default() {
        assert_eq!(
            select_download_url(None, Architecture::X64),
            default_artifact_url()
        );
    }

    #[test]
    fn test_empty_mirror_list_yields_default() {
        let metadata = metadata_with(Vec::new());
        assert_eq!(
            select_download_url(Some(&metadata), Architecture::X64),
            default_artifact_url()
        );
    }

    #[test]
    fn test_official_arch_url_wins() {
        let metadata = metadata_with(vec![
            mirror("mirror1", "A", &[]),
            mirror("official", "", &[("x64", "B")]),
        ]);
        assert_eq!(select_download_url(Some(&metadata), Architecture::X64), "B");
    }

    #[test]
    fn test_official_generic_url_when_arch_missing() {
        let metadata = metadata_with(vec![
            mirror("mirror1", "A", &[]),
            mirror("official", "C", &[("x64", "B")]),
        ]);
        assert_eq!(
            select_download_url(Some(&metadata), Architecture::Arm64),
            "C"
        );
    }

    #[test]
    fn test_official_never_falls_back_to_other_mirrors() {
        // official has neither an arm64 entry nor a generic URL; the default
        // wins, not mirror1's URL.
        let metadata = metadata_with(vec![
            mirror("mirror1", "A", &[]),
            mirror("official", "", &[("x64", "B")]),
        ]);
        assert_eq!(
            select_download_url(Some(&metadata), Architecture::Arm64),
            default_artifact_url()
        );
    }

    #[test]
    fn test_first_mirror_used_when_official_absent() {
        let metadata = metadata_with(vec![
            mirror("mirror1", "A", &[("x86", "A86")]),
            mirror("mirror2", "Z", &[]),
        ]);
        assert_eq!(
            select_download_url(Some(&metadata), Architecture::X86),
            "A86"
        );
        assert_eq!(select_download_url(Some(&metadata), Architecture::X64), "A");
    }

    #[test]
    fn test_first_mirror_without_urls_yields_default() {
        let metadata = metadata_with(vec![mirror("mirror1", "", &[])]);
        assert_eq!(
            select_download_url(Some(&metadata), Architecture::X64),
            default_artifact_url()
        );
    }

    #[test]
    fn test_sanitize_strips_space_adjacent_backticks() {
        assert_eq!(
            sanitize_feed_payload(r#"{"version": `1.2.3` }"#),
            r#"{"version": 1.2.3 }"#
        );
        assert_eq!(sanitize_feed_payload("no artifacts"), "no artifacts");
    }

    #[tokio::test]
    async fn test_wait_ready_returns_preresolved_metadata() {
        let metadata = metadata_with(vec![mirror("official", "C", &[])]);
        let mut rx = preresolved(Some(metadata));
        let resolved = wait_ready(&mut rx).await.unwrap();
        assert_eq!(resolved.download_mirrors[0].url, "C");
    }

    #[tokio::test]
    async fn test_wait_ready_blocks_until_publication() {
        let (tx, mut rx) = watch::channel(FeedState::Pending);
        let waiter = tokio::spawn(async move { wait_ready(&mut rx).await });
        tx.send(FeedState::Ready(None)).unwrap();
        assert!(waiter.await.unwrap().is_none());
    }
}
