//! Certificate trust gate.
//!
//! The package is signed with a certificate that must be present in the
//! machine-level trusted-root store before deployment. The gate first tries
//! a non-interactive elevated install; if trust still isn't established it
//! signals the caller to show manual guidance, opens the certificate with
//! the OS default handler and polls until a human completes the import.
//! The poll has no timeout — it is gated on human action — but honors the
//! run's cancellation flag on every tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::InstallerError;
use crate::task_control::{ensure_not_cancelled, TaskControl};

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

const CERTIFICATE_EXTENSION: &str = "cer";

/// Machine trust store capability.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Whether a certificate with this thumbprint is in the trusted-root store.
    async fn contains(&self, thumbprint: &str) -> bool;

    /// Non-interactive install into the trusted-root store, elevating as
    /// needed. Denied elevation surfaces as an error; the caller treats it
    /// as "try the manual path", not as fatal.
    async fn install_elevated(&self, certificate: &Path) -> Result<(), InstallerError>;

    /// Hand the certificate file to the OS default handler so the user can
    /// import it by hand.
    fn open_for_manual_install(&self, certificate: &Path) -> Result<(), InstallerError>;
}

/// Locate the signing certificate in the extracted tree, shallowest first.
pub fn find_certificate(extracted: &Path) -> Result<PathBuf, InstallerError> {
    let mut matches: Vec<(usize, PathBuf)> = Vec::new();
    for entry in WalkDir::new(extracted)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let is_certificate = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(CERTIFICATE_EXTENSION))
            .unwrap_or(false);
        if is_certificate {
            matches.push((entry.depth(), entry.into_path()));
        }
    }
    matches.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    matches
        .into_iter()
        .next()
        .map(|(_, path)| path)
        .ok_or_else(|| {
            InstallerError::FileSystem("no certificate file found in the extracted package".into())
        })
}

/// Thumbprint identifying a certificate within the store: uppercase hex
/// digest over the DER bytes. Rejects content that is not DER-shaped.
pub fn compute_thumbprint(der: &[u8]) -> Result<String, InstallerError> {
    // DER certificates start with a SEQUENCE tag.
    if der.len() < 4 || der[0] != 0x30 {
        return Err(InstallerError::Parse(
            "certificate file is not DER-encoded".into(),
        ));
    }
    let digest = Sha256::digest(der);
    Ok(digest.iter().map(|byte| format!("{byte:02X}")).collect())
}

pub struct TrustGate {
    store: Arc<dyn CertificateStore>,
}

impl TrustGate {
    pub fn new(store: Arc<dyn CertificateStore>) -> Self {
        Self { store }
    }

    /// Whether the certificate at `certificate` is already trusted.
    /// Any read or parse failure means "not trusted"; this never errors.
    pub async fn is_trusted(&self, certificate: &Path) -> bool {
        let der = match std::fs::read(certificate) {
            Ok(der) => der,
            Err(err) => {
                debug!(path = %certificate.display(), error = %err,
                    "certificate unreadable, treating as untrusted");
                return false;
            }
        };
        let thumbprint = match compute_thumbprint(&der) {
            Ok(thumbprint) => thumbprint,
            Err(err) => {
                debug!(path = %certificate.display(), error = %err,
                    "certificate unparsable, treating as untrusted");
                return false;
            }
        };
        self.store.contains(&thumbprint).await
    }

    /// Establish trust for the certificate, blocking until it is present in
    /// the store. `on_manual_step` fires at most once, right before the
    /// manual-guidance fallback begins.
    pub async fn ensure_trusted(
        &self,
        certificate: &Path,
        on_manual_step: &(dyn Fn() + Send + Sync),
        control: &TaskControl,
    ) -> Result<(), InstallerError> {
        if self.is_trusted(certificate).await {
            debug!("certificate already trusted");
            return Ok(());
        }

        // Elevation can be declined or the utility can fail; either way the
        // manual path below still applies, so this is not fatal here.
        if let Err(err) = self.store.install_elevated(certificate).await {
            warn!(error = %err, "elevated certificate install did not complete");
        }
        ensure_not_cancelled(control, "certificate")?;
        if self.is_trusted(certificate).await {
            info!("certificate trusted after elevated install");
            return Ok(());
        }

        on_manual_step();
        if let Err(err) = self.store.open_for_manual_install(certificate) {
            warn!(error = %err, "could not open the certificate for manual install");
        }
        info!("waiting for the certificate to be imported manually");
        loop {
            ensure_not_cancelled(control, "certificate")?;
            tokio::time::sleep(POLL_INTERVAL).await;
            if self.is_trusted(certificate).await {
                info!("certificate trusted after manual import");
                return Ok(());
            }
        }
    }
}
