use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// One named download source, optionally keyed by CPU architecture.
#[derive(Debug, Clone, Deserialize)]
pub struct Mirror {
    pub name: String,
    /// Generic fallback URL; may be empty when only `arch_urls` is populated.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub arch_urls: HashMap<String, String>,
}

/// Release feed payload describing the latest published version.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionMetadata {
    pub version: String,
    #[serde(default)]
    pub release_time: String,
    #[serde(default)]
    pub download_mirrors: Vec<Mirror>,
    #[serde(default)]
    pub changelog: Vec<String>,
    #[serde(default)]
    pub important_update: bool,
}

/// Wizard step titles, indexed by [`StatusSnapshot::step_index`].
pub const STEP_TITLES: [&str; 5] = [
    "Welcome",
    "Installing",
    "Certificate",
    "Installing",
    "Finished",
];

/// States of one installation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    Idle,
    PreparingFiles,
    Downloading,
    Extracting,
    CertificateCheck,
    CertificateManual,
    RegisteringPackage,
    PostInstall,
    Complete,
    Failed,
}

impl InstallStep {
    /// Position in the fixed wizard sequence, when the state maps to one.
    /// `Failed` keeps whatever step was showing when the failure happened.
    pub fn wizard_index(&self) -> Option<usize> {
        match self {
            InstallStep::Idle => Some(0),
            InstallStep::PreparingFiles
            | InstallStep::Downloading
            | InstallStep::Extracting
            | InstallStep::CertificateCheck => Some(1),
            InstallStep::CertificateManual => Some(2),
            InstallStep::RegisteringPackage | InstallStep::PostInstall => Some(3),
            InstallStep::Complete => Some(4),
            InstallStep::Failed => None,
        }
    }
}

/// Observable state of a run, delivered on every change.
///
/// Consumers that are UI-thread-affine marshal the snapshot through their own
/// dispatcher; the pipeline never calls back on a particular thread.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub step_index: usize,
    pub progress: u8,
    pub message: String,
    pub installing: bool,
    pub complete: bool,
}

/// The single notification channel out of the pipeline.
pub type StatusCallback = Arc<dyn Fn(StatusSnapshot) + Send + Sync>;
