use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::InstallerError;

/// One installed package as seen by the per-user catalog.
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub full_name: String,
    pub installed_at: SystemTime,
    /// Launch identities of the package's application entries, in manifest
    /// order.
    pub app_user_model_ids: Vec<String>,
}

/// Enumeration of packages installed for the current user.
#[async_trait]
pub trait PackageCatalog: Send + Sync {
    async fn installed_packages(&self) -> Result<Vec<InstalledPackage>, InstallerError>;
}

/// Shortcut creation toward a launch identity.
#[async_trait]
pub trait ShortcutService: Send + Sync {
    async fn create_shortcut(&self, aumid: &str, display_name: &str)
        -> Result<(), InstallerError>;
}

/// Resolves the freshly registered application's launch identity and creates
/// its shortcut.
pub struct PostInstallResolver {
    catalog: Arc<dyn PackageCatalog>,
    shortcuts: Arc<dyn ShortcutService>,
}

impl PostInstallResolver {
    pub fn new(catalog: Arc<dyn PackageCatalog>, shortcuts: Arc<dyn ShortcutService>) -> Self {
        Self { catalog, shortcuts }
    }

    /// Find the installed package matching `package_name_hint`
    /// (case-insensitive substring, most recent install wins), return its
    /// first launch identity and create a shortcut for it. Shortcut failure
    /// is reported but never aborts the install — it is a convenience, not a
    /// correctness requirement.
    pub async fn resolve_and_shortcut(
        &self,
        package_name_hint: &str,
    ) -> Result<String, InstallerError> {
        let needle = package_name_hint.to_lowercase();
        let packages = self.catalog.installed_packages().await?;
        let best = packages
            .into_iter()
            .filter(|package| package.full_name.to_lowercase().contains(&needle))
            .max_by_key(|package| package.installed_at)
            .ok_or_else(|| {
                InstallerError::FileSystem(format!(
                    "no installed package matches '{package_name_hint}'"
                ))
            })?;

        let aumid = best
            .app_user_model_ids
            .first()
            .cloned()
            .ok_or_else(|| {
                InstallerError::Unknown(format!(
                    "package '{}' has no launchable application entry",
                    best.full_name
                ))
            })?;
        info!(package = %best.full_name, %aumid, "resolved launch identity");

        if let Err(err) = self
            .shortcuts
            .create_shortcut(&aumid, package_name_hint)
            .await
        {
            warn!(error = %err, "shortcut creation failed, continuing");
        }
        Ok(aumid)
    }
}
