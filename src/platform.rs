//! Process-backed implementations of the OS capability traits.
//!
//! The trust store, the package deployment service, the installed-package
//! catalog and shortcut creation are reached through `certutil` and
//! PowerShell rather than native bindings, so the crate builds and tests on
//! every platform while the real collaborators stay Windows commands at
//! runtime.

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::InstallerError;
use crate::package::{DeploymentOptions, DeploymentOutcome, DeploymentService, ElevatedRunner};
use crate::postinstall::{InstalledPackage, PackageCatalog, ShortcutService};
use crate::trust::CertificateStore;

const TRUSTED_ROOT_STORE: &str = "Root";

fn quote(path: &Path) -> String {
    format!("\"{}\"", path.display())
}

async fn run_powershell(command_text: &str) -> Result<std::process::Output, InstallerError> {
    debug!(command = command_text, "invoking powershell");
    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", command_text])
        .output()
        .await?;
    Ok(output)
}

/// Machine trust store backed by `certutil`.
pub struct OsCertificateStore;

#[async_trait]
impl CertificateStore for OsCertificateStore {
    async fn contains(&self, thumbprint: &str) -> bool {
        let output = Command::new("certutil")
            .args(["-store", TRUSTED_ROOT_STORE, thumbprint])
            .output()
            .await;
        match output {
            Ok(output) => output.status.success(),
            Err(err) => {
                debug!(error = %err, "certutil store query failed, treating as untrusted");
                false
            }
        }
    }

    async fn install_elevated(&self, certificate: &Path) -> Result<(), InstallerError> {
        let command_text = format!(
            "Start-Process certutil -ArgumentList '-addstore','{TRUSTED_ROOT_STORE}',{} -Verb RunAs -Wait",
            quote(certificate)
        );
        let output = run_powershell(&command_text).await?;
        if !output.status.success() {
            return Err(InstallerError::Permission(
                "elevated certificate install was refused".into(),
            ));
        }
        Ok(())
    }

    fn open_for_manual_install(&self, certificate: &Path) -> Result<(), InstallerError> {
        opener::open(certificate).map_err(|err| {
            InstallerError::FileSystem(format!("could not open the certificate: {err}"))
        })
    }
}

/// Package registration through `Add-AppxPackage`.
///
/// PowerShell offers no hook into the deployment operation's own progress
/// stream, so this implementation reports start and completion only; the
/// mapped sub-range still moves through the trait contract.
pub struct PowershellDeployment;

#[async_trait]
impl DeploymentService for PowershellDeployment {
    async fn register(
        &self,
        primary: &Path,
        dependencies: &[PathBuf],
        options: DeploymentOptions,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<DeploymentOutcome, InstallerError> {
        on_progress(0);

        let mut command_text = format!("Add-AppxPackage -Path {}", quote(primary));
        if !dependencies.is_empty() {
            let list = dependencies
                .iter()
                .map(|path| quote(path))
                .collect::<Vec<_>>()
                .join(",");
            command_text.push_str(&format!(" -DependencyPath {list}"));
        }
        if options.force_target_shutdown {
            command_text.push_str(" -ForceTargetApplicationShutdown");
        }
        if options.force_installer_shutdown {
            command_text.push_str(" -ForceApplicationShutdown");
        }

        let output = run_powershell(&command_text).await?;
        on_progress(100);

        if output.status.success() {
            Ok(DeploymentOutcome {
                is_registered: true,
                ..DeploymentOutcome::default()
            })
        } else {
            Ok(DeploymentOutcome {
                is_registered: false,
                error_text: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                error_code: output.status.code().unwrap_or(-1) as u32,
            })
        }
    }
}

/// Installed-package enumeration through `Get-AppxPackage`.
pub struct PowershellCatalog;

const CATALOG_SCRIPT: &str = r#"Get-AppxPackage | ForEach-Object {
    $manifest = $null
    try { $manifest = Get-AppxPackageManifest $_ } catch {}
    [pscustomobject]@{
        fullName = $_.PackageFullName
        familyName = $_.PackageFamilyName
        installedAt = [int64]((Get-Item $_.InstallLocation).CreationTimeUtc - [datetime]'1970-01-01').TotalSeconds
        appIds = @($manifest.Package.Applications.Application.Id)
    }
} | ConvertTo-Json -Compress"#;

fn parse_catalog_payload(payload: &str) -> Vec<InstalledPackage> {
    let parsed: serde_json::Value = match serde_json::from_str(payload.trim()) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "unparsable package catalog payload");
            return Vec::new();
        }
    };

    // A single package serializes as one object, not a one-element array.
    let entries: Vec<&serde_json::Value> = match &parsed {
        serde_json::Value::Array(items) => items.iter().collect(),
        serde_json::Value::Object(_) => vec![&parsed],
        _ => Vec::new(),
    };

    entries
        .into_iter()
        .filter_map(|entry| {
            let full_name = entry.get("fullName")?.as_str()?.trim().to_string();
            if full_name.is_empty() {
                return None;
            }
            let family_name = entry
                .get("familyName")
                .and_then(|value| value.as_str())
                .unwrap_or_default();
            let installed_secs = entry
                .get("installedAt")
                .and_then(|value| value.as_i64())
                .unwrap_or(0)
                .max(0) as u64;
            let app_ids: Vec<String> = match entry.get("appIds") {
                Some(serde_json::Value::Array(ids)) => ids
                    .iter()
                    .filter_map(|id| id.as_str())
                    .map(|id| id.to_string())
                    .collect(),
                Some(serde_json::Value::String(id)) => vec![id.clone()],
                _ => Vec::new(),
            };
            let app_user_model_ids = app_ids
                .into_iter()
                .map(|id| format!("{family_name}!{id}"))
                .collect();
            Some(InstalledPackage {
                full_name,
                installed_at: UNIX_EPOCH + Duration::from_secs(installed_secs),
                app_user_model_ids,
            })
        })
        .collect()
}

#[async_trait]
impl PackageCatalog for PowershellCatalog {
    async fn installed_packages(&self) -> Result<Vec<InstalledPackage>, InstallerError> {
        let output = run_powershell(CATALOG_SCRIPT).await?;
        if !output.status.success() {
            return Err(InstallerError::Unknown(format!(
                "package enumeration failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_catalog_payload(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Desktop shortcut creation targeting a launch identity.
pub struct PowershellShortcut;

#[async_trait]
impl ShortcutService for PowershellShortcut {
    async fn create_shortcut(
        &self,
        aumid: &str,
        display_name: &str,
    ) -> Result<(), InstallerError> {
        let command_text = format!(
            "$shell = New-Object -ComObject WScript.Shell; \
             $desktop = [Environment]::GetFolderPath('Desktop'); \
             $shortcut = $shell.CreateShortcut((Join-Path $desktop '{display_name}.lnk')); \
             $shortcut.TargetPath = 'shell:AppsFolder\\{aumid}'; \
             $shortcut.Save()"
        );
        let output = run_powershell(&command_text).await?;
        if !output.status.success() {
            return Err(InstallerError::Unknown(format!(
                "shortcut creation failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Elevated execution of the artifact's install script.
pub struct PowershellElevatedRunner;

#[async_trait]
impl ElevatedRunner for PowershellElevatedRunner {
    async fn run_elevated(&self, script: &Path) -> Result<i32, InstallerError> {
        let command_text = format!(
            "$process = Start-Process powershell -ArgumentList \
             '-ExecutionPolicy','Bypass','-File',{} -Verb RunAs -Wait -PassThru; \
             exit $process.ExitCode",
            quote(script)
        );
        let status = Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", &command_text])
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Shell-launch an installed application by its launch identity.
pub async fn launch_application(aumid: &str) -> Result<(), InstallerError> {
    let target = format!("shell:AppsFolder\\{aumid}");
    Command::new("explorer.exe").arg(&target).spawn()?;
    Ok(())
}
