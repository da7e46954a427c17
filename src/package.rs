//! Package selection and registration.
//!
//! The extracted tree carries one installable application package at its top
//! level and, optionally, a `Dependencies/` tree with `neutral/` and
//! per-architecture subfolders. Registration itself goes through one of two
//! interchangeable strategies chosen at construction time: the native
//! deployment service, or the install script bundled with the artifact.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::arch::Architecture;
use crate::error::InstallerError;
use crate::progress::{ProgressFn, ProgressRange};
use crate::task_control::{ensure_not_cancelled, TaskControl};

/// Bundle forms are preferred over single-package forms when both exist.
const BUNDLE_EXTENSIONS: [&str; 2] = ["msixbundle", "appxbundle"];
const PACKAGE_EXTENSIONS: [&str; 2] = ["msix", "appx"];

const DEPENDENCIES_DIR: &str = "Dependencies";
const NEUTRAL_DIR: &str = "neutral";
const INSTALL_SCRIPT: &str = "Install.ps1";

/// Registers the extracted package with the OS. Two implementations:
/// [`NativePackageInstaller`] and [`ScriptPackageInstaller`].
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Register the package found under `extracted`, mapping registration
    /// progress into `range`. Returns the path that was handed to the OS.
    async fn install(
        &self,
        extracted: &Path,
        range: ProgressRange,
        on_progress: &ProgressFn,
        control: &TaskControl,
    ) -> Result<PathBuf, InstallerError>;
}

/// Registration flags passed to the deployment service.
#[derive(Debug, Clone, Copy)]
pub struct DeploymentOptions {
    /// Force-close running instances of the target application.
    pub force_target_shutdown: bool,
    /// Force-close the application performing the install if it holds the
    /// package in use.
    pub force_installer_shutdown: bool,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            force_target_shutdown: true,
            force_installer_shutdown: true,
        }
    }
}

/// Result of a deployment operation as reported by the OS.
#[derive(Debug, Clone, Default)]
pub struct DeploymentOutcome {
    pub is_registered: bool,
    pub error_text: String,
    pub error_code: u32,
}

/// OS package-deployment capability.
#[async_trait]
pub trait DeploymentService: Send + Sync {
    /// Register `primary` with `dependencies`. `on_progress` receives the
    /// operation's own 0-100 completion.
    async fn register(
        &self,
        primary: &Path,
        dependencies: &[PathBuf],
        options: DeploymentOptions,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<DeploymentOutcome, InstallerError>;
}

/// Runs a script with elevation and reports its exit code.
#[async_trait]
pub trait ElevatedRunner: Send + Sync {
    async fn run_elevated(&self, script: &Path) -> Result<i32, InstallerError>;
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

fn is_package_file(path: &Path) -> bool {
    extension_of(path)
        .map(|ext| {
            BUNDLE_EXTENSIONS.contains(&ext.as_str()) || PACKAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Pick the installable package at the top of the extracted tree, bundle
/// forms first.
pub fn select_primary_package(extracted: &Path) -> Result<PathBuf, InstallerError> {
    let mut bundle: Option<PathBuf> = None;
    let mut single: Option<PathBuf> = None;
    for entry in std::fs::read_dir(extracted)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(ext) = extension_of(&path) else {
            continue;
        };
        if BUNDLE_EXTENSIONS.contains(&ext.as_str()) {
            bundle.get_or_insert(path);
        } else if PACKAGE_EXTENSIONS.contains(&ext.as_str()) {
            single.get_or_insert(path);
        }
    }
    bundle.or(single).ok_or_else(|| {
        InstallerError::FileSystem(
            "no installable package found at the top of the extracted archive".into(),
        )
    })
}

/// Infer the package's target architecture from markers in its filename.
/// Checked in priority order so "x64" never matches inside an arm64 name.
/// `None` means the name carries no marker at all.
pub fn infer_package_architecture(file_name: &str) -> Option<Architecture> {
    let lower = file_name.to_lowercase();
    if lower.contains("arm64") {
        Some(Architecture::Arm64)
    } else if lower.contains("x64") {
        Some(Architecture::X64)
    } else if lower.contains("x86") {
        Some(Architecture::X86)
    } else {
        None
    }
}

/// Collect dependency packages matching the target architecture.
///
/// A dependency qualifies when its containing folder is the root
/// `Dependencies` folder, `neutral`, or the target architecture's folder.
/// Without an architecture marker on the primary, only root-level and
/// `neutral` dependencies are taken.
pub fn select_dependencies(extracted: &Path, target: Option<Architecture>) -> Vec<PathBuf> {
    let root = extracted.join(DEPENDENCIES_DIR);
    if !root.is_dir() {
        return Vec::new();
    }

    let mut selected = Vec::new();
    for entry in WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        if !entry.file_type().is_file() || !is_package_file(entry.path()) {
            continue;
        }
        let folder = entry
            .path()
            .parent()
            .and_then(|parent| parent.file_name())
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let included = folder.eq_ignore_ascii_case(DEPENDENCIES_DIR)
            || folder.eq_ignore_ascii_case(NEUTRAL_DIR)
            || target
                .map(|arch| folder.eq_ignore_ascii_case(arch.as_str()))
                .unwrap_or(false);
        if included {
            selected.push(entry.into_path());
        } else {
            debug!(dependency = %entry.path().display(), "skipping dependency for another architecture");
        }
    }
    selected.sort();
    selected
}

/// Packages chosen from one extracted tree. Derived per run, never cached.
#[derive(Debug, Clone)]
pub struct PackageSelection {
    pub primary: PathBuf,
    pub dependencies: Vec<PathBuf>,
}

/// Select the primary package and its architecture-filtered dependencies.
pub fn select_packages(extracted: &Path) -> Result<PackageSelection, InstallerError> {
    let primary = select_primary_package(extracted)?;
    let file_name = primary
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target_arch = infer_package_architecture(&file_name);
    let dependencies = select_dependencies(extracted, target_arch);
    Ok(PackageSelection {
        primary,
        dependencies,
    })
}

/// Registers through the OS deployment service.
pub struct NativePackageInstaller {
    deployment: Arc<dyn DeploymentService>,
    options: DeploymentOptions,
}

impl NativePackageInstaller {
    pub fn new(deployment: Arc<dyn DeploymentService>) -> Self {
        Self {
            deployment,
            options: DeploymentOptions::default(),
        }
    }
}

#[async_trait]
impl PackageInstaller for NativePackageInstaller {
    async fn install(
        &self,
        extracted: &Path,
        range: ProgressRange,
        on_progress: &ProgressFn,
        control: &TaskControl,
    ) -> Result<PathBuf, InstallerError> {
        ensure_not_cancelled(control, "register")?;

        let selection = select_packages(extracted)?;
        info!(
            package = %selection.primary.display(),
            dependencies = selection.dependencies.len(),
            "registering package"
        );

        let last_emitted = AtomicI32::new(-1);
        let sink = |operation_pct: u8| {
            let mapped = range.map(operation_pct);
            if last_emitted.swap(i32::from(mapped), Ordering::Relaxed) != i32::from(mapped) {
                on_progress(mapped, format!("Registering package... {operation_pct}%"));
            }
        };

        let outcome = self
            .deployment
            .register(&selection.primary, &selection.dependencies, self.options, &sink)
            .await?;
        ensure_not_cancelled(control, "register")?;

        if !outcome.is_registered {
            return Err(InstallerError::Deployment {
                text: outcome.error_text,
                code: outcome.error_code,
            });
        }
        Ok(selection.primary)
    }
}

/// Registers by running the install script bundled with the artifact.
pub struct ScriptPackageInstaller {
    runner: Arc<dyn ElevatedRunner>,
}

impl ScriptPackageInstaller {
    pub fn new(runner: Arc<dyn ElevatedRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl PackageInstaller for ScriptPackageInstaller {
    async fn install(
        &self,
        extracted: &Path,
        range: ProgressRange,
        on_progress: &ProgressFn,
        control: &TaskControl,
    ) -> Result<PathBuf, InstallerError> {
        let script = extracted.join(INSTALL_SCRIPT);
        if !script.is_file() {
            return Err(InstallerError::FileSystem(format!(
                "no {INSTALL_SCRIPT} found in the extracted package"
            )));
        }

        ensure_not_cancelled(control, "register")?;
        on_progress(range.start, "Running the install script...".to_string());
        let exit_code = self.runner.run_elevated(&script).await?;
        ensure_not_cancelled(control, "register")?;

        if exit_code != 0 {
            return Err(InstallerError::Deployment {
                text: format!("install script exited with code {exit_code}"),
                code: exit_code as u32,
            });
        }
        Ok(script)
    }
}
