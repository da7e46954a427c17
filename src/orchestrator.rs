//! The installation state machine.
//!
//! One sequential background task drives a run end to end:
//! feed gate → prepare → download → extract → certificate gate →
//! registration → post-install → complete, with a terminal `Failed` state
//! reachable from anywhere. Stage progress is composed from disjoint slices
//! of the 0-100 scale and each stage is forced onto its slice boundary when
//! it returns, so a successful run is observed as a monotonic climb that
//! lands exactly on 40, 60 and 100.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use crate::arch;
use crate::download::ArtifactDownloader;
use crate::error::InstallerError;
use crate::extract;
use crate::metadata::{self, FeedState};
use crate::models::{InstallStep, StatusCallback, VersionMetadata};
use crate::package::PackageInstaller;
use crate::postinstall::PostInstallResolver;
use crate::progress::{DEPLOY_RANGE, DOWNLOAD_RANGE, EXTRACT_RANGE, PREPARE_MARK};
use crate::session::InstallSession;
use crate::task_control::{ensure_not_cancelled, TaskControl};
use crate::trust::{self, TrustGate};

/// Substring expected in the installed package's full name.
pub const DEFAULT_PACKAGE_NAME_HINT: &str = "HarborLauncher";

const MANUAL_CERT_GUIDANCE: &str = "Open the certificate, select Install Certificate, choose \
    Local Machine, place all certificates in the Trusted Root Certification Authorities store, \
    then finish.";

/// What one installation attempt left behind.
pub struct InstallOutcome {
    pub result: Result<(), InstallerError>,
    /// Launch identity of the installed application, when resolution
    /// succeeded.
    pub resolved_aumid: Option<String>,
    /// The session directory (already removed by teardown), for diagnostics.
    pub session_dir: Option<PathBuf>,
}

/// Coordinates all pipeline components for one installation run.
pub struct InstallOrchestrator {
    feed: watch::Receiver<FeedState>,
    downloader: Arc<dyn ArtifactDownloader>,
    trust: TrustGate,
    installer: Arc<dyn PackageInstaller>,
    post_install: PostInstallResolver,
    control: TaskControl,
    package_name_hint: String,
    resolved: Option<VersionMetadata>,
}

impl InstallOrchestrator {
    pub fn new(
        feed: watch::Receiver<FeedState>,
        downloader: Arc<dyn ArtifactDownloader>,
        trust: TrustGate,
        installer: Arc<dyn PackageInstaller>,
        post_install: PostInstallResolver,
        control: TaskControl,
    ) -> Self {
        Self {
            feed,
            downloader,
            trust,
            installer,
            post_install,
            control,
            package_name_hint: DEFAULT_PACKAGE_NAME_HINT.to_string(),
            resolved: None,
        }
    }

    pub fn with_package_name_hint(mut self, hint: impl Into<String>) -> Self {
        self.package_name_hint = hint.into();
        self
    }

    /// Cancellation handle for this run; cancel requests are honored at the
    /// next suspension point.
    pub fn task_control(&self) -> TaskControl {
        self.control.clone()
    }

    /// Release feed contents, once the gate has passed. `None` when the
    /// feed was unavailable and defaults were used.
    pub fn resolved_metadata(&self) -> Option<&VersionMetadata> {
        self.resolved.as_ref()
    }

    /// Run one installation attempt end to end. The terminal state is
    /// always reported through the status callback (Complete at 100, or
    /// Failed with a classified message) and session teardown runs on every
    /// outcome.
    pub async fn run(&mut self, on_status: StatusCallback) -> InstallOutcome {
        // A cancel request from an earlier attempt must not leak into this
        // run; the caller can drive a retry with the same orchestrator.
        self.control.reset();

        let mut session = match InstallSession::create(Arc::clone(&on_status)) {
            Ok(session) => session,
            Err(err) => {
                error!(error = %err, "could not set up the installation session");
                on_status(crate::models::StatusSnapshot {
                    step_index: 1,
                    progress: 0,
                    message: err.user_message(),
                    installing: false,
                    complete: false,
                });
                return InstallOutcome {
                    result: Err(err),
                    resolved_aumid: None,
                    session_dir: None,
                };
            }
        };
        let session_dir = session.temp_path().to_path_buf();

        session.begin();
        let result = self.run_pipeline(&mut session).await;
        match &result {
            Ok(()) => {
                info!("installation completed");
                session.complete();
            }
            Err(err) => {
                error!(error = %err, "installation failed");
                session.fail(err.user_message());
            }
        }
        session.teardown();

        InstallOutcome {
            result,
            resolved_aumid: session.resolved_aumid.clone(),
            session_dir: Some(session_dir),
        }
    }

    async fn run_pipeline(&mut self, session: &mut InstallSession) -> Result<(), InstallerError> {
        // The feed task races ahead of the run; block here until it has
        // published, success or fallback alike.
        let metadata = metadata::wait_ready(&mut self.feed).await;
        self.resolved = metadata.clone();
        ensure_not_cancelled(&self.control, "prepare")?;

        let architecture = arch::detect();
        let url = metadata::select_download_url(metadata.as_ref(), architecture);
        info!(%architecture, %url, "artifact selected");
        session.handle.set_progress(
            PREPARE_MARK,
            format!("Downloading the launcher ({architecture})..."),
        );

        session.handle.enter(InstallStep::Downloading);
        self.downloader
            .download(
                &url,
                session.artifact_path(),
                DOWNLOAD_RANGE,
                &session.handle.progress_fn(),
                &self.control,
            )
            .await?;
        session
            .handle
            .set_progress(DOWNLOAD_RANGE.end, "Download finished, extracting...");

        session.handle.enter(InstallStep::Extracting);
        extract::extract_archive(
            session.artifact_path(),
            session.temp_path(),
            EXTRACT_RANGE,
            session.handle.progress_fn(),
            self.control.clone(),
        )
        .await?;
        session.handle.set_progress(
            EXTRACT_RANGE.end,
            "Extraction finished, checking the certificate...",
        );

        session.handle.enter(InstallStep::CertificateCheck);
        let certificate = trust::find_certificate(session.temp_path())?;
        let manual_handle = session.handle.clone();
        let on_manual_step = move || {
            manual_handle.enter(InstallStep::CertificateManual);
            manual_handle.set_message(MANUAL_CERT_GUIDANCE);
        };
        self.trust
            .ensure_trusted(&certificate, &on_manual_step, &self.control)
            .await?;

        session.handle.enter(InstallStep::RegisteringPackage);
        session
            .handle
            .set_progress(DEPLOY_RANGE.start, "Preparing package registration...");
        let installed = self
            .installer
            .install(
                session.temp_path(),
                DEPLOY_RANGE,
                &session.handle.progress_fn(),
                &self.control,
            )
            .await?;
        info!(package = %installed.display(), "package registered");

        session.handle.enter(InstallStep::PostInstall);
        session
            .handle
            .set_progress(DEPLOY_RANGE.end, "Finishing up...");
        // Launch-identity resolution and the shortcut are conveniences; the
        // package is already registered, so trouble here must not fail the
        // run.
        match self
            .post_install
            .resolve_and_shortcut(&self.package_name_hint)
            .await
        {
            Ok(aumid) => session.resolved_aumid = Some(aumid),
            Err(err) => {
                tracing::warn!(error = %err, "post-install resolution failed, continuing");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::ArtifactDownloader;
    use crate::models::{Mirror, StatusSnapshot};
    use crate::package::{
        DeploymentOptions, DeploymentOutcome, DeploymentService, NativePackageInstaller,
    };
    use crate::postinstall::{InstalledPackage, PackageCatalog, ShortcutService};
    use crate::progress::{ProgressFn, ProgressRange};
    use crate::trust::{compute_thumbprint, CertificateStore};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::io::Write;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::SystemTime;
    use zip::write::SimpleFileOptions;

    const TEST_DER: &[u8] = &[0x30, 0x82, 0x02, 0x01, 0x0A, 0x0B];

    /// Build an artifact archive the way release packaging lays it out.
    fn artifact_bytes(primary_name: &str, dependencies: &[&str], with_cert: bool) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.start_file(primary_name, options).unwrap();
        writer.write_all(b"package").unwrap();
        if with_cert {
            writer.start_file("HarborLauncher.cer", options).unwrap();
            writer.write_all(TEST_DER).unwrap();
        }
        for dependency in dependencies {
            writer.start_file(*dependency, options).unwrap();
            writer.write_all(b"dependency").unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    struct FakeDownloader {
        payload: Vec<u8>,
        requested_urls: Mutex<Vec<String>>,
    }

    impl FakeDownloader {
        fn new(payload: Vec<u8>) -> Self {
            Self {
                payload,
                requested_urls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ArtifactDownloader for FakeDownloader {
        async fn download(
            &self,
            url: &str,
            destination: &Path,
            range: ProgressRange,
            on_progress: &ProgressFn,
            _control: &TaskControl,
        ) -> Result<(), InstallerError> {
            self.requested_urls.lock().unwrap().push(url.to_string());
            std::fs::write(destination, &self.payload)?;
            for pct in [25, 75, 100] {
                on_progress(range.map(pct), format!("Downloading... {pct}%"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeCertStore {
        installed: Mutex<HashSet<String>>,
        trust_on_elevate: bool,
        trust_on_manual_open: bool,
        cancel_on_manual_open: Option<TaskControl>,
        manual_opened: AtomicBool,
    }

    impl FakeCertStore {
        fn preinstalled() -> Self {
            let store = Self::default();
            store
                .installed
                .lock()
                .unwrap()
                .insert(compute_thumbprint(TEST_DER).unwrap());
            store
        }
    }

    #[async_trait]
    impl CertificateStore for FakeCertStore {
        async fn contains(&self, thumbprint: &str) -> bool {
            self.installed.lock().unwrap().contains(thumbprint)
        }

        async fn install_elevated(&self, certificate: &Path) -> Result<(), InstallerError> {
            if self.trust_on_elevate {
                let der = std::fs::read(certificate)?;
                self.installed
                    .lock()
                    .unwrap()
                    .insert(compute_thumbprint(&der)?);
                Ok(())
            } else {
                Err(InstallerError::Permission("elevation declined".into()))
            }
        }

        fn open_for_manual_install(&self, certificate: &Path) -> Result<(), InstallerError> {
            self.manual_opened.store(true, Ordering::SeqCst);
            if let Some(control) = &self.cancel_on_manual_open {
                control.cancel();
            }
            if self.trust_on_manual_open {
                let der = std::fs::read(certificate)?;
                self.installed
                    .lock()
                    .unwrap()
                    .insert(compute_thumbprint(&der)?);
            }
            Ok(())
        }
    }

    struct FakeDeployment {
        registered: Mutex<Vec<(PathBuf, Vec<PathBuf>)>>,
        outcome: DeploymentOutcome,
    }

    impl FakeDeployment {
        fn succeeding() -> Self {
            Self {
                registered: Mutex::new(Vec::new()),
                outcome: DeploymentOutcome {
                    is_registered: true,
                    ..DeploymentOutcome::default()
                },
            }
        }

        fn rejecting(text: &str, code: u32) -> Self {
            Self {
                registered: Mutex::new(Vec::new()),
                outcome: DeploymentOutcome {
                    is_registered: false,
                    error_text: text.to_string(),
                    error_code: code,
                },
            }
        }
    }

    #[async_trait]
    impl DeploymentService for FakeDeployment {
        async fn register(
            &self,
            primary: &Path,
            dependencies: &[PathBuf],
            _options: DeploymentOptions,
            on_progress: &(dyn Fn(u8) + Send + Sync),
        ) -> Result<DeploymentOutcome, InstallerError> {
            self.registered
                .lock()
                .unwrap()
                .push((primary.to_path_buf(), dependencies.to_vec()));
            for pct in [0, 40, 80, 100] {
                on_progress(pct);
            }
            Ok(self.outcome.clone())
        }
    }

    struct FakeCatalog;

    #[async_trait]
    impl PackageCatalog for FakeCatalog {
        async fn installed_packages(&self) -> Result<Vec<InstalledPackage>, InstallerError> {
            Ok(vec![InstalledPackage {
                full_name: "HarborLauncher_1.3.0_x64__abc123".to_string(),
                installed_at: SystemTime::now(),
                app_user_model_ids: vec!["Harbor.Launcher_abc123!App".to_string()],
            }])
        }
    }

    struct FakeShortcuts;

    #[async_trait]
    impl ShortcutService for FakeShortcuts {
        async fn create_shortcut(
            &self,
            _aumid: &str,
            _display_name: &str,
        ) -> Result<(), InstallerError> {
            Ok(())
        }
    }

    struct Harness {
        orchestrator: InstallOrchestrator,
        downloader: Arc<FakeDownloader>,
        cert_store: Arc<FakeCertStore>,
        deployment: Arc<FakeDeployment>,
        snapshots: Arc<Mutex<Vec<StatusSnapshot>>>,
        on_status: StatusCallback,
    }

    fn harness(
        feed: watch::Receiver<FeedState>,
        payload: Vec<u8>,
        cert_store: FakeCertStore,
        deployment: FakeDeployment,
    ) -> Harness {
        harness_with_control(feed, payload, cert_store, deployment, TaskControl::new())
    }

    fn harness_with_control(
        feed: watch::Receiver<FeedState>,
        payload: Vec<u8>,
        cert_store: FakeCertStore,
        deployment: FakeDeployment,
        control: TaskControl,
    ) -> Harness {
        let downloader = Arc::new(FakeDownloader::new(payload));
        let cert_store = Arc::new(cert_store);
        let deployment = Arc::new(deployment);
        let orchestrator = InstallOrchestrator::new(
            feed,
            Arc::clone(&downloader) as Arc<dyn ArtifactDownloader>,
            TrustGate::new(Arc::clone(&cert_store) as Arc<dyn CertificateStore>),
            Arc::new(NativePackageInstaller::new(
                Arc::clone(&deployment) as Arc<dyn DeploymentService>
            )),
            PostInstallResolver::new(Arc::new(FakeCatalog), Arc::new(FakeShortcuts)),
            control,
        );
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&snapshots);
        let on_status: StatusCallback =
            Arc::new(move |snapshot| sink.lock().unwrap().push(snapshot));
        Harness {
            orchestrator,
            downloader,
            cert_store,
            deployment,
            snapshots,
            on_status,
        }
    }

    fn assert_monotonic(snapshots: &[StatusSnapshot]) {
        assert!(snapshots
            .windows(2)
            .all(|pair| pair[0].progress <= pair[1].progress));
    }

    #[tokio::test]
    async fn test_feed_fallback_run_completes_at_one_hundred() {
        // Feed unavailable: the gate still opens and the default URL wins.
        let payload = artifact_bytes("HarborLauncher_x64.msixbundle", &[], true);
        let mut h = harness(
            metadata::preresolved(None),
            payload,
            FakeCertStore::preinstalled(),
            FakeDeployment::succeeding(),
        );

        let outcome = h.orchestrator.run(Arc::clone(&h.on_status)).await;
        outcome.result.unwrap();

        let urls = h.downloader.requested_urls.lock().unwrap().clone();
        assert_eq!(urls, [metadata::default_artifact_url()]);

        let snapshots = h.snapshots.lock().unwrap();
        assert_monotonic(&snapshots);
        let values: Vec<u8> = snapshots.iter().map(|s| s.progress).collect();
        assert!(values.contains(&PREPARE_MARK));
        assert!(values.contains(&40));
        assert!(values.contains(&60));
        assert_eq!(*values.last().unwrap(), 100);
        let last = snapshots.last().unwrap();
        assert!(last.complete);
        assert!(!last.installing);
        assert_eq!(last.step_index, 4);
    }

    #[tokio::test]
    async fn test_feed_metadata_drives_url_selection() {
        let mut arch_urls = HashMap::new();
        let detected = arch::detect();
        arch_urls.insert(
            detected.as_str().to_string(),
            "https://mirror.test/harbor.zip".to_string(),
        );
        let metadata = VersionMetadata {
            version: "1.3.0".to_string(),
            release_time: String::new(),
            download_mirrors: vec![Mirror {
                name: "official".to_string(),
                url: String::new(),
                arch_urls,
            }],
            changelog: Vec::new(),
            important_update: false,
        };
        let payload = artifact_bytes("HarborLauncher_x64.msixbundle", &[], true);
        let mut h = harness(
            metadata::preresolved(Some(metadata)),
            payload,
            FakeCertStore::preinstalled(),
            FakeDeployment::succeeding(),
        );

        h.orchestrator.run(Arc::clone(&h.on_status)).await.result.unwrap();
        let urls = h.downloader.requested_urls.lock().unwrap().clone();
        assert_eq!(urls, ["https://mirror.test/harbor.zip"]);
        assert_eq!(
            h.orchestrator.resolved_metadata().unwrap().version,
            "1.3.0"
        );
    }

    #[tokio::test]
    async fn test_trusted_certificate_never_enters_manual_step() {
        let payload = artifact_bytes("HarborLauncher_x64.msixbundle", &[], true);
        let mut h = harness(
            metadata::preresolved(None),
            payload,
            FakeCertStore::preinstalled(),
            FakeDeployment::succeeding(),
        );

        h.orchestrator.run(Arc::clone(&h.on_status)).await.result.unwrap();

        assert!(!h.cert_store.manual_opened.load(Ordering::SeqCst));
        let snapshots = h.snapshots.lock().unwrap();
        assert!(snapshots.iter().all(|s| s.step_index != 2));
    }

    #[tokio::test]
    async fn test_elevated_install_skips_manual_step() {
        let payload = artifact_bytes("HarborLauncher_x64.msixbundle", &[], true);
        let mut h = harness(
            metadata::preresolved(None),
            payload,
            FakeCertStore {
                trust_on_elevate: true,
                ..FakeCertStore::default()
            },
            FakeDeployment::succeeding(),
        );

        h.orchestrator.run(Arc::clone(&h.on_status)).await.result.unwrap();
        assert!(!h.cert_store.manual_opened.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_certificate_step_branches_and_returns() {
        let payload = artifact_bytes("HarborLauncher_x64.msixbundle", &[], true);
        let mut h = harness(
            metadata::preresolved(None),
            payload,
            FakeCertStore {
                trust_on_manual_open: true,
                ..FakeCertStore::default()
            },
            FakeDeployment::succeeding(),
        );

        h.orchestrator.run(Arc::clone(&h.on_status)).await.result.unwrap();

        assert!(h.cert_store.manual_opened.load(Ordering::SeqCst));
        let snapshots = h.snapshots.lock().unwrap();
        assert!(snapshots.iter().any(|s| s.step_index == 2));
        // After the manual branch the run returns to the install step and
        // finishes.
        assert_eq!(snapshots.last().unwrap().step_index, 4);
        assert_monotonic(&snapshots);
    }

    #[tokio::test]
    async fn test_architecture_filtered_dependencies_reach_deployment() {
        let payload = artifact_bytes(
            "HarborLauncher_arm64.msixbundle",
            &[
                "Dependencies/x64/dep.appx",
                "Dependencies/arm64/dep.appx",
                "Dependencies/neutral/dep2.appx",
            ],
            true,
        );
        let mut h = harness(
            metadata::preresolved(None),
            payload,
            FakeCertStore::preinstalled(),
            FakeDeployment::succeeding(),
        );

        h.orchestrator.run(Arc::clone(&h.on_status)).await.result.unwrap();

        let registered = h.deployment.registered.lock().unwrap();
        let (primary, dependencies) = &registered[0];
        assert_eq!(primary.file_name().unwrap(), "HarborLauncher_arm64.msixbundle");
        let names: Vec<String> = dependencies
            .iter()
            .map(|path| {
                path.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(dependencies.len(), 2);
        assert!(names.contains(&"dep.appx".to_string()));
        assert!(names.contains(&"dep2.appx".to_string()));
        assert!(dependencies
            .iter()
            .all(|path| !path.to_string_lossy().replace('\\', "/").contains("/x64/")));
    }

    #[tokio::test]
    async fn test_deployment_rejection_fails_with_diagnostic() {
        let payload = artifact_bytes("HarborLauncher_x64.msixbundle", &[], true);
        let mut h = harness(
            metadata::preresolved(None),
            payload,
            FakeCertStore::preinstalled(),
            FakeDeployment::rejecting("certificate chain not trusted", 0x800B_0109),
        );

        let outcome = h.orchestrator.run(Arc::clone(&h.on_status)).await;
        assert!(matches!(
            outcome.result,
            Err(InstallerError::Deployment { code: 0x800B_0109, .. })
        ));

        let snapshots = h.snapshots.lock().unwrap();
        let last = snapshots.last().unwrap();
        assert!(last.message.contains("certificate chain not trusted"));
        assert!(!last.installing);
        assert!(!last.complete);
        // Teardown ran on the failure path too.
        assert!(!outcome.session_dir.unwrap().exists());
    }

    #[tokio::test]
    async fn test_missing_certificate_fails_before_trust_gate() {
        let payload = artifact_bytes("HarborLauncher_x64.msixbundle", &[], false);
        let mut h = harness(
            metadata::preresolved(None),
            payload,
            FakeCertStore::preinstalled(),
            FakeDeployment::succeeding(),
        );

        let outcome = h.orchestrator.run(Arc::clone(&h.on_status)).await;
        assert!(matches!(outcome.result, Err(InstallerError::FileSystem(_))));
        assert!(!outcome.session_dir.unwrap().exists());
    }

    #[tokio::test]
    async fn test_teardown_removes_session_dir_on_success() {
        let payload = artifact_bytes("HarborLauncher_x64.msixbundle", &[], true);
        let mut h = harness(
            metadata::preresolved(None),
            payload,
            FakeCertStore::preinstalled(),
            FakeDeployment::succeeding(),
        );

        let outcome = h.orchestrator.run(Arc::clone(&h.on_status)).await;
        outcome.result.unwrap();
        assert!(!outcome.session_dir.unwrap().exists());
        assert_eq!(
            outcome.resolved_aumid.as_deref(),
            Some("Harbor.Launcher_abc123!App")
        );
    }

    #[tokio::test]
    async fn test_cancellation_during_manual_poll_aborts_run() {
        let payload = artifact_bytes("HarborLauncher_x64.msixbundle", &[], true);
        // The store cancels the run the moment the manual fallback opens the
        // certificate; the next poll tick observes the flag.
        let control = TaskControl::new();
        let mut h = harness_with_control(
            metadata::preresolved(None),
            payload,
            FakeCertStore {
                cancel_on_manual_open: Some(control.clone()),
                ..FakeCertStore::default()
            },
            FakeDeployment::succeeding(),
            control,
        );

        let outcome = h.orchestrator.run(Arc::clone(&h.on_status)).await;
        assert!(matches!(outcome.result, Err(InstallerError::Cancelled)));
        let snapshots = h.snapshots.lock().unwrap();
        assert_eq!(
            snapshots.last().unwrap().message,
            "Installation cancelled."
        );
        assert!(!outcome.session_dir.unwrap().exists());
    }
}
