use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use harbor_installer::download::HttpDownloader;
use harbor_installer::metadata;
use harbor_installer::orchestrator::InstallOrchestrator;
use harbor_installer::package::{NativePackageInstaller, PackageInstaller, ScriptPackageInstaller};
use harbor_installer::platform::{
    launch_application, OsCertificateStore, PowershellCatalog, PowershellDeployment,
    PowershellElevatedRunner, PowershellShortcut,
};
use harbor_installer::postinstall::PostInstallResolver;
use harbor_installer::trust::TrustGate;
use harbor_installer::{StatusCallback, StatusSnapshot, TaskControl, STEP_TITLES};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // The feed fetch races ahead while everything else is wired up.
    let feed = metadata::spawn_feed_fetch();

    let installer: Arc<dyn PackageInstaller> =
        match std::env::var("HARBOR_INSTALL_MODE").as_deref() {
            Ok("script") => Arc::new(ScriptPackageInstaller::new(Arc::new(
                PowershellElevatedRunner,
            ))),
            _ => Arc::new(NativePackageInstaller::new(Arc::new(PowershellDeployment))),
        };

    let mut orchestrator = InstallOrchestrator::new(
        feed,
        Arc::new(HttpDownloader::new()?),
        TrustGate::new(Arc::new(OsCertificateStore)),
        installer,
        PostInstallResolver::new(Arc::new(PowershellCatalog), Arc::new(PowershellShortcut)),
        TaskControl::new(),
    );

    let control = orchestrator.task_control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            control.cancel();
        }
    });

    let on_status: StatusCallback = Arc::new(|snapshot: StatusSnapshot| {
        println!(
            "[{}] {:>3}% {}",
            STEP_TITLES[snapshot.step_index], snapshot.progress, snapshot.message
        );
    });

    let outcome = orchestrator.run(on_status).await;
    outcome.result.map_err(|err| anyhow::anyhow!(err.user_message()))?;

    if let Some(metadata) = orchestrator.resolved_metadata() {
        info!(version = %metadata.version, "installed version");
    }
    if let Some(aumid) = outcome.resolved_aumid.as_deref() {
        if std::env::var("HARBOR_LAUNCH_AFTER_INSTALL").is_ok() {
            info!(%aumid, "launching the installed application");
            launch_application(aumid).await?;
        }
    }
    Ok(())
}
