//! Installation pipeline for sideloading the Harbor Launcher desktop app.
//!
//! The pipeline resolves release metadata, downloads and extracts the
//! architecture-appropriate artifact, makes sure the signing certificate is
//! trusted machine-wide, registers the application package and finishes with
//! launch-identity resolution and shortcut creation. Everything the pipeline
//! needs from the operating system is consumed through capability traits so
//! the whole flow can run against fakes in tests. Presentation is out of
//! scope: callers observe the run through a single status callback.

pub mod arch;
pub mod download;
pub mod error;
pub mod extract;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod package;
pub mod platform;
pub mod postinstall;
pub mod progress;
pub mod session;
pub mod task_control;
pub mod trust;

pub(crate) const USER_AGENT: &str = "Harbor Installer";

pub use error::InstallerError;
pub use models::{StatusCallback, StatusSnapshot, STEP_TITLES};
pub use orchestrator::{InstallOrchestrator, InstallOutcome};
pub use task_control::TaskControl;
