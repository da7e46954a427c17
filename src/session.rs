//! Per-attempt installation session.
//!
//! The session owns every piece of mutable run state: the state-machine
//! step, the overall progress value and message, and the temp directory the
//! artifact is downloaded and extracted into. State changes go out through
//! exactly one callback as immutable snapshots; progress is clamped so it
//! can never be observed decreasing within an attempt.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::InstallerError;
use crate::models::{InstallStep, StatusCallback, StatusSnapshot};
use crate::progress::{ProgressFn, COMPLETE_MARK};

const TEMP_PREFIX: &str = "harbor_install_";
const ARTIFACT_FILE_NAME: &str = "HarborLauncher.zip";

struct SessionState {
    step: InstallStep,
    step_index: usize,
    progress: u8,
    message: String,
    installing: bool,
    complete: bool,
}

/// Cheap handle onto the session's observable state, cloneable into
/// progress callbacks running on other tasks.
#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<Mutex<SessionState>>,
    on_status: StatusCallback,
}

impl SessionHandle {
    fn new(on_status: StatusCallback) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState {
                step: InstallStep::Idle,
                step_index: 0,
                progress: 0,
                message: String::new(),
                installing: false,
                complete: false,
            })),
            on_status,
        }
    }

    fn snapshot_locked(state: &SessionState) -> StatusSnapshot {
        StatusSnapshot {
            step_index: state.step_index,
            progress: state.progress,
            message: state.message.clone(),
            installing: state.installing,
            complete: state.complete,
        }
    }

    fn emit(&self, snapshot: StatusSnapshot) {
        (self.on_status)(snapshot);
    }

    /// Advance the state machine. Always notifies, even when the wizard
    /// index stays put.
    pub fn enter(&self, step: InstallStep) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.step = step;
            if let Some(index) = step.wizard_index() {
                state.step_index = index;
            }
            Self::snapshot_locked(&state)
        };
        debug!(?step, "state transition");
        self.emit(snapshot);
    }

    /// Set progress and message. Progress is clamped to be non-decreasing;
    /// nothing is emitted unless something observable changed.
    pub fn set_progress(&self, value: u8, message: impl Into<String>) {
        let message = message.into();
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            let clamped = value.max(state.progress);
            if clamped == state.progress && message == state.message {
                return;
            }
            state.progress = clamped;
            state.message = message;
            Self::snapshot_locked(&state)
        };
        self.emit(snapshot);
    }

    /// Replace the message without touching progress.
    pub fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if message == state.message {
                return;
            }
            state.message = message;
            Self::snapshot_locked(&state)
        };
        self.emit(snapshot);
    }

    /// Adapter for stage callbacks that report (mapped value, message).
    pub fn progress_fn(&self) -> ProgressFn {
        let handle = self.clone();
        Arc::new(move |value, message| handle.set_progress(value, message))
    }

    pub fn progress(&self) -> u8 {
        self.state.lock().unwrap().progress
    }

    pub fn step(&self) -> InstallStep {
        self.state.lock().unwrap().step
    }

    fn begin(&self) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.step = InstallStep::PreparingFiles;
            state.step_index = 1;
            state.progress = 0;
            state.message = "Preparing installation files...".to_string();
            state.installing = true;
            state.complete = false;
            Self::snapshot_locked(&state)
        };
        self.emit(snapshot);
    }

    fn complete(&self) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.step = InstallStep::Complete;
            state.step_index = 4;
            state.progress = COMPLETE_MARK;
            state.message = "Installation complete!".to_string();
            state.installing = false;
            state.complete = true;
            Self::snapshot_locked(&state)
        };
        self.emit(snapshot);
    }

    fn fail(&self, message: String) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.step = InstallStep::Failed;
            state.message = message;
            state.installing = false;
            Self::snapshot_locked(&state)
        };
        self.emit(snapshot);
    }
}

/// One installation attempt's resources and observable state.
pub struct InstallSession {
    pub handle: SessionHandle,
    temp_dir: Option<TempDir>,
    temp_path: PathBuf,
    artifact_path: PathBuf,
    pub resolved_aumid: Option<String>,
}

impl InstallSession {
    /// Create the session and its private temp directory.
    pub fn create(on_status: StatusCallback) -> Result<Self, InstallerError> {
        let temp_dir = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir()
            .map_err(|err| {
                InstallerError::FileSystem(format!("could not create the session directory: {err}"))
            })?;
        let temp_path = temp_dir.path().to_path_buf();
        let artifact_path = temp_path.join(ARTIFACT_FILE_NAME);
        debug!(path = %temp_path.display(), "session directory created");
        Ok(Self {
            handle: SessionHandle::new(on_status),
            temp_dir: Some(temp_dir),
            temp_path,
            artifact_path,
            resolved_aumid: None,
        })
    }

    /// Working directory the artifact is downloaded and extracted into.
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Destination of the downloaded archive.
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn begin(&self) {
        self.handle.begin();
    }

    pub fn complete(&self) {
        self.handle.complete();
    }

    pub fn fail(&self, message: String) {
        self.handle.fail(message);
    }

    /// Remove the session's temp directory. Runs on every outcome; removal
    /// failure (including a directory someone already cleaned up) is logged
    /// and swallowed.
    pub fn teardown(&mut self) {
        let Some(temp_dir) = self.temp_dir.take() else {
            return;
        };
        let path = temp_dir.path().to_path_buf();
        if let Err(err) = temp_dir.close() {
            warn!(path = %path.display(), error = %err,
                "could not remove the session directory");
        } else {
            debug!(path = %path.display(), "session directory removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collecting_session() -> (InstallSession, Arc<StdMutex<Vec<StatusSnapshot>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let on_status: StatusCallback =
            Arc::new(move |snapshot| sink.lock().unwrap().push(snapshot));
        (InstallSession::create(on_status).unwrap(), seen)
    }

    #[test]
    fn test_progress_never_decreases() {
        let (session, seen) = collecting_session();
        session.begin();
        session.handle.set_progress(50, "halfway");
        session.handle.set_progress(30, "stale update");
        assert_eq!(session.handle.progress(), 50);
        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|pair| pair[0].progress <= pair[1].progress));
    }

    #[test]
    fn test_unchanged_progress_and_message_not_emitted() {
        let (session, seen) = collecting_session();
        session.handle.set_progress(10, "downloading");
        session.handle.set_progress(10, "downloading");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_complete_lands_on_one_hundred() {
        let (session, seen) = collecting_session();
        session.begin();
        session.handle.set_progress(99, "almost");
        session.complete();
        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.progress, 100);
        assert_eq!(last.step_index, 4);
        assert!(last.complete);
        assert!(!last.installing);
    }

    #[test]
    fn test_fail_keeps_step_index_and_stops_installing() {
        let (session, seen) = collecting_session();
        session.begin();
        session.handle.enter(InstallStep::Downloading);
        session.fail("Installation failed: file operation error.".into());
        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.step_index, 1);
        assert!(!last.installing);
        assert!(!last.complete);
        assert_eq!(session.handle.step(), InstallStep::Failed);
    }

    #[test]
    fn test_teardown_removes_temp_dir() {
        let (mut session, _) = collecting_session();
        let path = session.temp_path().to_path_buf();
        assert!(path.is_dir());
        session.teardown();
        assert!(!path.exists());
    }

    #[test]
    fn test_teardown_tolerates_already_removed_dir() {
        let (mut session, _) = collecting_session();
        let path = session.temp_path().to_path_buf();
        std::fs::remove_dir_all(&path).unwrap();
        session.teardown();
        assert!(!path.exists());
        // Second call is a no-op.
        session.teardown();
    }

    #[test]
    fn test_manual_certificate_step_branches_and_returns() {
        let (session, seen) = collecting_session();
        session.begin();
        session.handle.enter(InstallStep::CertificateCheck);
        session.handle.enter(InstallStep::CertificateManual);
        session.handle.enter(InstallStep::RegisteringPackage);
        let indices: Vec<usize> = seen.lock().unwrap().iter().map(|s| s.step_index).collect();
        assert_eq!(indices, vec![1, 1, 2, 3]);
    }
}
