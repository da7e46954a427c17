use thiserror::Error;

/// Failure classes surfaced by the installation pipeline.
///
/// The variants map to how a failure is presented to the user: network and
/// parse problems fall back to defaults upstream, permission problems carry
/// an explicit elevation instruction, deployment rejections carry the OS
/// diagnostic verbatim.
#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("network error: {0}")]
    Network(String),

    #[error("malformed metadata: {0}")]
    Parse(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("file system error: {0}")]
    FileSystem(String),

    #[error("package deployment rejected: {text} ({code:#010X})")]
    Deployment { text: String, code: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Unknown(String),
}

impl InstallerError {
    /// User-facing message for the terminal `Failed` state.
    pub fn user_message(&self) -> String {
        match self {
            InstallerError::Network(detail) => {
                format!("Installation failed: a network error occurred.\n{detail}")
            }
            InstallerError::Parse(detail) => {
                format!("Installation failed: the release information could not be read.\n{detail}")
            }
            InstallerError::Permission(detail) => format!(
                "Installation failed: insufficient permissions. \
                 Run the installer as an elevated user.\n{detail}"
            ),
            InstallerError::FileSystem(detail) => {
                format!("Installation failed: file operation error.\n{detail}")
            }
            InstallerError::Deployment { text, code } => format!(
                "Installation failed: the system rejected the package ({code:#010X}).\n{text}"
            ),
            InstallerError::Cancelled => "Installation cancelled.".to_string(),
            InstallerError::Unknown(detail) => {
                format!("Installation failed: an unexpected error occurred.\n{detail}")
            }
        }
    }
}

impl From<std::io::Error> for InstallerError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => InstallerError::Permission(err.to_string()),
            _ => InstallerError::FileSystem(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for InstallerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            InstallerError::Parse(err.to_string())
        } else {
            InstallerError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for InstallerError {
    fn from(err: serde_json::Error) -> Self {
        InstallerError::Parse(err.to_string())
    }
}

impl From<zip::result::ZipError> for InstallerError {
    fn from(err: zip::result::ZipError) -> Self {
        InstallerError::FileSystem(err.to_string())
    }
}

impl From<walkdir::Error> for InstallerError {
    fn from(err: walkdir::Error) -> Self {
        InstallerError::FileSystem(err.to_string())
    }
}
