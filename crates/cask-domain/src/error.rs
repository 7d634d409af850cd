use thiserror::Error as ThisError;

/// Stable integer codes reported over the RPC boundary.
///
/// The values are part of the external contract; add, never renumber.
pub mod codes {
    pub const SUCCESS: i32 = 0;

    pub const INSTALL_SUCCESS: i32 = 200;
    pub const UNINSTALL_SUCCESS: i32 = 201;
    pub const UPDATE_SUCCESS: i32 = 202;
    pub const QUERY_SUCCESS: i32 = 203;

    pub const INVALID_ARGS: i32 = 500;
    pub const NOT_FOUND: i32 = 501;
    pub const ALREADY_INSTALLED: i32 = 502;
    pub const NOT_INSTALLED: i32 = 503;
    pub const NOT_SUPPORTED: i32 = 504;
    pub const BUSY: i32 = 505;
    pub const LOCK_CONTENDED: i32 = 506;
    pub const IO_ERROR: i32 = 507;
    pub const ARCH_MISMATCH: i32 = 508;
    pub const DEPENDENCY_MISSING: i32 = 509;
    pub const REMOTE_UNAVAILABLE: i32 = 510;
    pub const INTERACTION_DECLINED: i32 = 511;
    pub const CANCELED: i32 = 512;
    pub const VERIFICATION: i32 = 513;
    pub const INSTALL_RUNTIME_FAILED: i32 = 514;
    pub const LOAD_DATA_FAILED: i32 = 515;
    pub const UNINSTALL_FAILED: i32 = 516;
    pub const UPDATE_FAILED: i32 = 517;
    pub const QUERY_FAILED: i32 = 518;
    pub const KILL_FAILED: i32 = 519;
    pub const INTERNAL: i32 = 599;
}

/// Error domain of the package manager surface.
///
/// Synchronous RPC rejections carry one of these; task-internal failures
/// are reported through the task's observable state instead.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} is already installed")]
    AlreadyInstalled(String),
    #[error("{0} is not installed")]
    NotInstalled(String),
    #[error("{0} is not supported")]
    NotSupported(String),
    #[error("another task already operates on {0}")]
    Busy(String),
    #[error("repo lock is held by another process")]
    LockContended,
    #[error("io error: {0}")]
    Io(String),
    #[error("architecture {found} does not match host architecture {host}")]
    ArchMismatch { found: String, host: String },
    #[error("dependency {0} is missing")]
    DependencyMissing(String),
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("interaction declined")]
    InteractionDeclined,
    #[error("canceled")]
    Canceled,
    #[error("verification failed: {0}")]
    Verification(String),
    #[error("failed to install runtime: {0}")]
    InstallRuntime(String),
    #[error("failed to load package data: {0}")]
    LoadData(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgs(_) => codes::INVALID_ARGS,
            Self::NotFound(_) => codes::NOT_FOUND,
            Self::AlreadyInstalled(_) => codes::ALREADY_INSTALLED,
            Self::NotInstalled(_) => codes::NOT_INSTALLED,
            Self::NotSupported(_) => codes::NOT_SUPPORTED,
            Self::Busy(_) => codes::BUSY,
            Self::LockContended => codes::LOCK_CONTENDED,
            Self::Io(_) => codes::IO_ERROR,
            Self::ArchMismatch { .. } => codes::ARCH_MISMATCH,
            Self::DependencyMissing(_) => codes::DEPENDENCY_MISSING,
            Self::RemoteUnavailable(_) => codes::REMOTE_UNAVAILABLE,
            Self::InteractionDeclined => codes::INTERACTION_DECLINED,
            Self::Canceled => codes::CANCELED,
            Self::Verification(_) => codes::VERIFICATION,
            Self::InstallRuntime(_) => codes::INSTALL_RUNTIME_FAILED,
            Self::LoadData(_) => codes::LOAD_DATA_FAILED,
            Self::Internal(_) => codes::INTERNAL,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        use std::collections::HashSet;
        let all = [
            Error::InvalidArgs(String::new()).code(),
            Error::NotFound(String::new()).code(),
            Error::AlreadyInstalled(String::new()).code(),
            Error::NotInstalled(String::new()).code(),
            Error::NotSupported(String::new()).code(),
            Error::Busy(String::new()).code(),
            Error::LockContended.code(),
            Error::Io(String::new()).code(),
            Error::ArchMismatch {
                found: String::new(),
                host: String::new(),
            }
            .code(),
            Error::DependencyMissing(String::new()).code(),
            Error::RemoteUnavailable(String::new()).code(),
            Error::InteractionDeclined.code(),
            Error::Canceled.code(),
            Error::Verification(String::new()).code(),
            Error::InstallRuntime(String::new()).code(),
            Error::LoadData(String::new()).code(),
            Error::Internal(String::new()).code(),
        ];
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len());
    }
}
