//! Error taxonomy shared by every stage of an extraction run.

use serde::Serialize;
use std::path::PathBuf;

/// Errors raised while reading, transforming or publishing a workspace subset.
#[derive(Debug, thiserror::Error)]
pub enum CarveError {
    #[error("malformed manifest {}: {reason}", path.display())]
    MalformedManifest { path: PathBuf, reason: String },

    #[error("manifest {} declares no [package].name", path.display())]
    MissingIdentity { path: PathBuf },

    /// Structural inconsistency in the dependency graph (a reference to a
    /// crate that is missing or renamed). Pure cycles are not errors.
    #[error("inconsistent dependency graph at `{crate_name}`: {reason}")]
    CyclicDependency { crate_name: String, reason: String },

    #[error("refusing to touch {}: {reason}", path.display())]
    UnsafeDeletionTarget { path: PathBuf, reason: String },

    #[error("stub target `{name}` not found: {reason}")]
    StubTargetNotFound { name: String, reason: String },

    #[error(
        "dangling dependency `{dependency}` in {}: {} does not exist",
        manifest.display(),
        path.display()
    )]
    DanglingDependencyReference {
        manifest: PathBuf,
        dependency: String,
        path: PathBuf,
    },

    #[error("{operation} timed out after {seconds}s")]
    TransportTimeout { operation: String, seconds: u64 },

    /// The operation timed out and did not stop once asked to, so its outcome
    /// is unknown. Never retried.
    #[error("{operation} timed out after {seconds}s and is still running")]
    TransportStalled { operation: String, seconds: u64 },

    #[error("{operation} rejected credentials: {reason}")]
    TransportAuthFailure { operation: String, reason: String },

    #[error("{operation} failed: {reason}")]
    Transport { operation: String, reason: String },

    #[error("another run holds the lock at {}", path.display())]
    RunLocked { path: PathBuf },

    #[error("run cancelled before {stage}")]
    Cancelled { stage: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure reason reported to the log sink and mapped to an exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    MalformedManifest,
    MissingIdentity,
    CyclicDependency,
    UnsafeDeletionTarget,
    StubTargetNotFound,
    DanglingDependencyReference,
    TransportTimeout,
    TransportStalled,
    TransportAuthFailure,
    Transport,
    RunLocked,
    Cancelled,
    Config,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedManifest => "MalformedManifest",
            Self::MissingIdentity => "MissingIdentity",
            Self::CyclicDependency => "CyclicDependency",
            Self::UnsafeDeletionTarget => "UnsafeDeletionTarget",
            Self::StubTargetNotFound => "StubTargetNotFound",
            Self::DanglingDependencyReference => "DanglingDependencyReference",
            Self::TransportTimeout => "TransportTimeout",
            Self::TransportStalled => "TransportStalled",
            Self::TransportAuthFailure => "TransportAuthFailure",
            Self::Transport => "Transport",
            Self::RunLocked => "RunLocked",
            Self::Cancelled => "Cancelled",
            Self::Config => "Config",
            Self::Io => "Io",
        }
    }

    /// Process exit status for a run that failed with this kind.
    /// Distinct per kind so a scheduler can alert on specific failures.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Config => 2,
            Self::MalformedManifest => 10,
            Self::MissingIdentity => 11,
            Self::CyclicDependency => 12,
            Self::UnsafeDeletionTarget => 13,
            Self::StubTargetNotFound => 14,
            Self::DanglingDependencyReference => 15,
            Self::TransportTimeout => 20,
            Self::TransportAuthFailure => 21,
            Self::Transport => 22,
            Self::TransportStalled => 23,
            Self::RunLocked => 30,
            Self::Cancelled => 31,
            Self::Io => 40,
        }
    }

    /// Soft kinds are recorded and surfaced but never abort a run.
    pub fn is_soft(self) -> bool {
        matches!(self, Self::StubTargetNotFound)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CarveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedManifest { .. } => ErrorKind::MalformedManifest,
            Self::MissingIdentity { .. } => ErrorKind::MissingIdentity,
            Self::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            Self::UnsafeDeletionTarget { .. } => ErrorKind::UnsafeDeletionTarget,
            Self::StubTargetNotFound { .. } => ErrorKind::StubTargetNotFound,
            Self::DanglingDependencyReference { .. } => ErrorKind::DanglingDependencyReference,
            Self::TransportTimeout { .. } => ErrorKind::TransportTimeout,
            Self::TransportStalled { .. } => ErrorKind::TransportStalled,
            Self::TransportAuthFailure { .. } => ErrorKind::TransportAuthFailure,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::RunLocked { .. } => ErrorKind::RunLocked,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Wrap an I/O error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = CarveError> = std::result::Result<T, E>;
