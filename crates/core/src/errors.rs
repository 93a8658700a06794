//! Error types and handling
//!
//! Typed error taxonomy for the whole build pipeline. Every fallible boundary in
//! this crate returns one of these variants rather than an opaque string so
//! callers can match on failure kind (e.g. to decide whether a dependency
//! failure should propagate as `Skipped` rather than `Failed`).

use thiserror::Error;

/// Domain errors for the ports builder
#[derive(Error, Debug)]
pub enum BuildError {
    /// Requested port directory does not exist
    #[error("port not found: {portdir}")]
    PortNotFound { portdir: String },

    /// The Makefile query for a port failed or returned too few lines
    #[error("port corrupt: {portdir}: {reason}")]
    PortCorrupt { portdir: String, reason: String },

    /// The dependency graph contains a cycle
    #[error("dependency cycle detected among: {portdirs:?}")]
    DependencyCycle { portdirs: Vec<String> },

    /// The package-manager bootstrap failed; no regular worker may start
    #[error("bootstrap of package manager port failed: {reason}")]
    BootstrapFailed { reason: String },

    /// Worker environment setup failed (mounts, directories)
    #[error("worker setup failed ({op}): {reason}")]
    SetupFailed { op: String, reason: String },

    /// A single mount operation failed
    #[error("mount error ({op}) at {path} [{fstype}]{}: {reason}", source.as_deref().map(|s| format!(" source={s}")).unwrap_or_default())]
    MountError {
        op: String,
        path: String,
        fstype: String,
        source: Option<String>,
        reason: String,
    },

    /// A command executed inside a worker chroot failed to even run
    #[error("execution failed ({op}) running `{command}`: {reason}")]
    ExecutionFailed {
        op: String,
        command: String,
        reason: String,
    },

    /// A command's timeout elapsed before it completed
    #[error("command timed out")]
    Timeout,

    /// The run was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Cleanup of a worker environment could not fully complete
    #[error("cleanup failed ({op}): {reason}")]
    CleanupFailed { op: String, reason: String },

    /// Persistence store error
    #[error("database error ({op}{}): {reason}", bucket.as_deref().map(|b| format!(" bucket={b}")).unwrap_or_default())]
    DatabaseError {
        op: String,
        bucket: Option<String>,
        reason: String,
    },

    /// Build record error
    #[error("record error ({op}, uuid={uuid}): {reason}")]
    RecordError {
        op: String,
        uuid: String,
        reason: String,
    },

    /// CRC computation or lookup error
    #[error("crc error ({op}, {portdir}): {reason}")]
    CRCError {
        op: String,
        portdir: String,
        reason: String,
    },

    /// Generic field validation error
    #[error("validation error: {field}{}", value.as_deref().map(|v| format!(" (value={v})")).unwrap_or_default())]
    ValidationError {
        field: String,
        value: Option<String>,
    },

    /// Package index error
    #[error("package index error ({op}, {portdir}@{version}): {reason}")]
    PackageIndexError {
        op: String,
        portdir: String,
        version: String,
        reason: String,
    },

    /// Bucket requested by name does not exist in the store
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    /// A build record lookup by UUID found nothing
    #[error("record not found: {0}")]
    RecordNotFound(String),

    /// A build record was written or read with an empty UUID
    #[error("empty uuid")]
    EmptyUUID,

    /// A stored or supplied UUID string did not parse
    #[error("invalid uuid: {0}")]
    InvalidUUID(String),

    /// Deserialization of a stored value failed
    #[error("corrupted data in bucket {0}")]
    CorruptedData(String),

    /// A package index entry pointed at a build record that no longer exists
    #[error("orphaned record: {0}")]
    OrphanedRecord(String),

    /// The store has not been opened yet
    #[error("database not open")]
    DatabaseNotOpen,

    /// The store has already been closed
    #[error("database closed")]
    DatabaseClosed,

    /// Configuration-related errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Configuration file not found
    #[error("configuration file not found: {path}")]
    ConfigurationNotFound { path: String },

    /// I/O passthrough
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    pub fn mount(op: impl Into<String>, path: impl Into<String>, fstype: impl Into<String>, source: Option<String>, reason: impl Into<String>) -> Self {
        BuildError::MountError {
            op: op.into(),
            path: path.into(),
            fstype: fstype.into(),
            source,
            reason: reason.into(),
        }
    }

    pub fn database(op: impl Into<String>, bucket: Option<String>, reason: impl Into<String>) -> Self {
        BuildError::DatabaseError {
            op: op.into(),
            bucket,
            reason: reason.into(),
        }
    }

    /// Whether this error should be treated as a cancellation rather than a
    /// hard failure when bubbling up through the scheduler.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildError::Cancelled)
    }
}

/// Convenience type alias for Results with BuildError
pub type Result<T> = std::result::Result<T, BuildError>;
