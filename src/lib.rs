//! # Content-addressed object store for operating system trees
//!
//! This crate implements the local half of a git-like repository for
//! filesystem snapshots: immutable objects named by their SHA-256 digest,
//! stored loose on a POSIX filesystem.  Clients write file content,
//! directory metadata and directory listings, seal them with a commit, and
//! later resolve commits back into filesystem views or transfer objects
//! between repositories.
//!
//! The networked pull engine, static delta codec, checkout logic and
//! command-line surface are separate components; this crate owns the on-disk
//! layout, the storage-mode policies, cross-repository import, and the
//! summary index.

// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(missing_docs)]

pub mod checksum;
pub mod config;
pub mod content;
pub mod delta;
pub mod keyfile;
pub mod object;
pub mod objects;
pub mod refs;
pub mod remotes;
pub mod repo;
pub mod sign;
pub mod summary;
pub(crate) mod tmpdir;
pub mod variant;

pub use checksum::Checksum;
pub use content::{FileInfo, LoadedFile};
pub use object::{ObjectName, ObjectType, RepoMode};
pub use repo::Repo;

/// The error type used across this crate.
pub use anyhow::Error;
/// The result type used across this crate.
pub type Result<T> = anyhow::Result<T>;

/// Errors with programmatic meaning; everything else is an [`anyhow::Error`]
/// chain carrying the failing path or remote name.  Callers that need to
/// distinguish these use `err.downcast_ref::<RepoError>()`.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RepoError {
    /// Object, remote, or remote option absent through the whole lookup chain.
    #[error("{0} not found")]
    NotFound(String),
    /// The repository configuration is malformed or from the future.
    #[error("invalid repository configuration: {0}")]
    InvalidConfig(String),
    /// The repository's object directory is not writable; latched at open.
    #[error("repository is not writable: {0}")]
    NotWritable(String),
    /// A validating write or read recomputed a different digest.
    #[error("corrupted object; expected checksum {expected}, got {actual}")]
    ChecksumMismatch {
        /// The checksum the caller advertised.
        expected: String,
        /// The checksum computed from the actual bytes.
        actual: String,
    },
    /// The entity already exists (remote name, signature from a key).
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// A deprecated repository format or operation.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl RepoError {
    pub(crate) fn not_found(what: impl std::fmt::Display) -> anyhow::Error {
        RepoError::NotFound(what.to_string()).into()
    }
}

/// A cooperative cancellation flag.  Long-running operations take an
/// `Option<&Cancellable>` and poll it between filesystem operations; on
/// cancellation they stop with an error, leaving any partial work in the
/// staging area for the next allocator pass to reclaim.
#[derive(Clone, Debug, Default)]
pub struct Cancellable(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl Cancellable {
    /// A new, uncancelled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; visible to every clone.
    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Fail if the (optional) cancellable has fired.
pub(crate) fn check_cancelled(cancellable: Option<&Cancellable>) -> Result<()> {
    match cancellable {
        Some(c) if c.is_cancelled() => Err(anyhow::anyhow!("operation was cancelled")),
        _ => Ok(()),
    }
}

/// Return `Ok(None)` if `res` failed with ENOENT, else pass through.
pub(crate) fn optional<T>(res: std::io::Result<T>) -> std::io::Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
