//! Error taxonomy of the storage engine.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::schema::{NodeId, SnapshotId};
use nimbus_core::StoreError;

/// Errors surfaced by pool, tree, vault, snapshot and handle operations.
///
/// Variants marked `[INTEGRITY VIOLATION]` mean key material failed to
/// authenticate: either a bug or tampering with the backing store. They are
/// never retried or mapped to another variant.
#[derive(Debug, Error)]
pub enum FsError {
    /// No wrapping chain from the session's principal reaches the node, or
    /// the chain grants a lower level than the operation needs.
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("name conflict: '{0}' already exists in this folder")]
    NameConflict(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("no such file or folder: {0}")]
    NoSuchFileOrFolder(String),

    #[error("not a folder: {0}")]
    NotAFolder(String),

    #[error("is a folder: {0}")]
    IsAFolder(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("invalid parent: {0}")]
    InvalidParent(String),

    #[error("snapshot {0} does not exist for this file")]
    NoSuchSnapshot(SnapshotId),

    /// The file already has history; the caller must name the snapshot the
    /// new one continues.
    #[error("file {0} already has snapshots; a base snapshot is required")]
    BaseSnapshotRequired(NodeId),

    /// The handle was not opened with the access flag the operation needs.
    #[error("access violation: handle was not opened for {0}")]
    AccessViolation(&'static str),

    #[error("sharing violation: snapshot {0} is open exclusively")]
    SharingViolation(SnapshotId),

    /// Only the newest snapshot of a file may be written in place; older
    /// ones are forked with `Mode::NEW_SNAPSHOT`.
    #[error("snapshot {0} has newer snapshots and cannot be written in place")]
    SnapshotSealed(SnapshotId),

    #[error("seek to {position} is outside [0, {size}]")]
    InvalidSeek { position: u64, size: u64 },

    #[error("file handle is closed")]
    HandleClosed,

    /// Sync left regions dirty; they stay cached for a retry.
    #[error("{count} dirty region(s) could not be flushed: {first}")]
    DirtyRegions { count: usize, first: String },

    /// **[INTEGRITY VIOLATION]** A wrap or unwrap failed to authenticate.
    #[error("[INTEGRITY VIOLATION] key derivation failed: {0}")]
    KeyDerivation(#[from] CryptoError),

    /// **[INTEGRITY VIOLATION]** A key claims a wrapping parent other than
    /// the one offered to unwrap it.
    #[error("[INTEGRITY VIOLATION] key {key} is not wrapped by key {offered}")]
    WrongWrappingKey { key: u64, offered: u64 },

    #[error("nested transaction on the same pool")]
    NestedTransaction,

    #[error("operation cancelled")]
    Cancelled,

    #[error("transaction queue is closed")]
    QueueClosed,

    /// The unit body panicked; its changes were rolled back.
    #[error("transaction unit panicked and was rolled back")]
    UnitPanicked,

    #[error("pool schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FsError {
    /// True for errors that indicate tampered or corrupted key material.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            FsError::KeyDerivation(_) | FsError::WrongWrappingKey { .. }
        )
    }
}
