//! # Nimbus drive engine
//!
//! An encrypted, versioned file tree stored in any [`nimbus_core::RowStore`].
//!
//! Every node has its own key, stored wrapped under its parent folder's key;
//! a principal's root and trash folders are wrapped under the principal's
//! root key, which is sealed to the principal's unlock secret. Files keep a
//! history of snapshots whose content is split into encrypted,
//! reference-counted chunks.
//!
//! ## Layers
//! 1. `txqueue`: one consumer task per pool runs every store access as a
//!    transactional unit, one at a time.
//! 2. `vault`, `tree`, `snapshots`, `trash`: the operations, each a plain
//!    function over a granted [`Txn`] plus a small façade bound to a [`Ctx`].
//! 3. `handle` + `cache`: open files and their sparse in-memory buffers.
//! 4. `pool` + `api`: what applications use: [`Pool`], [`FolderHandle`],
//!    [`FileEntry`], [`FileHandle`].

pub mod api;
pub mod cache;
pub mod config;
pub mod crypto;
mod error;
pub mod handle;
pub mod pool;
pub mod schema;
pub mod session;
pub mod snapshots;
pub mod trash;
pub mod tree;
pub mod txqueue;
pub mod vault;

pub use api::{Entry, FileEntry, FolderHandle};
pub use config::{NameCollation, PoolConfig};
pub use error::FsError;
pub use handle::{Access, FileHandle, HandleStatus, Mode};
pub use pool::{NodeArena, Pool};
pub use schema::{
    AccessLevel, FileSnapshot, Grant, Node, NodeId, NodeKind, NodeRole, Principal, PrincipalId,
    SnapshotId,
};
pub use session::{Ctx, Session};
pub use txqueue::{TransactionQueue, Txn};
pub use vault::{Anchor, ResolvedKey};

/// Crate-wide result alias.
pub type FSResult<T> = Result<T, FsError>;
