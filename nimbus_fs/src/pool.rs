//! The pool: one row store, one transaction queue, and the principals and
//! trees living in it.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use moka::sync::Cache;
use nimbus_core::{Filter, Query, RowStore, fields};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::FSResult;
use crate::api::{Entry, FolderHandle};
use crate::config::PoolConfig;
use crate::crypto::KeyPair;
use crate::error::FsError;
use crate::schema::{
    Node, NodeId, NodeRole, PRINCIPALS, PoolLayoutRow, Principal, PrincipalId, SchemaVersionRow,
    SnapshotId,
};
use crate::session::{Ctx, Session};
use crate::snapshots::SnapshotChain;
use crate::trash::{self, TrashModule};
use crate::tree::{self, NodeTree};
use crate::txqueue::{TransactionQueue, Txn};
use crate::vault::{self, KeyVault};

/// Newest schema this build reads and writes.
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Name of every principal's trash folder.
pub const TRASH_FOLDER_NAME: &str = ".trash";

/// Node rows recently read from the store, keyed by id. Entries expire
/// after the configured TTL; mutations evict through success hooks.
#[derive(Clone)]
pub struct NodeArena {
    nodes: Cache<NodeId, Node>,
}

impl std::fmt::Debug for NodeArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeArena")
            .field("entries", &self.nodes.entry_count())
            .finish()
    }
}

impl NodeArena {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            nodes: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.nodes.get(&id)
    }

    pub fn insert(&self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    pub fn invalidate(&self, id: NodeId) {
        self.nodes.invalidate(&id);
    }
}

#[derive(Debug, Default)]
struct OpenState {
    handles: usize,
    exclusive: bool,
}

#[derive(Debug)]
struct PoolInner {
    queue: TransactionQueue,
    config: PoolConfig,
    arena: NodeArena,
    open: DashMap<SnapshotId, OpenState>,
}

/// Brings the schema up to date and returns the pool's chunk size,
/// recording `chunk_size` if the pool has none yet.
async fn migrate(queue: &TransactionQueue, chunk_size: u32) -> FSResult<u32> {
    queue
        .run(&CancellationToken::new(), move |txn| async move {
            let applied: Option<SchemaVersionRow> = txn
                .select(Query::all().order_by_desc("version").limit(1))
                .await?
                .pop();
            let found = applied.map_or(0, |row| row.version);
            if found > CURRENT_SCHEMA_VERSION {
                return Err(FsError::UnsupportedSchema {
                    found,
                    supported: CURRENT_SCHEMA_VERSION,
                });
            }
            // Tables are created on first insert; every version so far
            // is additive, so upgrading only records the new version.
            for version in found + 1..=CURRENT_SCHEMA_VERSION {
                txn.insert(&SchemaVersionRow {
                    version,
                    applied_time: Utc::now(),
                })
                .await?;
                tracing::info!(version, "schema version applied");
            }

            match txn.first::<PoolLayoutRow>(Filter::All).await? {
                Some(layout) => Ok(layout.chunk_size),
                None => {
                    txn.insert(&PoolLayoutRow { chunk_size }).await?;
                    Ok(chunk_size)
                }
            }
        })
        .await
}

/// An encrypted drive over one [`RowStore`].
///
/// Cheap to clone; clones share the queue, the node arena and the registry
/// of open handles.
///
/// ```rust,no_run
/// use nimbus_fs::{Ctx, Pool, PoolConfig};
/// use nimbus_store_memory::MemoryRowStore;
/// use std::sync::Arc;
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let pool = Pool::open(Arc::new(MemoryRowStore::new()), PoolConfig::default()).await?;
/// pool.register_principal("alice", b"correct horse").await?;
/// let ctx = Ctx::new(pool.unlock("alice", b"correct horse").await?);
/// let root = pool.get_root(&ctx).await?;
/// root.create_folder("docs").await?;
/// # Ok(()) }
/// ```
#[derive(Clone, Debug)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Opens a pool over `store`, creating or upgrading its schema.
    ///
    /// The chunk size is fixed when the pool is created; a different
    /// `config.chunk_size` on a later open is ignored with a warning.
    pub async fn open(store: Arc<dyn RowStore>, mut config: PoolConfig) -> FSResult<Self> {
        let queue = TransactionQueue::spawn(store, config.queue_capacity);
        let stored = migrate(&queue, config.chunk_size.max(1)).await?;
        if stored != config.chunk_size {
            tracing::warn!(
                configured = config.chunk_size,
                stored,
                "pool keeps the chunk size it was created with"
            );
            config.chunk_size = stored;
        }
        let arena = NodeArena::new(
            config.node_cache_capacity,
            Duration::from_secs(config.node_cache_ttl_secs),
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                queue,
                config,
                arena,
                open: DashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn arena(&self) -> &NodeArena {
        &self.inner.arena
    }

    pub fn queue(&self) -> &TransactionQueue {
        &self.inner.queue
    }

    /// Runs `func` as one unit on the pool's queue, cancelled by `ctx`.
    pub(crate) async fn run<F, Fut, T>(&self, ctx: &Ctx, func: F) -> FSResult<T>
    where
        F: FnOnce(Txn) -> Fut + Send + 'static,
        Fut: Future<Output = FSResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if ctx.session().is_ended() {
            return Err(FsError::AccessDenied("session has ended".into()));
        }
        self.inner.queue.run(ctx.cancel_token(), func).await
    }

    pub fn vault(&self) -> KeyVault<'_> {
        KeyVault::new(self)
    }

    pub fn tree(&self) -> NodeTree<'_> {
        NodeTree::new(self)
    }

    pub fn snapshots(&self) -> SnapshotChain<'_> {
        SnapshotChain::new(self)
    }

    pub fn trash(&self) -> TrashModule<'_> {
        TrashModule::new(self)
    }

    /// Creates a principal with its root key, root folder and trash folder.
    ///
    /// `secret` is the unlock secret; only the public half of the key pair
    /// derived from it is stored.
    pub async fn register_principal(&self, name: &str, secret: &[u8]) -> FSResult<Principal> {
        tree::validate_name(name)?;
        let unlock_public_key = KeyPair::derive_principal(secret).public.to_bytes();
        let name = name.to_owned();
        let principal = self
            .inner
            .queue
            .run(&CancellationToken::new(), move |txn| async move {
                if txn
                    .first::<Principal>(Filter::eq("name", name.as_str()))
                    .await?
                    .is_some()
                {
                    return Err(FsError::NameConflict(name));
                }
                let mut principal = Principal {
                    id: PrincipalId(0),
                    name,
                    unlock_public_key,
                    root_key_id: None,
                };
                principal.id = PrincipalId(txn.insert(&principal).await?);

                let root_key = vault::create_root_key(&txn, &principal).await?;
                txn.update(
                    PRINCIPALS,
                    principal.id.0,
                    fields! { "root_key_id" => root_key.id },
                )
                .await?;
                principal.root_key_id = Some(root_key.id);

                tree::create_top_folder(
                    &txn,
                    principal.id,
                    &root_key,
                    NodeRole::Root,
                    &principal.name,
                )
                .await?;
                tree::create_top_folder(
                    &txn,
                    principal.id,
                    &root_key,
                    NodeRole::TrashRoot,
                    TRASH_FOLDER_NAME,
                )
                .await?;
                Ok(principal)
            })
            .await?;
        tracing::info!(principal = %principal.name, id = %principal.id, "principal registered");
        Ok(principal)
    }

    /// Unlocks `name` with its secret and returns a fresh session.
    pub async fn unlock(&self, name: &str, secret: &[u8]) -> FSResult<Arc<Session>> {
        let pair = KeyPair::derive_principal(secret);
        let public = pair.public.to_bytes();
        let lookup = name.to_owned();
        let principal = self
            .inner
            .queue
            .run(&CancellationToken::new(), move |txn| async move {
                txn.first::<Principal>(Filter::eq("name", lookup.as_str()))
                    .await
            })
            .await?
            .filter(|p| p.unlock_public_key == public)
            .ok_or_else(|| FsError::AccessDenied(format!("cannot unlock principal '{name}'")))?;

        let session = Session::new(principal, pair);
        let check = session.clone();
        self.inner
            .queue
            .run(&CancellationToken::new(), move |txn| async move {
                vault::unlock_principal_root(&txn, &check).await.map(|_| ())
            })
            .await?;
        tracing::debug!(principal = %name, "session unlocked");
        Ok(session)
    }

    /// The root folder of the context's principal.
    pub async fn get_root(&self, ctx: &Ctx) -> FSResult<FolderHandle> {
        let session = ctx.session().clone();
        let root = self
            .run(ctx, move |txn| async move {
                let root = trash::top_folder(&txn, session.principal_id(), NodeRole::Root).await?;
                Ok(vault::resolve_chain(&txn, &session, root.id).await?.node)
            })
            .await?;
        self.inner.arena.insert(root.clone());
        Ok(FolderHandle::new(self.clone(), ctx.clone(), root))
    }

    /// Any node the context's principal can reach, owned or shared.
    pub async fn entry(&self, ctx: &Ctx, node: NodeId) -> FSResult<Entry> {
        let node = self.tree().stat(ctx, node).await?;
        Ok(Entry::from_node(self, ctx, node))
    }

    /// Records an open handle on `snapshot`. An exclusive handle excludes
    /// every other handle on the same snapshot.
    pub(crate) fn register_handle(&self, snapshot: SnapshotId, exclusive: bool) -> FSResult<()> {
        match self.inner.open.entry(snapshot) {
            MapEntry::Occupied(mut entry) => {
                let state = entry.get_mut();
                if state.handles > 0 && (exclusive || state.exclusive) {
                    return Err(FsError::SharingViolation(snapshot));
                }
                state.handles += 1;
                state.exclusive = exclusive;
            }
            MapEntry::Vacant(entry) => {
                entry.insert(OpenState {
                    handles: 1,
                    exclusive,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn release_handle(&self, snapshot: SnapshotId) {
        if let MapEntry::Occupied(mut entry) = self.inner.open.entry(snapshot) {
            let state = entry.get_mut();
            state.handles = state.handles.saturating_sub(1);
            if state.handles == 0 {
                entry.remove();
            }
        }
    }

    pub fn is_snapshot_open(&self, snapshot: SnapshotId) -> bool {
        self.inner.open.contains_key(&snapshot)
    }

    /// Stops the transaction queue after the units already queued.
    pub async fn shutdown(&self) -> FSResult<()> {
        self.inner.queue.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_store_memory::MemoryRowStore;

    async fn pool() -> Pool {
        Pool::open(Arc::new(MemoryRowStore::new()), PoolConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn exclusive_handles_exclude_everything_else() {
        let pool = pool().await;
        let snap = SnapshotId(7);
        pool.register_handle(snap, false).unwrap();
        pool.register_handle(snap, false).unwrap();
        assert!(matches!(
            pool.register_handle(snap, true),
            Err(FsError::SharingViolation(_))
        ));
        pool.release_handle(snap);
        pool.release_handle(snap);
        assert!(!pool.is_snapshot_open(snap));

        pool.register_handle(snap, true).unwrap();
        assert!(pool.register_handle(snap, false).is_err());
        pool.release_handle(snap);
        pool.register_handle(snap, false).unwrap();
    }

    #[tokio::test]
    async fn reopening_keeps_a_single_schema_row() {
        let store: Arc<dyn RowStore> = Arc::new(MemoryRowStore::new());
        Pool::open(store.clone(), PoolConfig::default()).await.unwrap();
        let pool = Pool::open(store, PoolConfig::default()).await.unwrap();
        let rows: Vec<SchemaVersionRow> = pool
            .queue()
            .run(&CancellationToken::new(), |txn| async move {
                txn.select(Query::all()).await
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version, CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn newer_schema_is_refused() {
        let store: Arc<dyn RowStore> = Arc::new(MemoryRowStore::new());
        let pool = Pool::open(store.clone(), PoolConfig::default()).await.unwrap();
        pool.queue()
            .run(&CancellationToken::new(), |txn| async move {
                txn.insert(&SchemaVersionRow {
                    version: CURRENT_SCHEMA_VERSION + 1,
                    applied_time: Utc::now(),
                })
                .await
            })
            .await
            .unwrap();
        let err = Pool::open(store, PoolConfig::default()).await.unwrap_err();
        assert!(matches!(err, FsError::UnsupportedSchema { .. }));
    }

    #[tokio::test]
    async fn principals_unlock_only_with_their_secret() {
        let pool = pool().await;
        pool.register_principal("alice", b"s3cret").await.unwrap();
        assert!(matches!(
            pool.register_principal("alice", b"other").await,
            Err(FsError::NameConflict(_))
        ));
        assert!(matches!(
            pool.unlock("alice", b"wrong").await,
            Err(FsError::AccessDenied(_))
        ));
        assert!(matches!(
            pool.unlock("bob", b"s3cret").await,
            Err(FsError::AccessDenied(_))
        ));
        let session = pool.unlock("alice", b"s3cret").await.unwrap();
        assert_eq!(session.principal().name, "alice");
        assert!(session.cached_key_count() >= 1);
    }
}
