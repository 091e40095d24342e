//! Open file handles.
//!
//! A handle binds one file snapshot for its lifetime and fronts it with a
//! [`BufferCache`]. Reads fetch only the spans the cache lacks; writes stay
//! in memory until [`FileHandle::sync`] flushes each dirty region as its own
//! transaction unit.

use bitflags::bitflags;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};

use crate::FSResult;
use crate::cache::BufferCache;
use crate::crypto::SymmetricKey;
use crate::error::FsError;
use crate::pool::Pool;
use crate::schema::{AccessLevel, NodeId, SnapshotId};
use crate::session::Ctx;
use crate::snapshots;
use crate::tree;

bitflags! {
    /// What a handle may do.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        /// No other handle may be open on the same snapshot.
        const EXCLUSIVE = 0b100;
    }
}

bitflags! {
    /// How a handle opens its snapshot. Every mode needs [`Access::WRITE`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Mode: u8 {
        const TRUNCATE_TO_ZERO = 0b001;
        /// Every write lands at the current end of the file.
        const APPEND = 0b010;
        /// Fork a new snapshot off the opened one and write to that.
        const NEW_SNAPSHOT = 0b100;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleStatus {
    Opened,
    Reading,
    Writing,
    Seeking,
    Closed,
}

#[derive(Debug)]
struct HandleState {
    cache: BufferCache,
    position: u64,
    /// Snapshot size as last written to the store.
    backend_size: u64,
    status: HandleStatus,
}

/// An open file snapshot.
///
/// Operations on one handle run one at a time in call order; different
/// handles proceed independently.
pub struct FileHandle {
    pool: Pool,
    ctx: Ctx,
    file: NodeId,
    snapshot: SnapshotId,
    access: Access,
    mode: Mode,
    key: SymmetricKey,
    registered: AtomicBool,
    state: Mutex<HandleState>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("file", &self.file)
            .field("snapshot", &self.snapshot)
            .field("access", &self.access)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Opens `file` at `snapshot` (its newest snapshot when `None`).
pub(crate) async fn open(
    pool: &Pool,
    ctx: &Ctx,
    file: NodeId,
    snapshot: Option<SnapshotId>,
    access: Access,
    mode: Mode,
) -> FSResult<FileHandle> {
    if !access.intersects(Access::READ | Access::WRITE) {
        return Err(FsError::AccessViolation("a handle needs READ or WRITE access"));
    }
    if !mode.is_empty() && !access.contains(Access::WRITE) {
        return Err(FsError::AccessViolation("open modes need WRITE access"));
    }
    let level = if access.contains(Access::WRITE) {
        AccessLevel::Write
    } else {
        AccessLevel::Read
    };
    let exclusive = access.contains(Access::EXCLUSIVE);
    let chunk_size = pool.config().chunk_size();
    let session = ctx.session().clone();
    let registry = pool.clone();

    let (target, key) = pool
        .run(ctx, move |txn| async move {
            let resolved = snapshots::resolve_file(&txn, &session, file, level).await?;
            let author = session.principal_id();
            let base = match snapshot {
                Some(id) => snapshots::load(&txn, file, id).await?,
                None => match snapshots::latest(&txn, file).await? {
                    Some(latest) => latest,
                    None => snapshots::create(&txn, &resolved.node, author, None).await?,
                },
            };
            let mut target = if mode.contains(Mode::NEW_SNAPSHOT) {
                snapshots::create(&txn, &resolved.node, author, Some(base.id)).await?
            } else {
                if level == AccessLevel::Write
                    && snapshots::latest(&txn, file)
                        .await?
                        .is_some_and(|latest| latest.id != base.id)
                {
                    return Err(FsError::SnapshotSealed(base.id));
                }
                base
            };

            registry.register_handle(target.id, exclusive)?;
            let release = registry.clone();
            let registered = target.id;
            txn.on_failure(move || release.release_handle(registered));

            let key = resolved.symmetric()?.clone();
            if mode.contains(Mode::TRUNCATE_TO_ZERO) && target.size > 0 {
                snapshots::resize(&txn, file, &key, target.id, 0, chunk_size).await?;
                target.size = 0;
            }
            tree::touch_access(&txn, file).await?;
            Ok((target, key))
        })
        .await?;

    let position = if mode.contains(Mode::APPEND) {
        target.size
    } else {
        0
    };
    tracing::debug!(
        file = %file,
        snapshot = %target.id,
        size = target.size,
        ?access,
        ?mode,
        "file handle opened"
    );
    Ok(FileHandle {
        pool: pool.clone(),
        ctx: ctx.clone(),
        file,
        snapshot: target.id,
        access,
        mode,
        key,
        registered: AtomicBool::new(true),
        state: Mutex::new(HandleState {
            cache: BufferCache::new(target.size),
            position,
            backend_size: target.size,
            status: HandleStatus::Opened,
        }),
    })
}

impl FileHandle {
    pub fn file_id(&self) -> NodeId {
        self.file
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    async fn lock_open(&self) -> FSResult<MutexGuard<'_, HandleState>> {
        let state = self.state.lock().await;
        if state.status == HandleStatus::Closed {
            return Err(FsError::HandleClosed);
        }
        Ok(state)
    }

    fn require(&self, access: Access, what: &'static str) -> FSResult<()> {
        if self.access.contains(access) {
            Ok(())
        } else {
            Err(FsError::AccessViolation(what))
        }
    }

    pub async fn status(&self) -> HandleStatus {
        self.state.lock().await.status
    }

    pub async fn size(&self) -> FSResult<u64> {
        Ok(self.lock_open().await?.cache.size())
    }

    pub async fn position(&self) -> FSResult<u64> {
        Ok(self.lock_open().await?.position)
    }

    /// Bytes currently held in memory by this handle.
    pub async fn buffered_len(&self) -> FSResult<u64> {
        Ok(self.lock_open().await?.cache.buffered_len())
    }

    /// Fetches every part of `[begin, end)` the cache lacks, one backend
    /// read per missing span. Bytes past the valid backend length stay
    /// `Empty` and read as zeros.
    async fn materialize(&self, state: &mut HandleState, begin: u64, end: u64) -> FSResult<()> {
        let valid = state.cache.valid_len();
        let chunk_size = self.pool.config().chunk_size();
        for span in state.cache.missing_spans(begin, end) {
            let span = span.start..span.end.min(valid);
            if span.is_empty() {
                continue;
            }
            let (file, snapshot, key) = (self.file, self.snapshot, self.key.clone());
            let fetch = span.clone();
            let data = self
                .pool
                .run(&self.ctx, move |txn| async move {
                    snapshots::read_range(&txn, file, &key, snapshot, fetch, chunk_size).await
                })
                .await?;
            tracing::debug!(
                snapshot = %self.snapshot,
                begin = span.start,
                end = span.end,
                "materialized cache span"
            );
            state.cache.fill(span.start, data);
        }
        Ok(())
    }

    async fn read_locked(
        &self,
        state: &mut HandleState,
        begin: u64,
        len: u64,
    ) -> FSResult<Vec<u8>> {
        let end = begin.saturating_add(len).min(state.cache.size());
        if begin >= end {
            return Ok(Vec::new());
        }
        state.status = HandleStatus::Reading;
        let fetched = self.materialize(state, begin, end).await;
        state.status = HandleStatus::Opened;
        fetched?;
        Ok(state.cache.copy_out(begin, end))
    }

    /// Reads up to `len` bytes at the current position and advances it.
    /// Returns fewer bytes at the end of the file.
    pub async fn read(&self, len: u64) -> FSResult<Vec<u8>> {
        self.require(Access::READ, "handle was not opened for reading")?;
        let mut state = self.lock_open().await?;
        let begin = state.position;
        let data = self.read_locked(&mut state, begin, len).await?;
        state.position = begin + data.len() as u64;
        Ok(data)
    }

    /// Reads at `offset` without moving the position.
    pub async fn read_at(&self, offset: u64, len: u64) -> FSResult<Vec<u8>> {
        self.require(Access::READ, "handle was not opened for reading")?;
        let mut state = self.lock_open().await?;
        self.read_locked(&mut state, offset, len).await
    }

    fn write_locked(&self, state: &mut HandleState, offset: u64, data: &[u8]) -> u64 {
        let offset = if self.mode.contains(Mode::APPEND) {
            state.cache.size()
        } else {
            offset
        };
        state.status = HandleStatus::Writing;
        state.cache.write(offset, data);
        state.status = HandleStatus::Opened;
        offset + data.len() as u64
    }

    /// Writes `data` at the current position and advances it. Nothing
    /// reaches the store before [`FileHandle::sync`].
    pub async fn write(&self, data: &[u8]) -> FSResult<()> {
        self.require(Access::WRITE, "handle was not opened for writing")?;
        let mut state = self.lock_open().await?;
        let position = state.position;
        let end = self.write_locked(&mut state, position, data);
        state.position = end;
        Ok(())
    }

    /// Writes at `offset` without moving the position.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> FSResult<()> {
        self.require(Access::WRITE, "handle was not opened for writing")?;
        let mut state = self.lock_open().await?;
        self.write_locked(&mut state, offset, data);
        Ok(())
    }

    pub async fn seek(&self, position: u64) -> FSResult<()> {
        let mut state = self.lock_open().await?;
        state.status = HandleStatus::Seeking;
        let size = state.cache.size();
        let outcome = if position > size {
            Err(FsError::InvalidSeek { position, size })
        } else {
            state.position = position;
            Ok(())
        };
        state.status = HandleStatus::Opened;
        outcome
    }

    /// Truncates or extends the file in memory.
    pub async fn set_size(&self, size: u64) -> FSResult<()> {
        self.require(Access::WRITE, "handle was not opened for writing")?;
        let mut state = self.lock_open().await?;
        state.status = HandleStatus::Writing;
        state.cache.set_size(size);
        state.position = state.position.min(size);
        state.status = HandleStatus::Opened;
        Ok(())
    }

    async fn sync_locked(&self, state: &mut HandleState) -> FSResult<()> {
        let chunk_size = self.pool.config().chunk_size();
        let (file, snapshot) = (self.file, self.snapshot);

        let size = state.cache.size();
        let valid = state.cache.valid_len();
        if size != state.backend_size || valid < state.backend_size {
            let key = self.key.clone();
            let backend_size = state.backend_size;
            self.pool
                .run(&self.ctx, move |txn| async move {
                    // Cut stale bytes first so a regrown tail reads as zeros.
                    if valid < backend_size {
                        snapshots::resize(&txn, file, &key, snapshot, valid, chunk_size).await?;
                    }
                    snapshots::resize(&txn, file, &key, snapshot, size, chunk_size).await
                })
                .await?;
            state.backend_size = size;
            state.cache.set_valid_len(size);
        }

        let dirty = state.cache.dirty_regions();
        if dirty.is_empty() {
            state.cache.release_clean();
            return Ok(());
        }
        let flushes = dirty.into_iter().map(|(range, data)| {
            let key = self.key.clone();
            let start = range.start;
            async move {
                let outcome = self
                    .pool
                    .run(&self.ctx, move |txn| async move {
                        snapshots::write_range(&txn, file, &key, snapshot, start, &data, chunk_size)
                            .await
                    })
                    .await;
                (range, outcome)
            }
        });

        let mut failed: Option<FsError> = None;
        for (range, outcome) in join_all(flushes).await {
            match outcome {
                Ok(()) => {
                    state.cache.mark_clean(&range);
                }
                Err(err) => {
                    tracing::warn!(
                        snapshot = %snapshot,
                        begin = range.start,
                        end = range.end,
                        "flushing region failed: {err}"
                    );
                    failed.get_or_insert(err);
                }
            }
        }
        // Flushed bytes live in the store now; only failed regions stay.
        state.cache.release_clean();
        match failed {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Writes the size and every dirty region to the store. Regions are
    /// flushed independently; on failure only the failed ones stay dirty.
    pub async fn sync(&self) -> FSResult<()> {
        let mut state = self.lock_open().await?;
        self.sync_locked(&mut state).await
    }

    /// Syncs and closes the handle. If any region is still dirty afterwards
    /// the handle stays open and the error says how much is at stake.
    pub async fn close(&self) -> FSResult<()> {
        let mut state = self.state.lock().await;
        if state.status == HandleStatus::Closed {
            return Ok(());
        }
        if let Err(err) = self.sync_locked(&mut state).await {
            let count = state.cache.dirty_count();
            if count == 0 {
                return Err(err);
            }
            return Err(FsError::DirtyRegions {
                count,
                first: err.to_string(),
            });
        }
        state.cache = BufferCache::default();
        state.status = HandleStatus::Closed;
        if self.registered.swap(false, Ordering::AcqRel) {
            self.pool.release_handle(self.snapshot);
        }
        tracing::debug!(file = %self.file, snapshot = %self.snapshot, "file handle closed");
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock()
            && state.cache.dirty_count() > 0
        {
            tracing::error!(
                file = %self.file,
                snapshot = %self.snapshot,
                regions = state.cache.dirty_count(),
                "file handle dropped with unsynced data"
            );
        }
        if self.registered.swap(false, Ordering::AcqRel) {
            self.pool.release_handle(self.snapshot);
        }
    }
}
