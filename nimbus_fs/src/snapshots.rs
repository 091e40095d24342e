//! File snapshots and their chunked, encrypted content.
//!
//! A snapshot owns an index of [`Chunk`] rows; each points at a
//! [`FileBuffer`] holding the encrypted bytes. Forking a snapshot copies the
//! index and bumps buffer reference counts, so no payload is copied until
//! one side writes (copy-on-write at chunk granularity).

use chrono::Utc;
use nimbus_core::{Filter, Query, fields};

use crate::FSResult;
use crate::crypto::{self, SymmetricKey};
use crate::error::FsError;
use crate::pool::Pool;
use crate::schema::{
    AccessLevel, BufferId, CHUNKS, Chunk, ChunkId, FILE_BUFFERS, FILE_SNAPSHOTS, FileBuffer,
    FileSnapshot, Node, NodeId, NodeKind, PrincipalId, SnapshotId,
};
use crate::session::{Ctx, Session};
use crate::txqueue::Txn;
use crate::vault::{self, ResolvedKey};

fn chunk_aad(file: NodeId, index: u64) -> Vec<u8> {
    format!("nimbus/chunk/{file}/{index}").into_bytes()
}

/// Resolves `file` and checks it is a file the session may use at `level`.
pub(crate) async fn resolve_file(
    txn: &Txn,
    session: &Session,
    file: NodeId,
    level: AccessLevel,
) -> FSResult<ResolvedKey> {
    let resolved = vault::resolve_chain(txn, session, file).await?;
    match resolved.node.kind {
        NodeKind::File => {}
        NodeKind::Folder => return Err(FsError::IsAFolder(resolved.node.name.clone())),
        NodeKind::SymbolicLink => return Err(FsError::NotAFile(resolved.node.name.clone())),
    }
    resolved.require(level)?;
    Ok(resolved)
}

pub(crate) async fn list(txn: &Txn, file: NodeId) -> FSResult<Vec<FileSnapshot>> {
    txn.select(Query::new(Filter::eq("file_node_id", file)).order_by_desc("id"))
        .await
}

pub(crate) async fn latest(txn: &Txn, file: NodeId) -> FSResult<Option<FileSnapshot>> {
    Ok(txn
        .select(
            Query::new(Filter::eq("file_node_id", file))
                .order_by_desc("id")
                .limit(1),
        )
        .await?
        .pop())
}

/// Loads `id`, checking it belongs to `file`.
pub(crate) async fn load(txn: &Txn, file: NodeId, id: SnapshotId) -> FSResult<FileSnapshot> {
    match txn.get::<FileSnapshot>(id.0).await? {
        Some(snapshot) if snapshot.file_node_id == file => Ok(snapshot),
        _ => Err(FsError::NoSuchSnapshot(id)),
    }
}

/// Creates a snapshot of `file`, continuing `base` when given.
pub(crate) async fn create(
    txn: &Txn,
    file: &Node,
    author: PrincipalId,
    base: Option<SnapshotId>,
) -> FSResult<FileSnapshot> {
    let base = match base {
        Some(id) => Some(load(txn, file.id, id).await?),
        None => {
            if latest(txn, file.id).await?.is_some() {
                return Err(FsError::BaseSnapshotRequired(file.id));
            }
            None
        }
    };

    let mut snapshot = FileSnapshot {
        id: SnapshotId(0),
        file_node_id: file.id,
        base_snapshot_id: base.as_ref().map(|b| b.id),
        size: base.as_ref().map_or(0, |b| b.size),
        create_time: Utc::now(),
        author_id: author,
    };
    snapshot.id = SnapshotId(txn.insert(&snapshot).await?);

    if let Some(base) = base {
        let chunks: Vec<Chunk> = txn
            .select(Query::new(Filter::eq("snapshot_id", base.id)))
            .await?;
        for chunk in &chunks {
            let copy = Chunk {
                snapshot_id: snapshot.id,
                ..chunk.clone()
            };
            txn.insert(&copy).await?;
            adjust_ref_count(txn, chunk.buffer_id, 1).await?;
        }
        tracing::debug!(
            file = %file.id,
            base = %base.id,
            snapshot = %snapshot.id,
            chunks = chunks.len(),
            "forked snapshot"
        );
    }
    Ok(snapshot)
}

/// Deletes `snapshot`, reclaiming buffers no other snapshot references.
/// Snapshots based on it are re-pointed at its own base.
pub(crate) async fn delete(txn: &Txn, snapshot: &FileSnapshot) -> FSResult<()> {
    let chunks: Vec<Chunk> = txn
        .select(Query::new(Filter::eq("snapshot_id", snapshot.id)))
        .await?;
    for chunk in &chunks {
        release_buffer(txn, chunk.buffer_id).await?;
    }
    txn.delete(CHUNKS, Filter::eq("snapshot_id", snapshot.id))
        .await?;

    let children: Vec<FileSnapshot> = txn
        .select(Query::new(Filter::eq("base_snapshot_id", snapshot.id)))
        .await?;
    for child in children {
        txn.update(
            FILE_SNAPSHOTS,
            child.id.0,
            fields! { "base_snapshot_id" => snapshot.base_snapshot_id },
        )
        .await?;
    }
    txn.delete(FILE_SNAPSHOTS, Filter::Id(snapshot.id.0)).await?;
    Ok(())
}

/// Deletes every snapshot of `file`.
pub(crate) async fn delete_all(txn: &Txn, file: NodeId) -> FSResult<()> {
    for snapshot in list(txn, file).await? {
        delete(txn, &snapshot).await?;
    }
    Ok(())
}

async fn load_buffer(txn: &Txn, id: BufferId) -> FSResult<FileBuffer> {
    txn.get::<FileBuffer>(id.0)
        .await?
        .ok_or_else(|| FsError::Corrupt(format!("buffer {id} is missing")))
}

async fn adjust_ref_count(txn: &Txn, id: BufferId, delta: i64) -> FSResult<u64> {
    let buffer = load_buffer(txn, id).await?;
    let count = buffer.ref_count.saturating_add_signed(delta);
    txn.update(FILE_BUFFERS, id.0, fields! { "ref_count" => count })
        .await?;
    Ok(count)
}

/// Drops one reference to a buffer, deleting it when none remain.
async fn release_buffer(txn: &Txn, id: BufferId) -> FSResult<()> {
    let buffer = load_buffer(txn, id).await?;
    if buffer.ref_count <= 1 {
        txn.delete(FILE_BUFFERS, Filter::Id(id.0)).await?;
    } else {
        txn.update(
            FILE_BUFFERS,
            id.0,
            fields! { "ref_count" => buffer.ref_count - 1 },
        )
        .await?;
    }
    Ok(())
}

async fn chunk_at(txn: &Txn, snapshot: SnapshotId, index: u64) -> FSResult<Option<Chunk>> {
    txn.first(Filter::eq("snapshot_id", snapshot).and(Filter::eq("sequence_index", index)))
        .await
}

async fn decrypt_chunk(
    txn: &Txn,
    file: NodeId,
    key: &SymmetricKey,
    chunk: &Chunk,
) -> FSResult<Vec<u8>> {
    let buffer = load_buffer(txn, chunk.buffer_id).await?;
    let plain = crypto::decrypt(key, &buffer.payload, &chunk_aad(file, chunk.sequence_index))?;
    if plain.len() as u64 != chunk.payload_size {
        return Err(FsError::Corrupt(format!(
            "chunk {} holds {} bytes, index says {}",
            chunk.id,
            plain.len(),
            chunk.payload_size
        )));
    }
    Ok(plain)
}

/// Stores `plain` as chunk `index` of `snapshot`. A buffer shared with
/// another snapshot is left alone and replaced by a fresh one.
async fn store_chunk(
    txn: &Txn,
    file: NodeId,
    key: &SymmetricKey,
    snapshot: SnapshotId,
    index: u64,
    existing: Option<Chunk>,
    plain: &[u8],
) -> FSResult<()> {
    if plain.is_empty() {
        if let Some(chunk) = existing {
            release_buffer(txn, chunk.buffer_id).await?;
            txn.delete(CHUNKS, Filter::Id(chunk.id.0)).await?;
        }
        return Ok(());
    }

    let payload = crypto::encrypt(key, plain, &chunk_aad(file, index))?;
    let payload_size = plain.len() as u64;
    match existing {
        Some(chunk) => {
            let buffer = load_buffer(txn, chunk.buffer_id).await?;
            if buffer.ref_count <= 1 {
                txn.update(FILE_BUFFERS, buffer.id.0, fields! { "payload" => payload })
                    .await?;
                txn.update(CHUNKS, chunk.id.0, fields! { "payload_size" => payload_size })
                    .await?;
            } else {
                adjust_ref_count(txn, buffer.id, -1).await?;
                let fresh = new_buffer(txn, file, payload).await?;
                txn.update(
                    CHUNKS,
                    chunk.id.0,
                    fields! { "buffer_id" => fresh, "payload_size" => payload_size },
                )
                .await?;
            }
        }
        None => {
            let buffer_id = new_buffer(txn, file, payload).await?;
            let chunk = Chunk {
                id: ChunkId(0),
                snapshot_id: snapshot,
                sequence_index: index,
                buffer_id,
                payload_size,
            };
            txn.insert(&chunk).await?;
        }
    }
    Ok(())
}

async fn new_buffer(txn: &Txn, file: NodeId, payload: Vec<u8>) -> FSResult<BufferId> {
    let buffer = FileBuffer {
        id: BufferId(0),
        file_node_id: file,
        ref_count: 1,
        payload,
    };
    Ok(BufferId(txn.insert(&buffer).await?))
}

/// Reads `[begin, end)` of a snapshot. Ranges without a chunk read as zeros.
pub(crate) async fn read_range(
    txn: &Txn,
    file: NodeId,
    key: &SymmetricKey,
    snapshot: SnapshotId,
    range: std::ops::Range<u64>,
    chunk_size: u64,
) -> FSResult<Vec<u8>> {
    let (begin, end) = (range.start, range.end);
    if begin >= end {
        return Ok(Vec::new());
    }
    let mut out = vec![0u8; (end - begin) as usize];
    let first = begin / chunk_size;
    let last = (end - 1) / chunk_size;
    let chunks: Vec<Chunk> = txn
        .select(
            Query::new(
                Filter::eq("snapshot_id", snapshot).and(Filter::ge("sequence_index", first)),
            )
            .order_by("sequence_index"),
        )
        .await?;

    for chunk in chunks.iter().take_while(|c| c.sequence_index <= last) {
        let plain = decrypt_chunk(txn, file, key, chunk).await?;
        let chunk_begin = chunk.sequence_index * chunk_size;
        let s = begin.max(chunk_begin);
        let e = end.min(chunk_begin + plain.len() as u64);
        if s < e {
            out[(s - begin) as usize..(e - begin) as usize]
                .copy_from_slice(&plain[(s - chunk_begin) as usize..(e - chunk_begin) as usize]);
        }
    }
    Ok(out)
}

/// Writes `data` at `begin`, growing the snapshot if needed.
pub(crate) async fn write_range(
    txn: &Txn,
    file: NodeId,
    key: &SymmetricKey,
    snapshot: SnapshotId,
    begin: u64,
    data: &[u8],
    chunk_size: u64,
) -> FSResult<()> {
    if data.is_empty() {
        return Ok(());
    }
    let current = load(txn, file, snapshot).await?;
    let end = begin + data.len() as u64;
    let size = current.size.max(end);
    if size != current.size {
        txn.update(FILE_SNAPSHOTS, snapshot.0, fields! { "size" => size })
            .await?;
    }

    for index in begin / chunk_size..=(end - 1) / chunk_size {
        let chunk_begin = index * chunk_size;
        let chunk_end = (chunk_begin + chunk_size).min(size);
        let s = begin.max(chunk_begin);
        let e = end.min(chunk_end);
        let existing = chunk_at(txn, snapshot, index).await?;

        let mut plain = match &existing {
            Some(chunk) if !(s == chunk_begin && e == chunk_end) => {
                decrypt_chunk(txn, file, key, chunk).await?
            }
            _ => Vec::new(),
        };
        plain.resize((chunk_end - chunk_begin) as usize, 0);
        plain[(s - chunk_begin) as usize..(e - chunk_begin) as usize]
            .copy_from_slice(&data[(s - begin) as usize..(e - begin) as usize]);
        store_chunk(txn, file, key, snapshot, index, existing, &plain).await?;
    }
    Ok(())
}

/// Truncates or extends a snapshot. Extension adds no chunks; the new
/// tail reads as zeros.
pub(crate) async fn resize(
    txn: &Txn,
    file: NodeId,
    key: &SymmetricKey,
    snapshot: SnapshotId,
    new_size: u64,
    chunk_size: u64,
) -> FSResult<()> {
    let current = load(txn, file, snapshot).await?;
    if new_size == current.size {
        return Ok(());
    }
    if new_size < current.size {
        let keep = new_size.div_ceil(chunk_size);
        let doomed: Vec<Chunk> = txn
            .select(Query::new(
                Filter::eq("snapshot_id", snapshot).and(Filter::ge("sequence_index", keep)),
            ))
            .await?;
        for chunk in &doomed {
            release_buffer(txn, chunk.buffer_id).await?;
            txn.delete(CHUNKS, Filter::Id(chunk.id.0)).await?;
        }

        if new_size % chunk_size != 0 {
            let index = keep - 1;
            let limit = new_size - index * chunk_size;
            if let Some(chunk) = chunk_at(txn, snapshot, index).await?
                && chunk.payload_size > limit
            {
                let mut plain = decrypt_chunk(txn, file, key, &chunk).await?;
                plain.truncate(limit as usize);
                store_chunk(txn, file, key, snapshot, index, Some(chunk), &plain).await?;
            }
        }
    }
    txn.update(FILE_SNAPSHOTS, snapshot.0, fields! { "size" => new_size })
        .await?;
    Ok(())
}

/// Snapshot operations of a pool, bound to a caller's [`Ctx`].
pub struct SnapshotChain<'a> {
    pool: &'a Pool,
}

impl<'a> SnapshotChain<'a> {
    pub(crate) fn new(pool: &'a Pool) -> Self {
        Self { pool }
    }

    /// Creates a snapshot of `file`. Without `base`, only allowed while the
    /// file has no history yet.
    pub async fn create(
        &self,
        ctx: &Ctx,
        file: NodeId,
        base: Option<SnapshotId>,
    ) -> FSResult<FileSnapshot> {
        let session = ctx.session().clone();
        self.pool
            .run(ctx, move |txn| async move {
                let resolved = resolve_file(&txn, &session, file, AccessLevel::Write).await?;
                create(&txn, &resolved.node, session.principal_id(), base).await
            })
            .await
    }

    /// Snapshots of `file`, newest first.
    pub async fn list(&self, ctx: &Ctx, file: NodeId) -> FSResult<Vec<FileSnapshot>> {
        let session = ctx.session().clone();
        self.pool
            .run(ctx, move |txn| async move {
                resolve_file(&txn, &session, file, AccessLevel::Read).await?;
                list(&txn, file).await
            })
            .await
    }

    /// Deletes `snapshot`. Refused while any handle has it open; the check
    /// runs inside the unit, so it is ordered against concurrent opens.
    pub async fn delete(&self, ctx: &Ctx, file: NodeId, snapshot: SnapshotId) -> FSResult<()> {
        let session = ctx.session().clone();
        let registry = self.pool.clone();
        self.pool
            .run(ctx, move |txn| async move {
                if registry.is_snapshot_open(snapshot) {
                    return Err(FsError::SharingViolation(snapshot));
                }
                resolve_file(&txn, &session, file, AccessLevel::Write).await?;
                let snapshot = load(&txn, file, snapshot).await?;
                delete(&txn, &snapshot).await
            })
            .await
    }
}
