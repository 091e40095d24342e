//! Per-principal trash.
//!
//! Trashing re-parents a node under its owner's hidden trash folder (with
//! the usual key re-wrap) instead of deleting it. Restore moves it back;
//! purge deletes the subtree for good.

use chrono::Utc;
use nimbus_core::{Filter, Query, Value, fields};

use crate::FSResult;
use crate::config::NameCollation;
use crate::error::FsError;
use crate::pool::{NodeArena, Pool};
use crate::schema::{GRANTS, Grant, KEYS, NODES, Node, NodeId, NodeKind, NodeRole, PrincipalId};
use crate::session::{Ctx, Session};
use crate::snapshots;
use crate::tree;
use crate::txqueue::Txn;
use crate::vault::{self, Anchor};

/// The principal's root or trash folder.
pub(crate) async fn top_folder(txn: &Txn, owner: PrincipalId, role: NodeRole) -> FSResult<Node> {
    txn.first(Filter::eq("owner_id", owner).and(Filter::eq("role", role.as_str())))
        .await?
        .ok_or_else(|| FsError::Corrupt(format!("principal {owner} has no {role:?} folder")))
}

fn invalidate_on_success(txn: &Txn, arena: &NodeArena, ids: Vec<NodeId>) {
    let arena = arena.clone();
    txn.on_success(move || ids.into_iter().for_each(|id| arena.invalidate(id)));
}

pub(crate) async fn trash(
    txn: &Txn,
    session: &Session,
    arena: &NodeArena,
    node: NodeId,
) -> FSResult<Node> {
    let resolved = vault::resolve_chain(txn, session, node).await?;
    let mut trashed = resolved.node.clone();
    if trashed.role != NodeRole::Normal {
        return Err(FsError::InvalidParent(format!(
            "'{}' is a root folder and cannot be trashed",
            trashed.name
        )));
    }
    if resolved.in_trash {
        return Err(FsError::InvalidParent(format!(
            "'{}' is already in the trash",
            trashed.name
        )));
    }
    if !matches!(resolved.anchor, Anchor::Root(_)) {
        return Err(FsError::AccessDenied(format!(
            "only the owner can trash '{}'",
            trashed.name
        )));
    }
    let origin = trashed
        .parent_id
        .ok_or_else(|| FsError::Corrupt(format!("node {} has no parent", trashed.id)))?;
    vault::resolve_chain(txn, session, origin)
        .await?
        .require(crate::schema::AccessLevel::Write)?;

    let trash_root = top_folder(txn, session.principal_id(), NodeRole::TrashRoot).await?;
    let trash_key = vault::resolve_chain(txn, session, trash_root.id).await?;
    vault::rewrap(txn, &resolved.key, &trash_key.key).await?;

    let now = Utc::now();
    txn.update(
        NODES,
        trashed.id.0,
        fields! {
            "parent_id" => trash_root.id,
            "trash_origin_id" => origin,
            "trash_time" => now.timestamp_millis(),
            "update_time" => now.timestamp_millis(),
        },
    )
    .await?;
    invalidate_on_success(txn, arena, vec![trashed.id]);
    tracing::debug!(node = %trashed.id, origin = %origin, "node trashed");

    trashed.parent_id = Some(trash_root.id);
    trashed.trash_origin_id = Some(origin);
    trashed.trash_time = Some(now);
    trashed.update_time = now;
    Ok(trashed)
}

pub(crate) async fn restore(
    txn: &Txn,
    session: &Session,
    arena: &NodeArena,
    collation: NameCollation,
    node: NodeId,
) -> FSResult<Node> {
    let resolved = vault::resolve_chain(txn, session, node).await?;
    let mut restored = resolved.node.clone();
    if !restored.is_trashed() {
        return Err(FsError::InvalidParent(format!(
            "'{}' is not in the trash",
            restored.name
        )));
    }

    let origin = match restored.trash_origin_id {
        Some(origin) => match tree::writable_folder(txn, session, origin).await {
            Ok(folder) => Some(folder),
            Err(FsError::NoSuchFileOrFolder(_) | FsError::InvalidParent(_)) => None,
            Err(err) => return Err(err),
        },
        None => None,
    };
    let target = match origin {
        Some(folder) => folder,
        None => {
            let root = top_folder(txn, session.principal_id(), NodeRole::Root).await?;
            tree::writable_folder(txn, session, root.id).await?
        }
    };

    let name_key = collation.key(&restored.name);
    tree::ensure_name_free(
        txn,
        target.node.id,
        &restored.name,
        &name_key,
        Some(restored.id),
    )
    .await?;
    vault::rewrap(txn, &resolved.key, &target.key).await?;

    let now = Utc::now();
    txn.update(
        NODES,
        restored.id.0,
        fields! {
            "parent_id" => target.node.id,
            "name_key" => name_key.as_str(),
            "trash_origin_id" => Value::Null,
            "trash_time" => Value::Null,
            "update_time" => now.timestamp_millis(),
        },
    )
    .await?;
    invalidate_on_success(txn, arena, vec![restored.id]);
    tracing::debug!(node = %restored.id, parent = %target.node.id, "node restored");

    restored.parent_id = Some(target.node.id);
    restored.name_key = name_key;
    restored.trash_origin_id = None;
    restored.trash_time = None;
    restored.update_time = now;
    Ok(restored)
}

/// Deletes `root` and everything below it: node rows, keys, grants and
/// file snapshots (reclaiming their chunks). Returns the number of nodes.
/// Refused while any handle has one of the subtree's snapshots open.
async fn delete_subtree(txn: &Txn, session: &Session, pool: &Pool, root: Node) -> FSResult<usize> {
    let mut doomed = Vec::new();
    let mut pending = vec![root];
    while let Some(node) = pending.pop() {
        let children: Vec<Node> = txn
            .select(Query::new(Filter::eq("parent_id", node.id)))
            .await?;
        pending.extend(children);
        doomed.push(node);
    }

    for node in doomed.iter().filter(|n| n.kind == NodeKind::File) {
        if let Some(open) = snapshots::list(txn, node.id)
            .await?
            .into_iter()
            .find(|snapshot| pool.is_snapshot_open(snapshot.id))
        {
            return Err(FsError::SharingViolation(open.id));
        }
    }

    for node in &doomed {
        if node.kind == NodeKind::File {
            snapshots::delete_all(txn, node.id).await?;
        }
        let grants: Vec<Grant> = txn
            .select(Query::new(Filter::eq("node_id", node.id)))
            .await?;
        for grant in grants {
            txn.delete(KEYS, Filter::Id(grant.key_id.0)).await?;
            txn.delete(GRANTS, Filter::Id(grant.id.0)).await?;
        }
        txn.delete(KEYS, Filter::Id(node.key_id.0)).await?;
        txn.delete(NODES, Filter::Id(node.id.0)).await?;
        session.forget(node.key_id);
    }
    invalidate_on_success(txn, pool.arena(), doomed.iter().map(|n| n.id).collect());
    Ok(doomed.len())
}

pub(crate) async fn purge(
    txn: &Txn,
    session: &Session,
    pool: &Pool,
    node: NodeId,
) -> FSResult<usize> {
    let resolved = vault::resolve_chain(txn, session, node).await?;
    if !resolved.node.is_trashed() {
        return Err(FsError::InvalidParent(format!(
            "'{}' must be trashed before it can be purged",
            resolved.node.name
        )));
    }
    let count = delete_subtree(txn, session, pool, resolved.node).await?;
    tracing::debug!(node = %node, count, "purged from trash");
    Ok(count)
}

pub(crate) async fn list_trash(txn: &Txn, session: &Session) -> FSResult<Vec<Node>> {
    let trash_root = top_folder(txn, session.principal_id(), NodeRole::TrashRoot).await?;
    txn.select(Query::new(Filter::eq("parent_id", trash_root.id)).order_by_desc("trash_time"))
        .await
}

pub(crate) async fn empty_trash(txn: &Txn, session: &Session, pool: &Pool) -> FSResult<usize> {
    let mut count = 0;
    for node in list_trash(txn, session).await? {
        count += delete_subtree(txn, session, pool, node).await?;
    }
    Ok(count)
}

/// Trash operations of a pool, bound to a caller's [`Ctx`].
pub struct TrashModule<'a> {
    pool: &'a Pool,
}

impl<'a> TrashModule<'a> {
    pub(crate) fn new(pool: &'a Pool) -> Self {
        Self { pool }
    }

    pub async fn trash(&self, ctx: &Ctx, node: NodeId) -> FSResult<Node> {
        let session = ctx.session().clone();
        let arena = self.pool.arena().clone();
        self.pool
            .run(ctx, move |txn| async move {
                trash(&txn, &session, &arena, node).await
            })
            .await
    }

    /// Moves a trashed node back to where it came from, or to the owner's
    /// root if that folder is gone or itself trashed.
    pub async fn restore(&self, ctx: &Ctx, node: NodeId) -> FSResult<Node> {
        let session = ctx.session().clone();
        let arena = self.pool.arena().clone();
        let collation = self.pool.config().collation;
        self.pool
            .run(ctx, move |txn| async move {
                restore(&txn, &session, &arena, collation, node).await
            })
            .await
    }

    /// Deletes a trashed node and its subtree for good.
    pub async fn purge(&self, ctx: &Ctx, node: NodeId) -> FSResult<usize> {
        let session = ctx.session().clone();
        let pool = self.pool.clone();
        self.pool
            .run(ctx, move |txn| async move {
                purge(&txn, &session, &pool, node).await
            })
            .await
    }

    /// Items directly in the trash, most recently trashed first.
    pub async fn list(&self, ctx: &Ctx) -> FSResult<Vec<Node>> {
        let session = ctx.session().clone();
        self.pool
            .run(ctx, move |txn| async move { list_trash(&txn, &session).await })
            .await
    }

    pub async fn empty(&self, ctx: &Ctx) -> FSResult<usize> {
        let session = ctx.session().clone();
        let pool = self.pool.clone();
        self.pool
            .run(ctx, move |txn| async move { empty_trash(&txn, &session, &pool).await })
            .await
    }
}
