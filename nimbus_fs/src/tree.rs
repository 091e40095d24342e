//! The node tree: folders, files and symbolic links.

use chrono::Utc;
use nimbus_core::{Filter, Query, fields};

use crate::FSResult;
use crate::config::NameCollation;
use crate::crypto;
use crate::error::FsError;
use crate::pool::{NodeArena, Pool};
use crate::schema::{
    AccessLevel, FileSnapshot, KeyId, NODES, Node, NodeId, NodeKind, NodeRole, PrincipalId,
    SnapshotId,
};
use crate::session::{Ctx, Session, UnlockedKey};
use crate::txqueue::Txn;
use crate::vault::{self, ResolvedKey};

pub(crate) fn validate_name(name: &str) -> FSResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0')
    {
        return Err(FsError::InvalidName(name.to_owned()));
    }
    Ok(())
}

fn link_aad(key: KeyId) -> Vec<u8> {
    format!("nimbus/link/{key}").into_bytes()
}

/// Fails with `NameConflict` if a sibling other than `except` already uses
/// `name` under the pool collation.
pub(crate) async fn ensure_name_free(
    txn: &Txn,
    parent: NodeId,
    name: &str,
    name_key: &str,
    except: Option<NodeId>,
) -> FSResult<()> {
    let clash: Vec<Node> = txn
        .select(Query::new(
            Filter::eq("parent_id", parent).and(Filter::eq("name_key", name_key)),
        ))
        .await?;
    if clash.iter().any(|n| Some(n.id) != except) {
        return Err(FsError::NameConflict(name.to_owned()));
    }
    Ok(())
}

/// Resolves `folder` and checks new children may be placed in it.
pub(crate) async fn writable_folder(
    txn: &Txn,
    session: &Session,
    folder: NodeId,
) -> FSResult<ResolvedKey> {
    let resolved = vault::resolve_chain(txn, session, folder).await?;
    if !resolved.node.is_folder() {
        return Err(FsError::InvalidParent(format!(
            "'{}' is not a folder",
            resolved.node.name
        )));
    }
    if resolved.in_trash || resolved.node.role == NodeRole::TrashRoot {
        return Err(FsError::InvalidParent(format!(
            "'{}' is in the trash",
            resolved.node.name
        )));
    }
    resolved.require(AccessLevel::Write)?;
    Ok(resolved)
}

async fn readable_folder(txn: &Txn, session: &Session, folder: NodeId) -> FSResult<ResolvedKey> {
    let resolved = vault::resolve_chain(txn, session, folder).await?;
    if !resolved.node.is_folder() {
        return Err(FsError::NotAFolder(resolved.node.name.clone()));
    }
    Ok(resolved)
}

/// Inserts a principal's root or trash folder, keyed under its root key.
pub(crate) async fn create_top_folder(
    txn: &Txn,
    owner: PrincipalId,
    root_key: &UnlockedKey,
    role: NodeRole,
    name: &str,
) -> FSResult<Node> {
    let key = vault::create_node_key(txn, root_key).await?;
    let now = Utc::now();
    let mut node = Node {
        id: NodeId(0),
        parent_id: None,
        name: name.to_owned(),
        name_key: name.to_owned(),
        kind: NodeKind::Folder,
        role,
        owner_id: owner,
        key_id: key.id,
        link_target: None,
        trash_origin_id: None,
        create_time: now,
        update_time: now,
        access_time: now,
        trash_time: None,
    };
    node.id = NodeId(txn.insert(&node).await?);
    Ok(node)
}

/// Creates a child of `parent`. Files also get their first, empty snapshot.
pub(crate) async fn create_node(
    txn: &Txn,
    session: &Session,
    collation: NameCollation,
    parent: NodeId,
    name: &str,
    kind: NodeKind,
    link_target: Option<&str>,
) -> FSResult<Node> {
    validate_name(name)?;
    let parent = writable_folder(txn, session, parent).await?;
    let name_key = collation.key(name);
    ensure_name_free(txn, parent.node.id, name, &name_key, None).await?;

    let key = vault::create_node_key(txn, &parent.key).await?;
    let link_target = match (kind, link_target) {
        (NodeKind::SymbolicLink, Some(target)) => {
            let sym = key
                .as_symmetric()
                .ok_or_else(|| FsError::Corrupt("node key is not symmetric".into()))?;
            Some(crypto::encrypt(sym, target.as_bytes(), &link_aad(key.id))?)
        }
        _ => None,
    };

    let now = Utc::now();
    let mut node = Node {
        id: NodeId(0),
        parent_id: Some(parent.node.id),
        name: name.to_owned(),
        name_key,
        kind,
        role: NodeRole::Normal,
        owner_id: parent.node.owner_id,
        key_id: key.id,
        link_target,
        trash_origin_id: None,
        create_time: now,
        update_time: now,
        access_time: now,
        trash_time: None,
    };
    node.id = NodeId(txn.insert(&node).await?);

    if kind == NodeKind::File {
        let snapshot = FileSnapshot {
            id: SnapshotId(0),
            file_node_id: node.id,
            base_snapshot_id: None,
            size: 0,
            create_time: now,
            author_id: session.principal_id(),
        };
        txn.insert(&snapshot).await?;
    }
    session.remember(&key);
    tracing::debug!(node = %node.id, parent = %parent.node.id, kind = ?kind, "node created");
    Ok(node)
}

/// Fails if `node` is `candidate` or one of its ancestors.
async fn ensure_not_ancestor(txn: &Txn, node: NodeId, candidate: &Node) -> FSResult<()> {
    let mut current = candidate.clone();
    loop {
        if current.id == node {
            return Err(FsError::InvalidParent(
                "a folder cannot be moved into its own subtree".into(),
            ));
        }
        match current.parent_id {
            Some(parent) => current = vault::load_node(txn, parent).await?,
            None => return Ok(()),
        }
    }
}

/// Moves (and optionally renames) `node` under `new_parent`. The node key
/// is re-wrapped under the new parent's key in the same unit.
pub(crate) async fn move_node(
    txn: &Txn,
    session: &Session,
    arena: &NodeArena,
    collation: NameCollation,
    node: NodeId,
    new_parent: NodeId,
    new_name: Option<&str>,
) -> FSResult<Node> {
    let resolved = vault::resolve_chain(txn, session, node).await?;
    let mut moved = resolved.node.clone();
    if moved.role != NodeRole::Normal {
        return Err(FsError::InvalidParent(format!(
            "'{}' is a root folder and cannot be moved",
            moved.name
        )));
    }
    if moved.is_trashed() {
        return Err(FsError::InvalidParent(format!(
            "'{}' is in the trash; restore it first",
            moved.name
        )));
    }
    let old_parent = moved
        .parent_id
        .ok_or_else(|| FsError::Corrupt(format!("node {} has no parent", moved.id)))?;
    vault::resolve_chain(txn, session, old_parent)
        .await?
        .require(AccessLevel::Write)?;

    let target = writable_folder(txn, session, new_parent).await?;
    ensure_not_ancestor(txn, moved.id, &target.node).await?;

    let name = new_name.unwrap_or(&moved.name).to_owned();
    validate_name(&name)?;
    let name_key = collation.key(&name);
    ensure_name_free(txn, target.node.id, &name, &name_key, Some(moved.id)).await?;

    if target.node.id != old_parent {
        vault::rewrap(txn, &resolved.key, &target.key).await?;
    }
    let now = Utc::now();
    txn.update(
        NODES,
        moved.id.0,
        fields! {
            "parent_id" => target.node.id,
            "name" => name.as_str(),
            "name_key" => name_key.as_str(),
            "update_time" => now.timestamp_millis(),
        },
    )
    .await?;

    let arena = arena.clone();
    let id = moved.id;
    txn.on_success(move || arena.invalidate(id));

    moved.parent_id = Some(target.node.id);
    moved.name = name;
    moved.name_key = name_key;
    moved.update_time = now;
    Ok(moved)
}

/// Live children of `folder`, ordered by name.
pub(crate) async fn scan(txn: &Txn, session: &Session, folder: NodeId) -> FSResult<Vec<Node>> {
    readable_folder(txn, session, folder).await?;
    txn.select(
        Query::new(Filter::eq("parent_id", folder).and(Filter::is_null("trash_time")))
            .order_by("name"),
    )
    .await
}

pub(crate) async fn lookup(
    txn: &Txn,
    session: &Session,
    collation: NameCollation,
    folder: NodeId,
    name: &str,
) -> FSResult<Node> {
    readable_folder(txn, session, folder).await?;
    child_named(txn, collation, folder, name)
        .await?
        .ok_or_else(|| FsError::NoSuchFileOrFolder(name.to_owned()))
}

async fn child_named(
    txn: &Txn,
    collation: NameCollation,
    folder: NodeId,
    name: &str,
) -> FSResult<Option<Node>> {
    txn.first(
        Filter::eq("parent_id", folder)
            .and(Filter::eq("name_key", collation.key(name)))
            .and(Filter::is_null("trash_time")),
    )
    .await
}

/// Follows `segments` from `root`, one lookup per segment.
pub(crate) async fn get_by_path(
    txn: &Txn,
    session: &Session,
    collation: NameCollation,
    root: NodeId,
    segments: &[String],
) -> FSResult<Node> {
    let mut current = vault::resolve_chain(txn, session, root).await?.node;
    let mut walked = String::new();
    for segment in segments.iter().filter(|s| !s.is_empty()) {
        if !current.is_folder() {
            return Err(FsError::NotAFolder(if walked.is_empty() {
                current.name.clone()
            } else {
                walked.clone()
            }));
        }
        walked.push('/');
        walked.push_str(segment);
        current = child_named(txn, collation, current.id, segment)
            .await?
            .ok_or_else(|| FsError::NoSuchFileOrFolder(walked.clone()))?;
    }
    Ok(current)
}

pub(crate) async fn read_link(txn: &Txn, session: &Session, link: NodeId) -> FSResult<String> {
    let resolved = vault::resolve_chain(txn, session, link).await?;
    let node = &resolved.node;
    let (NodeKind::SymbolicLink, Some(target)) = (node.kind, &node.link_target) else {
        return Err(FsError::NotAFile(format!("'{}' is not a symbolic link", node.name)));
    };
    let plain = crypto::decrypt(resolved.symmetric()?, target, &link_aad(node.key_id))?;
    String::from_utf8(plain)
        .map_err(|_| FsError::Corrupt(format!("link target of node {} is not UTF-8", node.id)))
}

pub(crate) async fn touch_access(txn: &Txn, node: NodeId) -> FSResult<()> {
    txn.update(
        NODES,
        node.0,
        fields! { "access_time" => Utc::now().timestamp_millis() },
    )
    .await
}

/// Splits a `/`-separated path into segments.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Tree operations of a pool, bound to a caller's [`Ctx`].
pub struct NodeTree<'a> {
    pool: &'a Pool,
}

impl<'a> NodeTree<'a> {
    pub(crate) fn new(pool: &'a Pool) -> Self {
        Self { pool }
    }

    async fn create(
        &self,
        ctx: &Ctx,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        link_target: Option<&str>,
    ) -> FSResult<Node> {
        let session = ctx.session().clone();
        let collation = self.pool.config().collation;
        let name = name.to_owned();
        let link_target = link_target.map(str::to_owned);
        let node = self
            .pool
            .run(ctx, move |txn| async move {
                create_node(
                    &txn,
                    &session,
                    collation,
                    parent,
                    &name,
                    kind,
                    link_target.as_deref(),
                )
                .await
            })
            .await?;
        self.pool.arena().insert(node.clone());
        Ok(node)
    }

    pub async fn create_folder(&self, ctx: &Ctx, parent: NodeId, name: &str) -> FSResult<Node> {
        self.create(ctx, parent, name, NodeKind::Folder, None).await
    }

    pub async fn create_file(&self, ctx: &Ctx, parent: NodeId, name: &str) -> FSResult<Node> {
        self.create(ctx, parent, name, NodeKind::File, None).await
    }

    pub async fn create_symbolic_link(
        &self,
        ctx: &Ctx,
        parent: NodeId,
        name: &str,
        target: &str,
    ) -> FSResult<Node> {
        self.create(ctx, parent, name, NodeKind::SymbolicLink, Some(target))
            .await
    }

    /// Moves `node` under `new_parent`, optionally renaming it.
    pub async fn move_node(
        &self,
        ctx: &Ctx,
        node: NodeId,
        new_parent: NodeId,
        new_name: Option<&str>,
    ) -> FSResult<Node> {
        let session = ctx.session().clone();
        let collation = self.pool.config().collation;
        let arena = self.pool.arena().clone();
        let new_name = new_name.map(str::to_owned);
        self.pool
            .run(ctx, move |txn| async move {
                move_node(
                    &txn,
                    &session,
                    &arena,
                    collation,
                    node,
                    new_parent,
                    new_name.as_deref(),
                )
                .await
            })
            .await
    }

    pub async fn rename(&self, ctx: &Ctx, node: NodeId, new_name: &str) -> FSResult<Node> {
        let current = self.stat(ctx, node).await?;
        let parent = current.parent_id.ok_or_else(|| {
            FsError::InvalidParent(format!("'{}' is a root folder", current.name))
        })?;
        self.move_node(ctx, node, parent, Some(new_name)).await
    }

    pub async fn scan(&self, ctx: &Ctx, folder: NodeId) -> FSResult<Vec<Node>> {
        let session = ctx.session().clone();
        let arena = self.pool.arena().clone();
        self.pool
            .run(ctx, move |txn| async move {
                let children = scan(&txn, &session, folder).await?;
                let warm = children.clone();
                txn.on_success(move || warm.into_iter().for_each(|n| arena.insert(n)));
                Ok(children)
            })
            .await
    }

    pub async fn lookup(&self, ctx: &Ctx, folder: NodeId, name: &str) -> FSResult<Node> {
        let session = ctx.session().clone();
        let collation = self.pool.config().collation;
        let name = name.to_owned();
        self.pool
            .run(ctx, move |txn| async move {
                lookup(&txn, &session, collation, folder, &name).await
            })
            .await
    }

    /// Resolves a `/`-separated path relative to `root`.
    pub async fn get_by_path(&self, ctx: &Ctx, root: NodeId, path: &str) -> FSResult<Node> {
        let session = ctx.session().clone();
        let collation = self.pool.config().collation;
        let segments = split_path(path);
        self.pool
            .run(ctx, move |txn| async move {
                get_by_path(&txn, &session, collation, root, &segments).await
            })
            .await
    }

    pub async fn read_link(&self, ctx: &Ctx, link: NodeId) -> FSResult<String> {
        let session = ctx.session().clone();
        self.pool
            .run(ctx, move |txn| async move { read_link(&txn, &session, link).await })
            .await
    }

    /// Current row of `node`, after checking the session can reach it.
    pub async fn stat(&self, ctx: &Ctx, node: NodeId) -> FSResult<Node> {
        let session = ctx.session().clone();
        let arena = self.pool.arena().clone();
        self.pool
            .run(ctx, move |txn| async move {
                let node = vault::resolve_chain(&txn, &session, node).await?.node;
                let warm = node.clone();
                txn.on_success(move || arena.insert(warm));
                Ok(node)
            })
            .await
    }

    /// Moves `node` to its owner's trash.
    pub async fn trash(&self, ctx: &Ctx, node: NodeId) -> FSResult<Node> {
        self.pool.trash().trash(ctx, node).await
    }
}
