//! Handle-style façade over [`Pool`]: folders and files bound to the
//! caller's [`Ctx`].

use crate::FSResult;
use crate::handle::{self, Access, FileHandle, Mode};
use crate::pool::Pool;
use crate::schema::{FileSnapshot, Node, NodeId, NodeKind, SnapshotId};
use crate::session::Ctx;

/// Anything found in a folder.
#[derive(Clone, Debug)]
pub enum Entry {
    Folder(FolderHandle),
    File(FileEntry),
    SymbolicLink(Node),
}

impl Entry {
    pub(crate) fn from_node(pool: &Pool, ctx: &Ctx, node: Node) -> Self {
        match node.kind {
            NodeKind::Folder => Entry::Folder(FolderHandle::new(pool.clone(), ctx.clone(), node)),
            NodeKind::File => Entry::File(FileEntry::new(pool.clone(), ctx.clone(), node)),
            NodeKind::SymbolicLink => Entry::SymbolicLink(node),
        }
    }

    pub fn node(&self) -> &Node {
        match self {
            Entry::Folder(folder) => folder.node(),
            Entry::File(file) => file.node(),
            Entry::SymbolicLink(node) => node,
        }
    }

    pub fn name(&self) -> &str {
        &self.node().name
    }

    pub fn into_folder(self) -> Option<FolderHandle> {
        match self {
            Entry::Folder(folder) => Some(folder),
            _ => None,
        }
    }

    pub fn into_file(self) -> Option<FileEntry> {
        match self {
            Entry::File(file) => Some(file),
            _ => None,
        }
    }
}

/// A folder as seen by one context.
#[derive(Clone, Debug)]
pub struct FolderHandle {
    pool: Pool,
    ctx: Ctx,
    node: Node,
}

impl FolderHandle {
    pub(crate) fn new(pool: Pool, ctx: Ctx, node: Node) -> Self {
        Self { pool, ctx, node }
    }

    /// The row this handle was created from.
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    /// The freshest known row: the pool's node arena if it holds one,
    /// otherwise a store read.
    pub async fn current(&self) -> FSResult<Node> {
        match self.pool.arena().get(self.node.id) {
            Some(node) => Ok(node),
            None => self.pool.tree().stat(&self.ctx, self.node.id).await,
        }
    }

    /// Live children, in name order.
    pub async fn scan(&self) -> FSResult<Vec<Entry>> {
        let nodes = self.pool.tree().scan(&self.ctx, self.node.id).await?;
        Ok(nodes
            .into_iter()
            .map(|node| Entry::from_node(&self.pool, &self.ctx, node))
            .collect())
    }

    pub async fn create_file(&self, name: &str) -> FSResult<FileEntry> {
        let node = self
            .pool
            .tree()
            .create_file(&self.ctx, self.node.id, name)
            .await?;
        Ok(FileEntry::new(self.pool.clone(), self.ctx.clone(), node))
    }

    pub async fn create_folder(&self, name: &str) -> FSResult<FolderHandle> {
        let node = self
            .pool
            .tree()
            .create_folder(&self.ctx, self.node.id, name)
            .await?;
        Ok(FolderHandle::new(self.pool.clone(), self.ctx.clone(), node))
    }

    pub async fn create_symbolic_link(&self, name: &str, target: &str) -> FSResult<Node> {
        self.pool
            .tree()
            .create_symbolic_link(&self.ctx, self.node.id, name, target)
            .await
    }

    pub async fn lookup(&self, name: &str) -> FSResult<Entry> {
        let node = self.pool.tree().lookup(&self.ctx, self.node.id, name).await?;
        Ok(Entry::from_node(&self.pool, &self.ctx, node))
    }

    /// Resolves a `/`-separated path below this folder.
    pub async fn get_by_path(&self, path: &str) -> FSResult<Entry> {
        let node = self
            .pool
            .tree()
            .get_by_path(&self.ctx, self.node.id, path)
            .await?;
        Ok(Entry::from_node(&self.pool, &self.ctx, node))
    }

    /// Moves the child `name` to the trash.
    pub async fn trash(&self, name: &str) -> FSResult<Node> {
        let child = self.pool.tree().lookup(&self.ctx, self.node.id, name).await?;
        self.pool.trash().trash(&self.ctx, child.id).await
    }

    /// Moves the child `name` into `destination`, optionally renaming it.
    pub async fn move_to(
        &self,
        name: &str,
        destination: &FolderHandle,
        new_name: Option<&str>,
    ) -> FSResult<Entry> {
        let child = self.pool.tree().lookup(&self.ctx, self.node.id, name).await?;
        let moved = self
            .pool
            .tree()
            .move_node(&self.ctx, child.id, destination.id(), new_name)
            .await?;
        Ok(Entry::from_node(&self.pool, &self.ctx, moved))
    }

    pub async fn rename(&self, name: &str, new_name: &str) -> FSResult<Entry> {
        let child = self.pool.tree().lookup(&self.ctx, self.node.id, name).await?;
        let renamed = self.pool.tree().rename(&self.ctx, child.id, new_name).await?;
        Ok(Entry::from_node(&self.pool, &self.ctx, renamed))
    }
}

/// A file as seen by one context. Content is reached through
/// [`FileEntry::open`].
#[derive(Clone, Debug)]
pub struct FileEntry {
    pool: Pool,
    ctx: Ctx,
    node: Node,
}

impl FileEntry {
    pub(crate) fn new(pool: Pool, ctx: Ctx, node: Node) -> Self {
        Self { pool, ctx, node }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    /// Snapshots of this file, newest first.
    pub async fn list_snapshots(&self) -> FSResult<Vec<FileSnapshot>> {
        self.pool.snapshots().list(&self.ctx, self.node.id).await
    }

    pub async fn create_snapshot(&self, base: Option<SnapshotId>) -> FSResult<FileSnapshot> {
        self.pool
            .snapshots()
            .create(&self.ctx, self.node.id, base)
            .await
    }

    pub async fn delete_snapshot(&self, snapshot: SnapshotId) -> FSResult<()> {
        self.pool
            .snapshots()
            .delete(&self.ctx, self.node.id, snapshot)
            .await
    }

    /// Opens `snapshot`, or the newest snapshot when `None`.
    pub async fn open(
        &self,
        snapshot: Option<SnapshotId>,
        access: Access,
        mode: Mode,
    ) -> FSResult<FileHandle> {
        handle::open(&self.pool, &self.ctx, self.node.id, snapshot, access, mode).await
    }
}
