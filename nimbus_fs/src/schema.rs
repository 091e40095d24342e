//! Persisted entities and their mapping onto row-store records.

use chrono::{DateTime, Utc};
use nimbus_core::{Fields, Record, RowId, Value, fields};
use std::fmt;

use crate::FSResult;
use crate::error::FsError;

pub const NODES: &str = "nodes";
pub const KEYS: &str = "keys";
pub const FILE_SNAPSHOTS: &str = "file_snapshots";
pub const CHUNKS: &str = "chunks";
pub const FILE_BUFFERS: &str = "file_buffers";
pub const PRINCIPALS: &str = "principals";
pub const GRANTS: &str = "grants";
pub const SCHEMA_VERSION: &str = "schema_version";
pub const POOL_LAYOUT: &str = "pool_layout";

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub RowId);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$name> for Value {
            fn from(id: $name) -> Value {
                Value::from(id.0)
            }
        }
    };
}

row_id!(NodeId);
row_id!(KeyId);
row_id!(PrincipalId);
row_id!(SnapshotId);
row_id!(ChunkId);
row_id!(BufferId);
row_id!(GrantId);

/// A persisted row type.
pub(crate) trait Entity: Sized + Send + 'static {
    const TABLE: &'static str;

    fn from_record(record: &Record) -> FSResult<Self>;

    /// All columns except the id.
    fn to_fields(&self) -> Fields;
}

fn corrupt(table: &str, id: RowId, what: impl fmt::Display) -> FsError {
    FsError::Corrupt(format!("{table} row {id}: {what}"))
}

fn time_to_value(t: DateTime<Utc>) -> Value {
    Value::Int(t.timestamp_millis())
}

fn time_from(record: &Record, table: &str, column: &str) -> FSResult<DateTime<Utc>> {
    let millis = record.int(column)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| corrupt(table, record.id, format!("{column} out of range")))
}

fn opt_time_from(record: &Record, table: &str, column: &str) -> FSResult<Option<DateTime<Utc>>> {
    match record.opt_int(column)? {
        None => Ok(None),
        Some(millis) => DateTime::from_timestamp_millis(millis)
            .map(Some)
            .ok_or_else(|| corrupt(table, record.id, format!("{column} out of range"))),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
    SymbolicLink,
}

impl NodeKind {
    fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Folder => "folder",
            NodeKind::SymbolicLink => "symlink",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(NodeKind::File),
            "folder" => Some(NodeKind::Folder),
            "symlink" => Some(NodeKind::SymbolicLink),
            _ => None,
        }
    }
}

/// What a node is for. `Root` and `TrashRoot` are the per-principal tops
/// whose keys are sealed to the principal's root key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Normal,
    Root,
    TrashRoot,
}

impl NodeRole {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Normal => "normal",
            NodeRole::Root => "root",
            NodeRole::TrashRoot => "trash",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(NodeRole::Normal),
            "root" => Some(NodeRole::Root),
            "trash" => Some(NodeRole::TrashRoot),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    /// Collation key of `name`; sibling uniqueness is checked on it.
    pub(crate) name_key: String,
    pub kind: NodeKind,
    pub role: NodeRole,
    pub owner_id: PrincipalId,
    pub key_id: KeyId,
    /// Encrypted under the node's own key.
    pub(crate) link_target: Option<Vec<u8>>,
    pub trash_origin_id: Option<NodeId>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub access_time: DateTime<Utc>,
    pub trash_time: Option<DateTime<Utc>>,
}

impl Node {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    pub fn is_trashed(&self) -> bool {
        self.trash_time.is_some()
    }
}

impl Entity for Node {
    const TABLE: &'static str = NODES;

    fn from_record(r: &Record) -> FSResult<Self> {
        let kind = NodeKind::parse(r.text("kind")?)
            .ok_or_else(|| corrupt(NODES, r.id, "unknown kind"))?;
        let role = NodeRole::parse(r.text("role")?)
            .ok_or_else(|| corrupt(NODES, r.id, "unknown role"))?;
        Ok(Node {
            id: NodeId(r.id),
            parent_id: r.opt_uint("parent_id")?.map(NodeId),
            name: r.text("name")?.to_owned(),
            name_key: r.text("name_key")?.to_owned(),
            kind,
            role,
            owner_id: PrincipalId(r.uint("owner_id")?),
            key_id: KeyId(r.uint("key_id")?),
            link_target: r.opt_bytes("link_target")?.map(<[u8]>::to_vec),
            trash_origin_id: r.opt_uint("trash_origin_id")?.map(NodeId),
            create_time: time_from(r, NODES, "create_time")?,
            update_time: time_from(r, NODES, "update_time")?,
            access_time: time_from(r, NODES, "access_time")?,
            trash_time: opt_time_from(r, NODES, "trash_time")?,
        })
    }

    fn to_fields(&self) -> Fields {
        fields! {
            "parent_id" => self.parent_id,
            "name" => self.name.as_str(),
            "name_key" => self.name_key.as_str(),
            "kind" => self.kind.as_str(),
            "role" => self.role.as_str(),
            "owner_id" => self.owner_id,
            "key_id" => self.key_id,
            "link_target" => self.link_target.clone(),
            "trash_origin_id" => self.trash_origin_id,
            "create_time" => time_to_value(self.create_time),
            "update_time" => time_to_value(self.update_time),
            "access_time" => time_to_value(self.access_time),
            "trash_time" => self.trash_time.map_or(Value::Null, time_to_value),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    /// X25519 pair; the public half is stored in the clear.
    Root,
    Node,
    Grant,
}

impl KeyKind {
    fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Root => "root",
            KeyKind::Node => "node",
            KeyKind::Grant => "grant",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "root" => Some(KeyKind::Root),
            "node" => Some(KeyKind::Node),
            "grant" => Some(KeyKind::Grant),
            _ => None,
        }
    }
}

/// The one key (or principal) a stored key is encrypted under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrappedBy {
    Principal(PrincipalId),
    Key(KeyId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRecord {
    pub id: KeyId,
    pub kind: KeyKind,
    pub public_key: Option<[u8; 32]>,
    pub wrapped_secret: Vec<u8>,
    pub wrapped_by: WrappedBy,
}

impl Entity for KeyRecord {
    const TABLE: &'static str = KEYS;

    fn from_record(r: &Record) -> FSResult<Self> {
        let kind =
            KeyKind::parse(r.text("kind")?).ok_or_else(|| corrupt(KEYS, r.id, "unknown kind"))?;
        let public_key = match r.opt_bytes("public_key")? {
            None => None,
            Some(bytes) => Some(
                bytes
                    .try_into()
                    .map_err(|_| corrupt(KEYS, r.id, "public key is not 32 bytes"))?,
            ),
        };
        let wrapped_by = match (
            r.opt_uint("wrapped_by_principal")?,
            r.opt_uint("wrapped_by_key")?,
        ) {
            (Some(p), None) => WrappedBy::Principal(PrincipalId(p)),
            (None, Some(k)) => WrappedBy::Key(KeyId(k)),
            _ => return Err(corrupt(KEYS, r.id, "must be wrapped by exactly one parent")),
        };
        Ok(KeyRecord {
            id: KeyId(r.id),
            kind,
            public_key,
            wrapped_secret: r.bytes("wrapped_secret")?.to_vec(),
            wrapped_by,
        })
    }

    fn to_fields(&self) -> Fields {
        let (by_principal, by_key) = match self.wrapped_by {
            WrappedBy::Principal(p) => (Some(p), None),
            WrappedBy::Key(k) => (None, Some(k)),
        };
        fields! {
            "kind" => self.kind.as_str(),
            "public_key" => self.public_key.map(|k| k.to_vec()),
            "wrapped_secret" => self.wrapped_secret.clone(),
            "wrapped_by_principal" => by_principal,
            "wrapped_by_key" => by_key,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub id: PrincipalId,
    pub name: String,
    pub unlock_public_key: [u8; 32],
    pub root_key_id: Option<KeyId>,
}

impl Entity for Principal {
    const TABLE: &'static str = PRINCIPALS;

    fn from_record(r: &Record) -> FSResult<Self> {
        let unlock_public_key = r
            .bytes("unlock_public_key")?
            .try_into()
            .map_err(|_| corrupt(PRINCIPALS, r.id, "public key is not 32 bytes"))?;
        Ok(Principal {
            id: PrincipalId(r.id),
            name: r.text("name")?.to_owned(),
            unlock_public_key,
            root_key_id: r.opt_uint("root_key_id")?.map(KeyId),
        })
    }

    fn to_fields(&self) -> Fields {
        fields! {
            "name" => self.name.as_str(),
            "unlock_public_key" => self.unlock_public_key.to_vec(),
            "root_key_id" => self.root_key_id,
        }
    }
}

/// Level of access a wrapping chain confers. Ordered: `Owner` implies
/// `Write` implies `Read`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    Read,
    Write,
    Owner,
}

impl AccessLevel {
    fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
            AccessLevel::Owner => "owner",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(AccessLevel::Read),
            "write" => Some(AccessLevel::Write),
            "owner" => Some(AccessLevel::Owner),
            _ => None,
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    pub id: GrantId,
    pub node_id: NodeId,
    pub principal_id: PrincipalId,
    pub key_id: KeyId,
    pub level: AccessLevel,
}

impl Entity for Grant {
    const TABLE: &'static str = GRANTS;

    fn from_record(r: &Record) -> FSResult<Self> {
        Ok(Grant {
            id: GrantId(r.id),
            node_id: NodeId(r.uint("node_id")?),
            principal_id: PrincipalId(r.uint("principal_id")?),
            key_id: KeyId(r.uint("key_id")?),
            level: AccessLevel::parse(r.text("level")?)
                .ok_or_else(|| corrupt(GRANTS, r.id, "unknown level"))?,
        })
    }

    fn to_fields(&self) -> Fields {
        fields! {
            "node_id" => self.node_id,
            "principal_id" => self.principal_id,
            "key_id" => self.key_id,
            "level" => self.level.as_str(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSnapshot {
    pub id: SnapshotId,
    pub file_node_id: NodeId,
    pub base_snapshot_id: Option<SnapshotId>,
    pub size: u64,
    pub create_time: DateTime<Utc>,
    pub author_id: PrincipalId,
}

impl Entity for FileSnapshot {
    const TABLE: &'static str = FILE_SNAPSHOTS;

    fn from_record(r: &Record) -> FSResult<Self> {
        Ok(FileSnapshot {
            id: SnapshotId(r.id),
            file_node_id: NodeId(r.uint("file_node_id")?),
            base_snapshot_id: r.opt_uint("base_snapshot_id")?.map(SnapshotId),
            size: r.uint("size")?,
            create_time: time_from(r, FILE_SNAPSHOTS, "create_time")?,
            author_id: PrincipalId(r.uint("author_id")?),
        })
    }

    fn to_fields(&self) -> Fields {
        fields! {
            "file_node_id" => self.file_node_id,
            "base_snapshot_id" => self.base_snapshot_id,
            "size" => self.size,
            "create_time" => time_to_value(self.create_time),
            "author_id" => self.author_id,
        }
    }
}

/// Index row placing one buffer at `sequence_index` of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub id: ChunkId,
    pub snapshot_id: SnapshotId,
    pub sequence_index: u64,
    pub buffer_id: BufferId,
    pub payload_size: u64,
}

impl Entity for Chunk {
    const TABLE: &'static str = CHUNKS;

    fn from_record(r: &Record) -> FSResult<Self> {
        Ok(Chunk {
            id: ChunkId(r.id),
            snapshot_id: SnapshotId(r.uint("snapshot_id")?),
            sequence_index: r.uint("sequence_index")?,
            buffer_id: BufferId(r.uint("buffer_id")?),
            payload_size: r.uint("payload_size")?,
        })
    }

    fn to_fields(&self) -> Fields {
        fields! {
            "snapshot_id" => self.snapshot_id,
            "sequence_index" => self.sequence_index,
            "buffer_id" => self.buffer_id,
            "payload_size" => self.payload_size,
        }
    }
}

/// Encrypted chunk bytes, shared between snapshots by reference count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileBuffer {
    pub id: BufferId,
    pub file_node_id: NodeId,
    pub ref_count: u64,
    pub payload: Vec<u8>,
}

impl Entity for FileBuffer {
    const TABLE: &'static str = FILE_BUFFERS;

    fn from_record(r: &Record) -> FSResult<Self> {
        Ok(FileBuffer {
            id: BufferId(r.id),
            file_node_id: NodeId(r.uint("file_node_id")?),
            ref_count: r.uint("ref_count")?,
            payload: r.bytes("payload")?.to_vec(),
        })
    }

    fn to_fields(&self) -> Fields {
        fields! {
            "file_node_id" => self.file_node_id,
            "ref_count" => self.ref_count,
            "payload" => self.payload.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SchemaVersionRow {
    pub version: i64,
    pub applied_time: DateTime<Utc>,
}

impl Entity for SchemaVersionRow {
    const TABLE: &'static str = SCHEMA_VERSION;

    fn from_record(r: &Record) -> FSResult<Self> {
        Ok(SchemaVersionRow {
            version: r.int("version")?,
            applied_time: time_from(r, SCHEMA_VERSION, "applied_time")?,
        })
    }

    fn to_fields(&self) -> Fields {
        fields! {
            "version" => self.version,
            "applied_time" => time_to_value(self.applied_time),
        }
    }
}

/// Settings fixed when the pool is created. Chunk rows are addressed by
/// `index * chunk_size`, so the chunk size can never change afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PoolLayoutRow {
    pub chunk_size: u32,
}

impl Entity for PoolLayoutRow {
    const TABLE: &'static str = POOL_LAYOUT;

    fn from_record(r: &Record) -> FSResult<Self> {
        let chunk_size = u32::try_from(r.uint("chunk_size")?)
            .map_err(|_| FsError::Corrupt("stored chunk size does not fit u32".into()))?;
        Ok(PoolLayoutRow { chunk_size })
    }

    fn to_fields(&self) -> Fields {
        fields! { "chunk_size" => self.chunk_size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_fields_roundtrip_through_record() {
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let node = Node {
            id: NodeId(9),
            parent_id: Some(NodeId(2)),
            name: "Report.txt".into(),
            name_key: "report.txt".into(),
            kind: NodeKind::File,
            role: NodeRole::Normal,
            owner_id: PrincipalId(1),
            key_id: KeyId(4),
            link_target: None,
            trash_origin_id: None,
            create_time: now,
            update_time: now,
            access_time: now,
            trash_time: None,
        };
        let back = Node::from_record(&Record::new(9, node.to_fields())).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn key_must_have_exactly_one_wrapper() {
        let mut fields = KeyRecord {
            id: KeyId(1),
            kind: KeyKind::Node,
            public_key: None,
            wrapped_secret: vec![1, 2, 3],
            wrapped_by: WrappedBy::Key(KeyId(3)),
        }
        .to_fields();
        fields.insert("wrapped_by_principal".into(), Value::Int(5));
        let err = KeyRecord::from_record(&Record::new(1, fields)).unwrap_err();
        assert!(matches!(err, FsError::Corrupt(_)));
    }
}
