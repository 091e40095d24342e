//! Key wrapping chain.
//!
//! Every node key is stored encrypted under exactly one other key: its
//! parent folder's key, or (for a principal's root and trash folders) the
//! principal's root key, which in turn is sealed to the principal's unlock
//! key. Grants add a second, independent path: a copy of a node key sealed
//! to the grantee's root key.

use nimbus_core::{Filter, Query, fields};
use std::sync::Arc;
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::FSResult;
use crate::crypto::{self, KeyPair, SymmetricKey};
use crate::error::FsError;
use crate::pool::Pool;
use crate::schema::{
    AccessLevel, Grant, GrantId, KEYS, KeyId, KeyKind, KeyRecord, Node, NodeId, NodeRole,
    Principal, WrappedBy,
};
use crate::session::{Ctx, KeyMaterial, Session, UnlockedKey};
use crate::txqueue::Txn;

/// What a new or re-wrapped key is encrypted under.
pub(crate) enum Wrapper<'a> {
    /// Sealed to an X25519 public key: a principal's unlock key or a root key.
    Sealed { by: WrappedBy, public: PublicKey },
    /// Encrypted under an unlocked symmetric key.
    Symmetric(&'a UnlockedKey),
}

impl Wrapper<'_> {
    fn wrapped_by(&self) -> WrappedBy {
        match self {
            Wrapper::Sealed { by, .. } => *by,
            Wrapper::Symmetric(key) => WrappedBy::Key(key.id),
        }
    }

    /// Wrapper for keys placed under `parent`, whichever kind it is.
    pub(crate) fn under(parent: &'_ UnlockedKey) -> Wrapper<'_> {
        match &parent.material {
            KeyMaterial::Symmetric(_) => Wrapper::Symmetric(parent),
            KeyMaterial::Asymmetric(pair) => Wrapper::Sealed {
                by: WrappedBy::Key(parent.id),
                public: pair.public,
            },
        }
    }
}

fn wrap_aad(kind: KeyKind, by: WrappedBy) -> Vec<u8> {
    let by = match by {
        WrappedBy::Principal(p) => format!("principal:{p}"),
        WrappedBy::Key(k) => format!("key:{k}"),
    };
    format!("nimbus/key/{kind:?}/{by}").into_bytes()
}

fn wrap_secret(wrapper: &Wrapper<'_>, kind: KeyKind, secret: &[u8]) -> FSResult<Vec<u8>> {
    let aad = wrap_aad(kind, wrapper.wrapped_by());
    let wrapped = match wrapper {
        Wrapper::Sealed { public, .. } => crypto::seal(public, secret, &aad)?,
        Wrapper::Symmetric(parent) => match &parent.material {
            KeyMaterial::Symmetric(k) => crypto::encrypt(k, secret, &aad)?,
            KeyMaterial::Asymmetric(pair) => crypto::seal(&pair.public, secret, &aad)?,
        },
    };
    Ok(wrapped)
}

fn material_from(kind: KeyKind, plain: &[u8]) -> FSResult<KeyMaterial> {
    Ok(match kind {
        KeyKind::Root => KeyMaterial::Asymmetric(KeyPair::from_secret_bytes(plain)?),
        KeyKind::Node | KeyKind::Grant => KeyMaterial::Symmetric(SymmetricKey::from_slice(plain)?),
    })
}

fn secret_bytes(key: &UnlockedKey) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(match &key.material {
        KeyMaterial::Symmetric(k) => k.as_bytes().to_vec(),
        KeyMaterial::Asymmetric(pair) => pair.secret.to_bytes().to_vec(),
    })
}

/// Decrypts `key` with its direct wrapping parent `ancestor`.
///
/// Fails with an integrity violation if `key` names a different parent or
/// does not authenticate.
pub fn unwrap(ancestor: &UnlockedKey, key: &KeyRecord) -> FSResult<UnlockedKey> {
    if key.wrapped_by != WrappedBy::Key(ancestor.id) {
        return Err(FsError::WrongWrappingKey {
            key: key.id.0,
            offered: ancestor.id.0,
        });
    }
    let aad = wrap_aad(key.kind, key.wrapped_by);
    let plain = Zeroizing::new(match &ancestor.material {
        KeyMaterial::Symmetric(k) => crypto::decrypt(k, &key.wrapped_secret, &aad)?,
        KeyMaterial::Asymmetric(pair) => crypto::open_sealed(pair, &key.wrapped_secret, &aad)?,
    });
    Ok(UnlockedKey {
        id: key.id,
        material: material_from(key.kind, &plain)?,
    })
}

fn unwrap_with_principal(session: &Session, key: &KeyRecord) -> FSResult<UnlockedKey> {
    if key.wrapped_by != WrappedBy::Principal(session.principal_id()) {
        return Err(FsError::AccessDenied(format!(
            "key {} is not sealed to principal {}",
            key.id,
            session.principal().name
        )));
    }
    let aad = wrap_aad(key.kind, key.wrapped_by);
    let plain = Zeroizing::new(crypto::open_sealed(
        session.unlock_pair(),
        &key.wrapped_secret,
        &aad,
    )?);
    Ok(UnlockedKey {
        id: key.id,
        material: material_from(key.kind, &plain)?,
    })
}

pub(crate) async fn load_key(txn: &Txn, id: KeyId) -> FSResult<KeyRecord> {
    txn.get::<KeyRecord>(id.0)
        .await?
        .ok_or_else(|| FsError::Corrupt(format!("key {id} is missing")))
}

pub(crate) async fn load_node(txn: &Txn, id: NodeId) -> FSResult<Node> {
    txn.get::<Node>(id.0)
        .await?
        .ok_or_else(|| FsError::NoSuchFileOrFolder(format!("node {id}")))
}

async fn insert_key(
    txn: &Txn,
    kind: KeyKind,
    public_key: Option<[u8; 32]>,
    wrapper: &Wrapper<'_>,
    secret: &[u8],
) -> FSResult<KeyId> {
    let mut record = KeyRecord {
        id: KeyId(0),
        kind,
        public_key,
        wrapped_secret: wrap_secret(wrapper, kind, secret)?,
        wrapped_by: wrapper.wrapped_by(),
    };
    record.id = KeyId(txn.insert(&record).await?);
    Ok(record.id)
}

/// Mints an X25519 root key for `principal`, sealed to its unlock key.
pub(crate) async fn create_root_key(txn: &Txn, principal: &Principal) -> FSResult<UnlockedKey> {
    let pair = KeyPair::generate();
    let wrapper = Wrapper::Sealed {
        by: WrappedBy::Principal(principal.id),
        public: PublicKey::from(principal.unlock_public_key),
    };
    let secret = Zeroizing::new(pair.secret.to_bytes());
    let id = insert_key(
        txn,
        KeyKind::Root,
        Some(*pair.public.as_bytes()),
        &wrapper,
        secret.as_slice(),
    )
    .await?;
    Ok(UnlockedKey::asymmetric(id, pair))
}

/// Mints a fresh node key wrapped under `parent`.
pub(crate) async fn create_node_key(txn: &Txn, parent: &UnlockedKey) -> FSResult<UnlockedKey> {
    let key = SymmetricKey::generate();
    let id = insert_key(
        txn,
        KeyKind::Node,
        None,
        &Wrapper::under(parent),
        key.as_bytes(),
    )
    .await?;
    Ok(UnlockedKey::symmetric(id, key))
}

/// Re-encrypts an unlocked key under a new parent, keeping its row id.
pub(crate) async fn rewrap(txn: &Txn, key: &UnlockedKey, new_parent: &UnlockedKey) -> FSResult<()> {
    let record = load_key(txn, key.id).await?;
    let wrapper = Wrapper::under(new_parent);
    let secret = secret_bytes(key);
    let wrapped = wrap_secret(&wrapper, record.kind, &secret)?;
    let (by_principal, by_key) = match wrapper.wrapped_by() {
        WrappedBy::Principal(p) => (Some(p), None),
        WrappedBy::Key(k) => (None, Some(k)),
    };
    txn.update(
        KEYS,
        key.id.0,
        fields! {
            "wrapped_secret" => wrapped,
            "wrapped_by_principal" => by_principal,
            "wrapped_by_key" => by_key,
        },
    )
    .await
}

/// The session principal's root key.
pub(crate) async fn unlock_principal_root(txn: &Txn, session: &Session) -> FSResult<UnlockedKey> {
    let principal = txn
        .get::<Principal>(session.principal_id().0)
        .await?
        .ok_or_else(|| FsError::AccessDenied("principal no longer exists".into()))?;
    let root_key_id = principal
        .root_key_id
        .ok_or_else(|| FsError::Corrupt(format!("principal {} has no root key", principal.id)))?;
    if let Some(key) = session.cached(root_key_id) {
        return Ok(key);
    }
    let record = load_key(txn, root_key_id).await?;
    let key = unwrap_with_principal(session, &record)?;
    session.remember(&key);
    Ok(key)
}

async fn unlock_cached(
    txn: &Txn,
    session: &Session,
    parent: &UnlockedKey,
    id: KeyId,
) -> FSResult<UnlockedKey> {
    if let Some(key) = session.cached(id) {
        return Ok(key);
    }
    let record = load_key(txn, id).await?;
    let key = unwrap(parent, &record)?;
    session.remember(&key);
    Ok(key)
}

/// How a resolved chain reached the session's principal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Anchor {
    /// One of the principal's own root or trash folders.
    Root(NodeId),
    Grant(GrantId),
}

/// Outcome of walking a node's wrapping chain.
#[derive(Clone, Debug)]
pub struct ResolvedKey {
    pub node: Node,
    pub key: UnlockedKey,
    pub level: AccessLevel,
    pub anchor: Anchor,
    /// The chain ends at the principal's trash folder.
    pub in_trash: bool,
}

impl ResolvedKey {
    pub(crate) fn require(&self, level: AccessLevel) -> FSResult<()> {
        if self.level >= level {
            Ok(())
        } else {
            Err(FsError::AccessDenied(format!(
                "'{}' is shared with {} access, {} needed",
                self.node.name, self.level, level
            )))
        }
    }

    pub(crate) fn symmetric(&self) -> FSResult<&SymmetricKey> {
        self.key
            .as_symmetric()
            .ok_or_else(|| FsError::Corrupt(format!("node {} has an asymmetric key", self.node.id)))
    }
}

/// Walks up from `target` to the first node the session principal can
/// enter (an owned root, or a node granted to it), then unwraps keys back
/// down to `target`.
pub(crate) async fn resolve_chain(
    txn: &Txn,
    session: &Session,
    target: NodeId,
) -> FSResult<ResolvedKey> {
    let principal = session.principal_id();
    let node = load_node(txn, target).await?;

    let mut path: Vec<Node> = Vec::new();
    let mut current = node.clone();
    let (mut key, level, anchor, in_trash) = loop {
        if let Some(grant) = txn
            .first::<Grant>(
                Filter::eq("node_id", current.id).and(Filter::eq("principal_id", principal)),
            )
            .await?
        {
            let key = match session.cached(current.key_id) {
                Some(key) => key,
                None => {
                    let root = unlock_principal_root(txn, session).await?;
                    let record = load_key(txn, grant.key_id).await?;
                    let granted = unwrap(&root, &record)?;
                    // A grant key carries a copy of the node key; cache it
                    // under the node key's id.
                    let key = UnlockedKey {
                        id: current.key_id,
                        material: granted.material,
                    };
                    session.remember(&key);
                    key
                }
            };
            break (key, grant.level, Anchor::Grant(grant.id), false);
        }

        if matches!(current.role, NodeRole::Root | NodeRole::TrashRoot) {
            if current.owner_id != principal {
                return Err(FsError::AccessDenied(format!(
                    "'{}' is not shared with {}",
                    node.name,
                    session.principal().name
                )));
            }
            let root = unlock_principal_root(txn, session).await?;
            let key = unlock_cached(txn, session, &root, current.key_id).await?;
            let in_trash = current.role == NodeRole::TrashRoot;
            break (key, AccessLevel::Owner, Anchor::Root(current.id), in_trash);
        }

        let Some(parent_id) = current.parent_id else {
            return Err(FsError::AccessDenied(format!(
                "no key path reaches '{}'",
                node.name
            )));
        };
        let parent = load_node(txn, parent_id).await?;
        path.push(std::mem::replace(&mut current, parent));
    };

    for below in path.iter().rev() {
        key = unlock_cached(txn, session, &key, below.key_id).await?;
    }

    Ok(ResolvedKey {
        node,
        key,
        level,
        anchor,
        in_trash,
    })
}

/// Seals `node_key` to `to`'s root key and records the grant, replacing
/// any earlier grant of the same node to the same principal.
pub(crate) async fn grant_access(
    txn: &Txn,
    node_key: &UnlockedKey,
    node: &Node,
    to: &Principal,
    level: AccessLevel,
) -> FSResult<Grant> {
    if level == AccessLevel::Owner {
        return Err(FsError::AccessDenied("owner access cannot be granted".into()));
    }
    let root_key_id = to
        .root_key_id
        .ok_or_else(|| FsError::Corrupt(format!("principal {} has no root key", to.id)))?;
    let root = load_key(txn, root_key_id).await?;
    let public = root
        .public_key
        .map(PublicKey::from)
        .ok_or_else(|| FsError::Corrupt(format!("root key {root_key_id} has no public half")))?;

    revoke_access(txn, node.id, to.id).await?;

    let wrapper = Wrapper::Sealed {
        by: WrappedBy::Key(root_key_id),
        public,
    };
    let secret = secret_bytes(node_key);
    let key_id = insert_key(txn, KeyKind::Grant, None, &wrapper, &secret).await?;
    let mut grant = Grant {
        id: GrantId(0),
        node_id: node.id,
        principal_id: to.id,
        key_id,
        level,
    };
    grant.id = GrantId(txn.insert(&grant).await?);
    Ok(grant)
}

/// Deletes the grant of `node` to `principal` and its key. Returns whether
/// one existed.
pub(crate) async fn revoke_access(
    txn: &Txn,
    node: NodeId,
    principal: crate::schema::PrincipalId,
) -> FSResult<bool> {
    let grants: Vec<Grant> = txn
        .select(Query::new(
            Filter::eq("node_id", node).and(Filter::eq("principal_id", principal)),
        ))
        .await?;
    for grant in &grants {
        txn.delete(KEYS, Filter::Id(grant.key_id.0)).await?;
        txn.delete(crate::schema::GRANTS, Filter::Id(grant.id.0))
            .await?;
    }
    Ok(!grants.is_empty())
}

async fn principal_by_name(txn: &Txn, name: &str) -> FSResult<Principal> {
    txn.first::<Principal>(Filter::eq("name", name))
        .await?
        .ok_or_else(|| FsError::NoSuchFileOrFolder(format!("principal '{name}'")))
}

/// Key operations of a pool, bound to a caller's [`Ctx`].
pub struct KeyVault<'a> {
    pool: &'a Pool,
}

impl<'a> KeyVault<'a> {
    pub(crate) fn new(pool: &'a Pool) -> Self {
        Self { pool }
    }

    /// Resolves the key of `node` for the context's principal.
    pub async fn resolve_chain(&self, ctx: &Ctx, node: NodeId) -> FSResult<ResolvedKey> {
        let session = ctx.session().clone();
        self.pool
            .run(ctx, move |txn| async move {
                resolve_chain(&txn, &session, node).await
            })
            .await
    }

    /// Shares `node` with the principal named `to`.
    pub async fn grant_access(
        &self,
        ctx: &Ctx,
        node: NodeId,
        to: &str,
        level: AccessLevel,
    ) -> FSResult<Grant> {
        let session = ctx.session().clone();
        let to = to.to_owned();
        self.pool
            .run(ctx, move |txn| async move {
                let resolved = resolve_chain(&txn, &session, node).await?;
                resolved.require(level.max(AccessLevel::Write))?;
                let grantee = principal_by_name(&txn, &to).await?;
                let grant = grant_access(&txn, &resolved.key, &resolved.node, &grantee, level)
                    .await?;
                tracing::debug!(node = %node, grantee = %to, %level, "access granted");
                Ok(grant)
            })
            .await
    }

    /// Withdraws a grant. The grantee's cached keys live in the grantee's
    /// own session and lapse when it ends.
    pub async fn revoke_access(&self, ctx: &Ctx, node: NodeId, from: &str) -> FSResult<bool> {
        let session = ctx.session().clone();
        let from = from.to_owned();
        self.pool
            .run(ctx, move |txn| async move {
                let resolved = resolve_chain(&txn, &session, node).await?;
                resolved.require(AccessLevel::Write)?;
                let grantee = principal_by_name(&txn, &from).await?;
                revoke_access(&txn, node, grantee.id).await
            })
            .await
    }

    /// Nodes other principals have shared with the context's principal.
    pub async fn shared_with_me(&self, ctx: &Ctx) -> FSResult<Vec<(Grant, Node)>> {
        let session: Arc<Session> = ctx.session().clone();
        self.pool
            .run(ctx, move |txn| async move {
                let grants: Vec<Grant> = txn
                    .select(Query::new(Filter::eq("principal_id", session.principal_id())))
                    .await?;
                let mut out = Vec::with_capacity(grants.len());
                for grant in grants {
                    if let Some(node) = txn.get::<Node>(grant.node_id.0).await? {
                        out.push((grant, node));
                    }
                }
                Ok(out)
            })
            .await
    }
}
