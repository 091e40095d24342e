//! Unlocked principals and per-call context.

use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::crypto::{KeyPair, SymmetricKey};
use crate::schema::{KeyId, Principal, PrincipalId};

/// Plaintext key material, only ever held in memory.
#[derive(Clone, Debug)]
pub enum KeyMaterial {
    Symmetric(SymmetricKey),
    Asymmetric(KeyPair),
}

/// A key that has been unwrapped in this session.
#[derive(Clone, Debug)]
pub struct UnlockedKey {
    pub id: KeyId,
    pub material: KeyMaterial,
}

impl UnlockedKey {
    pub(crate) fn symmetric(id: KeyId, key: SymmetricKey) -> Self {
        Self {
            id,
            material: KeyMaterial::Symmetric(key),
        }
    }

    pub(crate) fn asymmetric(id: KeyId, pair: KeyPair) -> Self {
        Self {
            id,
            material: KeyMaterial::Asymmetric(pair),
        }
    }

    pub fn as_symmetric(&self) -> Option<&SymmetricKey> {
        match &self.material {
            KeyMaterial::Symmetric(k) => Some(k),
            KeyMaterial::Asymmetric(_) => None,
        }
    }
}

/// An unlocked principal.
///
/// Owns the unlock pair and a cache of every key unwrapped on its behalf.
/// The cache is never persisted; [`Session::end`] or dropping the last
/// reference wipes it.
pub struct Session {
    principal: Principal,
    unlock: KeyPair,
    keys: DashMap<KeyId, UnlockedKey>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("principal", &self.principal.name)
            .field("cached_keys", &self.keys.len())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(principal: Principal, unlock: KeyPair) -> Arc<Self> {
        Arc::new(Self {
            principal,
            unlock,
            keys: DashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn principal_id(&self) -> PrincipalId {
        self.principal.id
    }

    pub(crate) fn unlock_pair(&self) -> &KeyPair {
        &self.unlock
    }

    pub(crate) fn cached(&self, id: KeyId) -> Option<UnlockedKey> {
        self.keys.get(&id).map(|k| k.value().clone())
    }

    pub(crate) fn remember(&self, key: &UnlockedKey) {
        self.keys.insert(key.id, key.clone());
    }

    pub(crate) fn forget(&self, id: KeyId) {
        self.keys.remove(&id);
    }

    pub fn cached_key_count(&self) -> usize {
        self.keys.len()
    }

    /// Wipes cached keys and cancels every context derived from the session.
    pub fn end(&self) {
        self.keys.clear();
        self.cancel.cancel();
    }

    pub fn is_ended(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.keys.clear();
        self.cancel.cancel();
    }
}

/// Session plus cancellation token; every externally facing call takes one.
#[derive(Clone, Debug)]
pub struct Ctx {
    session: Arc<Session>,
    cancel: CancellationToken,
}

impl Ctx {
    pub fn new(session: Arc<Session>) -> Self {
        let cancel = session.cancel.child_token();
        Self { session, cancel }
    }

    /// A child context that can be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            session: self.session.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
