// Authoritative lock table.
//
// The replicated store decides whether a lock exists; this table decides who
// holds it and how. It is volatile: a new leader starts with an empty table
// and rebuilds records lazily from the store.

use crate::{storage::ReplicatedStore, ClientId, LockError, LockMode, LockPath, Result};
use dashmap::DashMap;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub path: LockPath,
    pub mode: LockMode,
    pub owners: HashSet<ClientId>,
}

impl Lock {
    pub fn free(path: LockPath) -> Self {
        Self {
            path,
            mode: LockMode::Free,
            owners: HashSet::new(),
        }
    }

    pub fn is_owned_by(&self, client: &ClientId) -> bool {
        self.owners.contains(client)
    }

    pub fn check_invariants(&self) -> std::result::Result<(), LockError> {
        let owners = self.owners.len();
        let detail = match self.mode {
            LockMode::Free if owners > 0 => {
                format!("FREE but owned by {owners} client(s)")
            }
            LockMode::Exclusive if owners == 0 => "EXCLUSIVE despite having no owners".to_string(),
            LockMode::Exclusive if owners > 1 => {
                format!("EXCLUSIVE but owned by {owners} clients")
            }
            LockMode::Shared if owners == 0 => "SHARED despite having no owners".to_string(),
            _ => return Ok(()),
        };
        Err(LockError::Invariant {
            path: self.path.clone(),
            detail,
        })
    }
}

type Slot = Arc<Mutex<Option<Lock>>>;

// A slot left empty when the guard drops is unlinked from the table while
// its mutex is still held, so waiters notice and retry on a fresh slot.
struct SlotGuard<'a> {
    slots: &'a DashMap<LockPath, Slot>,
    path: LockPath,
    slot: Slot,
    record: OwnedMutexGuard<Option<Lock>>,
}

impl Deref for SlotGuard<'_> {
    type Target = Option<Lock>;

    fn deref(&self) -> &Self::Target {
        &self.record
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.record
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.record.is_none() {
            self.slots
                .remove_if(&self.path, |_, slot| Arc::ptr_eq(slot, &self.slot));
        }
    }
}

// Operations on one path are serialized by that path's slot mutex;
// different paths never contend beyond a DashMap shard lookup.
#[derive(Debug)]
pub struct LockManager {
    store: Arc<dyn ReplicatedStore>,
    slots: DashMap<LockPath, Slot>,
}

impl LockManager {
    pub fn new(store: Arc<dyn ReplicatedStore>) -> Self {
        Self {
            store,
            slots: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ReplicatedStore> {
        &self.store
    }

    async fn lock_slot(&self, path: &LockPath) -> SlotGuard<'_> {
        loop {
            let slot: Slot = self.slots.entry(path.clone()).or_default().clone();
            let record = Arc::clone(&slot).lock_owned().await;
            let current = self
                .slots
                .get(path)
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &slot));
            if current {
                return SlotGuard {
                    slots: &self.slots,
                    path: path.clone(),
                    slot,
                    record,
                };
            }
        }
    }

    async fn exists(&self, path: &LockPath) -> Result<bool> {
        Ok(self.store.get(path.as_str()).await?.is_some())
    }

    pub async fn open_lock(&self, path: &LockPath) -> Result<()> {
        let mut record = self.lock_slot(path).await;
        if !self.exists(path).await? {
            self.store.set(path.as_str(), Vec::new()).await?;
            *record = Some(Lock::free(path.clone()));
            info!(%path, "opened lock");
        }
        Ok(())
    }

    pub async fn try_acquire_lock(
        &self,
        client: &ClientId,
        path: &LockPath,
        mode: LockMode,
    ) -> Result<bool> {
        if !mode.is_requestable() {
            return Err(LockError::InvalidMode { mode }.into());
        }

        let mut record = self.lock_slot(path).await;
        if !self.exists(path).await? {
            return Err(LockError::NotOpened { path: path.clone() }.into());
        }

        let lock = record.get_or_insert_with(|| {
            warn!(%path, %client, "lock record missing from memory, recreating as FREE");
            Lock::free(path.clone())
        });
        lock.check_invariants()?;

        if lock.is_owned_by(client) {
            return Err(LockError::AlreadyOwned {
                client: client.clone(),
                path: path.clone(),
            }
            .into());
        }

        let acquired = match (lock.mode, mode) {
            (LockMode::Free, _) => {
                lock.mode = mode;
                lock.owners.insert(client.clone());
                true
            }
            (LockMode::Shared, LockMode::Shared) => {
                lock.owners.insert(client.clone());
                true
            }
            (held, _) => {
                debug!(%path, %client, %held, requested = %mode, "lock busy");
                false
            }
        };
        Ok(acquired)
    }

    pub async fn release_lock(&self, client: &ClientId, path: &LockPath) -> Result<()> {
        let mut record = self.lock_slot(path).await;
        if !self.exists(path).await? {
            return Err(LockError::NotOpened { path: path.clone() }.into());
        }

        let not_owned = || LockError::NotOwned {
            client: client.clone(),
            path: path.clone(),
        };
        let Some(lock) = record.as_mut() else {
            return Err(not_owned().into());
        };
        lock.check_invariants()?;

        if lock.mode == LockMode::Free {
            return Err(LockError::Invariant {
                path: path.clone(),
                detail: format!("release by {client} reached a FREE lock"),
            }
            .into());
        }
        if !lock.owners.remove(client) {
            return Err(not_owned().into());
        }
        if lock.owners.is_empty() {
            lock.mode = LockMode::Free;
        }
        debug!(%path, %client, mode = %lock.mode, "released lock");
        Ok(())
    }

    pub async fn delete_lock(&self, client: &ClientId, path: &LockPath) -> Result<()> {
        let mut record = self.lock_slot(path).await;
        let lock = match record.as_ref() {
            Some(lock) if lock.is_owned_by(client) => lock,
            _ => {
                return Err(LockError::NotOwned {
                    client: client.clone(),
                    path: path.clone(),
                }
                .into())
            }
        };
        if lock.mode != LockMode::Exclusive {
            return Err(LockError::NotExclusive {
                client: client.clone(),
                path: path.clone(),
            }
            .into());
        }
        if !self.exists(path).await? {
            return Err(LockError::NotOpened { path: path.clone() }.into());
        }

        self.store.delete(path.as_str()).await?;
        *record = None;
        info!(%path, %client, "deleted lock");
        Ok(())
    }

    pub async fn lock(&self, path: &LockPath) -> Option<Lock> {
        let slot = self.slots.get(path).map(|entry| Arc::clone(entry.value()))?;
        let record = slot.lock().await;
        record.clone()
    }

    pub async fn snapshot(&self) -> Vec<Lock> {
        let slots: Vec<Slot> = self
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut locks = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(lock) = slot.lock().await.clone() {
                locks.push(lock);
            }
        }
        locks
    }

    #[cfg(test)]
    async fn install(&self, lock: Lock) {
        let path = lock.path.clone();
        let mut record = self.lock_slot(&path).await;
        *record = Some(lock);
    }
}
