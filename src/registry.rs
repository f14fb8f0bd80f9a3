//! Volume Registry (C6).
//!
//! In-memory mapping from handle -> Volume record; serializes structural
//! operations per-volume; enforces handle uniqueness. Backed by the
//! persisted catalog (SPEC_FULL.md §A.4) the same way the teacher's
//! `BoxManager` is backed by `BoxStore`: database-first writes, then cache.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::catalog::Catalog;
use crate::errors::{VolmanError, VolmanResult};
use crate::model::{Flavor, Handle, Status, Volume};

/// A registered volume plus the per-handle lock that serializes structural
/// mutations on it while allowing concurrent reads (spec §4.6).
struct Registered {
    volume: Volume,
    /// Acquired for the duration of any operation that mutates this
    /// volume's structure (convert, stream-in, destroy). Readers take a
    /// shared lock; writers take an exclusive one.
    lock: Arc<RwLock<()>>,
}

pub struct VolumeRegistry {
    catalog: Catalog,
    entries: RwLock<HashMap<Handle, Registered>>,
}

impl VolumeRegistry {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Load the registry's in-memory cache from the persisted catalog.
    /// Used at startup to reconstruct handle -> path mappings.
    pub async fn recover(&self) -> VolmanResult<()> {
        let volumes = self.catalog.list_all()?;
        let mut entries = self.entries.write().await;
        for volume in volumes {
            tracing::debug!(handle = %volume.handle, "Recovered volume from catalog");
            entries.insert(
                volume.handle.clone(),
                Registered {
                    volume,
                    lock: Arc::new(RwLock::new(())),
                },
            );
        }
        Ok(())
    }

    /// Insert a freshly created volume. Fails if the handle already exists.
    pub async fn insert(&self, volume: Volume) -> VolmanResult<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&volume.handle) {
            return Err(VolmanError::HandleExists(volume.handle.clone()));
        }

        // Database-first: persist before caching.
        self.catalog.insert(&volume)?;

        tracing::debug!(handle = %volume.handle, "Registered volume");
        entries.insert(
            volume.handle.clone(),
            Registered {
                volume,
                lock: Arc::new(RwLock::new(())),
            },
        );
        Ok(())
    }

    /// Look up a volume's current record. Returns `None` if not found.
    pub async fn get(&self, handle: &str) -> Option<Volume> {
        let entries = self.entries.read().await;
        entries.get(handle).map(|r| r.volume.clone())
    }

    pub async fn list(&self) -> Vec<Volume> {
        let entries = self.entries.read().await;
        entries.values().map(|r| r.volume.clone()).collect()
    }

    /// Acquire the per-handle write lock for the duration of a structural
    /// mutation (convert, stream-in, destroy). Returns the lock's guard
    /// together with a snapshot of the volume so the caller can perform
    /// filesystem work without holding the registry's top-level lock.
    pub async fn begin_mutation(&self, handle: &str) -> VolmanResult<MutationGuard> {
        let per_handle_lock = {
            let entries = self.entries.read().await;
            entries
                .get(handle)
                .map(|r| Arc::clone(&r.lock))
                .ok_or_else(|| VolmanError::NotFound(handle.to_string()))?
        };

        // Own the guard for the duration of the operation; callers drop it
        // when the filesystem work (and any registry update) is complete.
        let owned_guard = per_handle_lock.write_owned().await;

        let volume = self
            .get(handle)
            .await
            .ok_or_else(|| VolmanError::NotFound(handle.to_string()))?;

        if volume.is_poisoned() {
            return Err(VolmanError::PoisonedVolume(handle.to_string()));
        }

        Ok(MutationGuard {
            _guard: GuardKind::Write(owned_guard),
            volume,
        })
    }

    /// Acquire the per-handle read lock, allowing concurrent reads but
    /// blocking while a mutation is in progress (spec §4.6).
    pub async fn begin_read(&self, handle: &str) -> VolmanResult<MutationGuard> {
        let per_handle_lock = {
            let entries = self.entries.read().await;
            entries
                .get(handle)
                .map(|r| Arc::clone(&r.lock))
                .ok_or_else(|| VolmanError::NotFound(handle.to_string()))?
        };

        let owned_guard = per_handle_lock.read_owned().await;

        let volume = self
            .get(handle)
            .await
            .ok_or_else(|| VolmanError::NotFound(handle.to_string()))?;

        Ok(MutationGuard {
            _guard: GuardKind::Read(owned_guard),
            volume,
        })
    }

    pub async fn update_flavor(&self, handle: &str, flavor: Flavor) -> VolmanResult<()> {
        self.catalog.update_flavor(handle, flavor)?;
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(handle) {
            entry.volume.flavor = flavor;
        }
        Ok(())
    }

    pub async fn mark_poisoned(&self, handle: &str) -> VolmanResult<()> {
        tracing::warn!(handle = %handle, "Marking volume poisoned after partial failure");
        self.catalog.update_status(handle, Status::Poisoned)?;
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(handle) {
            entry.volume.status = Status::Poisoned;
        }
        Ok(())
    }

    /// Remove a volume. Rejected while any COW child still references it.
    ///
    /// Takes the per-handle write lock first, same as `begin_mutation`, so a
    /// destroy can't tear down storage a concurrent convert or stream-in is
    /// still writing into (spec §4.6/§5) — unlike `begin_mutation`, a
    /// poisoned volume is not rejected, since destroy is the one operation a
    /// poisoned volume must still accept. The lock is returned embedded in
    /// the guard so the caller can hold it for the duration of the actual
    /// filesystem teardown, not just the registry update.
    pub async fn remove(&self, handle: &str) -> VolmanResult<DestroyGuard> {
        let per_handle_lock = {
            let entries = self.entries.read().await;
            entries
                .get(handle)
                .map(|r| Arc::clone(&r.lock))
                .ok_or_else(|| VolmanError::NotFound(handle.to_string()))?
        };
        let owned_guard = per_handle_lock.write_owned().await;

        let mut entries = self.entries.write().await;

        if !entries.contains_key(handle) {
            return Err(VolmanError::NotFound(handle.to_string()));
        }

        let has_children = entries
            .values()
            .any(|r| r.volume.parent.as_deref() == Some(handle));
        if has_children {
            return Err(VolmanError::HasChildren(handle.to_string()));
        }

        self.catalog.delete(handle)?;

        tracing::debug!(handle = %handle, "Removing volume from registry");
        let volume = entries.remove(handle).expect("checked above").volume;

        Ok(DestroyGuard {
            _guard: owned_guard,
            volume,
        })
    }
}

enum GuardKind {
    Write(tokio::sync::OwnedRwLockWriteGuard<()>),
    Read(tokio::sync::OwnedRwLockReadGuard<()>),
}

/// RAII handle held for the duration of an operation on a single volume.
/// Carries a snapshot of the volume taken under the per-handle lock.
pub struct MutationGuard {
    _guard: GuardKind,
    pub volume: Volume,
}

/// RAII handle held for the duration of a destroy. Distinct from
/// `MutationGuard` because the volume it wraps has already been removed
/// from the registry by the time the caller is done with it.
pub struct DestroyGuard {
    _guard: tokio::sync::OwnedRwLockWriteGuard<()>,
    pub volume: Volume,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Volume;

    fn test_registry() -> VolumeRegistry {
        VolumeRegistry::new(Catalog::in_memory().unwrap())
    }

    #[tokio::test]
    async fn insert_then_get() {
        let registry = test_registry();
        let vol = Volume::new_empty("h1".into(), "/tmp/h1".into(), Flavor::Privileged);
        registry.insert(vol).await.unwrap();

        let got = registry.get("h1").await.unwrap();
        assert_eq!(got.handle, "h1");
    }

    #[tokio::test]
    async fn duplicate_handle_is_rejected() {
        let registry = test_registry();
        let vol = Volume::new_empty("h1".into(), "/tmp/h1".into(), Flavor::Privileged);
        registry.insert(vol.clone()).await.unwrap();

        let err = registry.insert(vol).await.unwrap_err();
        assert!(matches!(err, VolmanError::HandleExists(_)));
    }

    #[tokio::test]
    async fn destroy_rejected_while_children_exist() {
        let registry = test_registry();
        let parent = Volume::new_empty("parent".into(), "/tmp/parent".into(), Flavor::Privileged);
        registry.insert(parent).await.unwrap();

        let child = Volume::new_cow(
            "child".into(),
            "/tmp/child".into(),
            Flavor::Privileged,
            "parent".into(),
        );
        registry.insert(child).await.unwrap();

        let err = registry.remove("parent").await.unwrap_err();
        assert!(matches!(err, VolmanError::HasChildren(_)));

        registry.remove("child").await.unwrap();
        registry.remove("parent").await.unwrap();
    }

    #[tokio::test]
    async fn poisoned_volume_rejects_further_mutation() {
        let registry = test_registry();
        let vol = Volume::new_empty("h1".into(), "/tmp/h1".into(), Flavor::Privileged);
        registry.insert(vol).await.unwrap();
        registry.mark_poisoned("h1").await.unwrap();

        let err = registry.begin_mutation("h1").await.unwrap_err();
        assert!(matches!(err, VolmanError::PoisonedVolume(_)));
    }

    #[tokio::test]
    async fn lookup_of_missing_handle_is_none() {
        let registry = test_registry();
        assert!(registry.get("nope").await.is_none());
    }
}
