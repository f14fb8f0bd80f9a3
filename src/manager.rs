//! Volume Manager façade (C8).
//!
//! Orchestrates the Registry, Backend, Namespacer and Stream Codec behind
//! an async API. The filesystem-heavy core beneath it (walker, namespacer,
//! naive-copy backend, stream codec) is synchronous; each public method
//! offloads that work to a blocking thread via `tokio::task::spawn_blocking`,
//! the same split the teacher uses around its own disk-format work in
//! `container_rootfs.rs`.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::backend::VolumeBackend;
use crate::concurrency::CancelToken;
use crate::errors::{VolmanError, VolmanResult};
use crate::identity::IdentityOracle;
use crate::model::{Flavor, Handle, Volume};
use crate::namespace;
use crate::registry::VolumeRegistry;
use crate::stream;
use crate::translate::Direction;
use crate::walk;

/// How a freshly created volume should be provisioned.
pub enum CreateStrategy {
    Empty,
    Cow { parent: Handle },
}

/// Façade over the Registry, Backend, Namespacer and Stream Codec.
pub struct VolumeManager {
    registry: VolumeRegistry,
    backend: Arc<dyn VolumeBackend>,
    oracle: IdentityOracle,
}

impl VolumeManager {
    pub fn new(registry: VolumeRegistry, backend: Arc<dyn VolumeBackend>, oracle: IdentityOracle) -> Self {
        Self {
            registry,
            backend,
            oracle,
        }
    }

    /// Reload the in-memory registry from its persisted catalog. Call once
    /// at startup before serving requests.
    pub async fn recover(&self) -> VolmanResult<()> {
        self.registry.recover().await
    }

    pub async fn lookup(&self, handle: &str) -> VolmanResult<Volume> {
        self.registry
            .get(handle)
            .await
            .ok_or_else(|| VolmanError::NotFound(handle.to_string()))
    }

    pub async fn list(&self) -> Vec<Volume> {
        self.registry.list().await
    }

    /// Generate a fresh, printable handle. Exposed so callers that don't
    /// care about naming can omit one when creating a volume.
    pub fn new_handle() -> Handle {
        Uuid::new_v4().to_string()
    }

    /// `CreateVolume(handle, Empty | COW(parent), flavor)` (spec §4.8).
    pub async fn create_volume(
        &self,
        handle: Handle,
        strategy: CreateStrategy,
        flavor: Flavor,
    ) -> VolmanResult<Volume> {
        match strategy {
            CreateStrategy::Empty => self.create_empty(handle, flavor).await,
            CreateStrategy::Cow { parent } => self.create_cow(handle, parent, flavor).await,
        }
    }

    async fn create_empty(&self, handle: Handle, flavor: Flavor) -> VolmanResult<Volume> {
        tracing::info!(handle = %handle, flavor = ?flavor, "Creating empty volume");

        let backend = Arc::clone(&self.backend);
        let path = tokio::task::spawn_blocking(move || backend.create_empty())
            .await
            .map_err(|e| VolmanError::Internal(format!("create_empty task panicked: {e}")))??;

        let volume = Volume::new_empty(handle, path, flavor);
        self.registry.insert(volume.clone()).await?;
        Ok(volume)
    }

    async fn create_cow(&self, handle: Handle, parent: Handle, flavor: Flavor) -> VolmanResult<Volume> {
        tracing::info!(handle = %handle, parent = %parent, flavor = ?flavor, "Creating COW volume");

        // Hold the parent's lock only long enough to snapshot it, then
        // release it before doing any of the child's (possibly slow)
        // filesystem work — lock order is (parent, child) to avoid deadlock
        // with any concurrent operation on the same pair (spec §5).
        let parent_guard = self.registry.begin_read(&parent).await.map_err(|e| match e {
            VolmanError::NotFound(h) => VolmanError::ParentMissing(h),
            other => other,
        })?;
        let parent_volume = parent_guard.volume.clone();
        drop(parent_guard);

        if parent_volume.is_poisoned() {
            return Err(VolmanError::PoisonedParent(parent));
        }

        let backend = Arc::clone(&self.backend);
        let parent_path = parent_volume.path.clone();
        let child_path = tokio::task::spawn_blocking(move || backend.create_cow(&parent_path))
            .await
            .map_err(|e| VolmanError::Internal(format!("create_cow task panicked: {e}")))??;

        let volume = Volume::new_cow(handle.clone(), child_path.clone(), flavor, parent.clone());
        self.registry.insert(volume.clone()).await?;

        if parent_volume.flavor != flavor {
            let direction = match (parent_volume.flavor, flavor) {
                (Flavor::Privileged, Flavor::Unprivileged) => Direction::ToNamespace,
                (Flavor::Unprivileged, Flavor::Privileged) => Direction::ToHost,
                _ => unreachable!("flavors already checked unequal"),
            };

            if let Err(e) = self.retag_handle(&handle, direction, None).await {
                self.registry.mark_poisoned(&handle).await?;
                return Err(e);
            }
        }

        Ok(self.registry.get(&handle).await.expect("just inserted"))
    }

    /// `SetFlavor(handle, new_flavor)` (spec §4.8).
    pub async fn set_flavor(&self, handle: &str, new_flavor: Flavor, cancel: Option<CancelToken>) -> VolmanResult<()> {
        let guard = self.registry.begin_mutation(handle).await?;
        let volume = guard.volume.clone();

        if volume.flavor == new_flavor {
            return Ok(());
        }

        let direction = match (volume.flavor, new_flavor) {
            (Flavor::Privileged, Flavor::Unprivileged) => Direction::ToNamespace,
            (Flavor::Unprivileged, Flavor::Privileged) => Direction::ToHost,
            _ => unreachable!("flavors already checked unequal"),
        };

        tracing::info!(handle = %handle, from = ?volume.flavor, to = ?new_flavor, "Converting volume flavor");

        let path = volume.path.clone();
        let oracle = self.oracle;
        let result = tokio::task::spawn_blocking(move || {
            namespace::retag(&path, &oracle, direction, cancel.as_ref())
        })
        .await
        .map_err(|e| VolmanError::Internal(format!("retag task panicked: {e}")))?;

        drop(guard);

        match result {
            Ok(()) => {
                self.registry.update_flavor(handle, new_flavor).await?;
                Ok(())
            }
            Err(e) => {
                self.registry.mark_poisoned(handle).await?;
                Err(e)
            }
        }
    }

    /// `StreamOut(handle, subpath)` (spec §4.7, §4.8). Writes the tar
    /// stream into `writer` and hands ownership of it back so callers that
    /// used an in-memory sink (e.g. `Vec<u8>`) can reclaim the bytes.
    /// `writer` must be owned (not borrowed) since the work runs on a
    /// blocking thread.
    pub async fn stream_out<W: Write + Send + 'static>(
        &self,
        handle: &str,
        subpath: &Path,
        writer: W,
        cancel: Option<CancelToken>,
    ) -> VolmanResult<W> {
        let guard = self.registry.begin_read(handle).await?;
        let volume = guard.volume.clone();

        tracing::debug!(handle = %handle, subpath = %subpath.display(), "Streaming out");

        let path = volume.path.clone();
        let flavor = volume.flavor;
        let oracle = self.oracle;
        let subpath = subpath.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            stream::pack(&path, &subpath, flavor, &oracle, &mut writer, cancel.as_ref())?;
            Ok(writer)
        })
        .await
        .map_err(|e| VolmanError::Internal(format!("stream-out task panicked: {e}")))?
    }

    /// `StreamIn(handle, subpath, stream)` (spec §4.7, §4.8). Reads the tar
    /// stream from `reader`; failures poison the volume since partial
    /// writes may already be on disk.
    pub async fn stream_in<R: Read + Send + 'static>(
        &self,
        handle: &str,
        subpath: &Path,
        reader: R,
        cancel: Option<CancelToken>,
    ) -> VolmanResult<()> {
        let guard = self.registry.begin_mutation(handle).await?;
        let volume = guard.volume.clone();

        tracing::info!(handle = %handle, subpath = %subpath.display(), "Streaming in");

        let path = volume.path.clone();
        let flavor = volume.flavor;
        let oracle = self.oracle;
        let subpath_buf = subpath.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            stream::unpack(&path, &subpath_buf, flavor, &oracle, reader, cancel.as_ref())
        })
        .await
        .map_err(|e| VolmanError::Internal(format!("stream-in task panicked: {e}")))?;

        drop(guard);

        if let Err(e) = &result {
            if !matches!(e, VolmanError::InvalidPath(_) | VolmanError::MalformedStream(_)) {
                self.registry.mark_poisoned(handle).await?;
            }
        }

        result
    }

    /// `Destroy(handle)` (spec §4.8). Holds the per-handle lock for the
    /// whole operation, including the filesystem teardown, so it can't race
    /// a concurrent convert or stream-in on the same handle (spec §4.6/§5).
    pub async fn destroy(&self, handle: &str) -> VolmanResult<()> {
        tracing::info!(handle = %handle, "Destroying volume");
        let guard = self.registry.remove(handle).await?;

        let backend = Arc::clone(&self.backend);
        let path = guard.volume.path.clone();
        let result = tokio::task::spawn_blocking(move || backend.destroy(&path))
            .await
            .map_err(|e| VolmanError::Internal(format!("destroy task panicked: {e}")))?;
        drop(guard);
        result
    }

    async fn retag_handle(&self, handle: &str, direction: Direction, cancel: Option<CancelToken>) -> VolmanResult<()> {
        let volume = self
            .registry
            .get(handle)
            .await
            .ok_or_else(|| VolmanError::NotFound(handle.to_string()))?;

        let path = volume.path.clone();
        let oracle = self.oracle;
        tokio::task::spawn_blocking(move || namespace::retag(&path, &oracle, direction, cancel.as_ref()))
            .await
            .map_err(|e| VolmanError::Internal(format!("retag task panicked: {e}")))?
    }
}

/// Validate a subpath is relative and does not escape the volume root,
/// independent of any particular volume's on-disk path.
pub fn validate_subpath(subpath: &Path) -> VolmanResult<()> {
    walk::reject_escape(Path::new(""), subpath)
}
