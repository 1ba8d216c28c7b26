//! The process-wide table of active mounts.
//!
//! The registry owns every live mount: its FUSE session, its shared state,
//! and the two maps that key mounts by id and by canonical root. One coarse
//! mutex guards the maps; it is held for map updates only, never across
//! backend or kernel I/O.

use std::collections::HashMap;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::prelude::*;
use crate::protocol::MountStatus;

/// One live mount. Dropping it tears down the FUSE session, which joins the
/// session workers and releases the mountpoint.
struct Mount {
    root: PathBuf,
    state: Arc<MountState>,
    _session: nuefsfs::BackgroundSession,
}

pub struct MountRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    /// Active mounts in creation order, keyed by their monotonic id.
    mounts: IndexMap<u64, Mount>,

    /// Canonical root -> mount id; one-to-one across active mounts.
    roots: HashMap<PathBuf, u64>,

    next_id: u64,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                mounts: IndexMap::new(),
                roots: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Creates a mount at `root` and spawns its kernel session.
    ///
    /// The root is reserved under the lock before the session spawns, so a
    /// concurrent mount of the same path loses cleanly; the reservation is
    /// rolled back if the kernel refuses the attach.
    pub fn create(&self, root: &Path, entries: Vec<ManifestEntry>) -> AppResult<(u64, PathBuf)> {
        let root = root
            .canonicalize()
            .map_err(|_| MountError::InvalidMountpoint(root.to_path_buf()))?;

        if !root.is_dir() {
            return Err(MountError::InvalidMountpoint(root).into());
        }

        if fs::read_dir(&root)?.next().is_some() {
            return Err(MountError::MountpointNotEmpty(root).into());
        }

        let index = VirtualTreeIndex::build(entries)?;

        let mount_id = {
            let mut inner = self.lock();

            if inner.roots.contains_key(&root) {
                return Err(MountError::AlreadyMounted(root).into());
            }

            let id = inner.next_id;
            inner.next_id += 1;
            inner.roots.insert(root.clone(), id);
            id
        };

        let state = Arc::new(MountState::new(index));

        let session = match NueFs::new(state.clone()).spawn_mount(&root) {
            Ok(session) => session,
            Err(err) => {
                self.lock().roots.remove(&root);
                error!(
                    "failed to attach kernel session at '{}': {}",
                    root.display(),
                    err
                );
                return Err(err.into());
            }
        };

        self.lock().mounts.insert(
            mount_id,
            Mount {
                root: root.clone(),
                state,
                _session: session,
            },
        );

        info!("mounted '{}' as mount {}", root.display(), mount_id);
        Ok((mount_id, root))
    }

    /// Builds a new index from `entries` and swaps it into the live mount.
    /// In-flight requests keep whichever index they observed at dispatch.
    pub fn update(&self, mount_id: u64, entries: Vec<ManifestEntry>) -> AppResult<()> {
        let index = VirtualTreeIndex::build(entries)?;
        let state = self.state_of(mount_id)?;

        state.install_index(index);
        info!("updated manifest for mount {}", mount_id);
        Ok(())
    }

    pub fn resolve(&self, root: &Path) -> Option<u64> {
        let root = root.canonicalize().ok()?;
        self.lock().roots.get(&root).copied()
    }

    /// Tears down a mount and releases its mountpoint.
    pub fn destroy(&self, mount_id: u64) -> AppResult<()> {
        let mount = {
            let mut inner = self.lock();
            let mount = inner
                .mounts
                .shift_remove(&mount_id)
                .ok_or(MountError::UnknownMountId(mount_id))?;
            inner.roots.remove(&mount.root);
            mount
        };

        info!("unmounting '{}' (mount {})", mount.root.display(), mount_id);
        drop(mount);
        Ok(())
    }

    /// Destroys every live mount. A failing mount never takes another with
    /// it; each session is dropped on its own.
    pub fn destroy_all(&self) {
        let mounts = {
            let mut inner = self.lock();
            inner.roots.clear();
            mem::take(&mut inner.mounts)
        };

        for (mount_id, mount) in mounts {
            info!("unmounting '{}' (mount {})", mount.root.display(), mount_id);
            drop(mount);
        }
    }

    pub fn list(&self) -> Vec<MountStatus> {
        self.lock()
            .mounts
            .iter()
            .map(|(mount_id, mount)| MountStatus {
                mount_id: *mount_id,
                root: mount.root.clone(),
            })
            .collect_vec()
    }

    pub fn get_manifest(&self, mount_id: u64) -> AppResult<Vec<ManifestEntry>> {
        let state = self.state_of(mount_id)?;
        Ok(state.index().entries().cloned().collect_vec())
    }

    /// Runs the same resolution the VFS handler uses and reports the winning
    /// backend, if any.
    pub fn which(&self, mount_id: u64, virtual_path: &str) -> AppResult<Option<OwnerInfo>> {
        let state = self.state_of(mount_id)?;
        Ok(state.index().which(virtual_path.trim_start_matches('/')))
    }

    fn state_of(&self, mount_id: u64) -> AppResult<Arc<MountState>> {
        self.lock()
            .mounts
            .get(&mount_id)
            .map(|mount| mount.state.clone())
            .ok_or_else(|| MountError::UnknownMountId(mount_id).into())
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("mount registry was poisoned!")
    }
}

impl Default for MountRegistry {
    fn default() -> Self {
        Self::new()
    }
}
