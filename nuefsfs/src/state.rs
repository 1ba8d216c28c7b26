// MountState :: everything a live mount shares between the FUSE session and
// the daemon's registry.
// The index sits behind an Arc that is swapped wholesale on update; a request
// that already took its snapshot keeps reading the index it started with.

use std::sync::{Arc, RwLock};

use nix::unistd::{Gid, Uid};

use crate::handles::HandleTable;
use crate::index::VirtualTreeIndex;

/// The uid the daemon runs as; synthetic directories report it as their owner.
pub fn current_uid() -> u32 {
    Uid::current().as_raw()
}

pub struct MountState {
    index: RwLock<Arc<VirtualTreeIndex>>,
    handles: HandleTable,
    uid: u32,
    gid: u32,
}

impl MountState {
    pub fn new(index: VirtualTreeIndex) -> Self {
        Self {
            index: RwLock::new(Arc::new(index)),
            handles: HandleTable::new(),
            uid: current_uid(),
            gid: Gid::current().as_raw(),
        }
    }

    /// Snapshots the current index. Each VFS request takes exactly one
    /// snapshot at dispatch and uses it for its whole lifetime.
    pub fn index(&self) -> Arc<VirtualTreeIndex> {
        self.index.read().expect("index lock was poisoned!").clone()
    }

    /// Publishes a freshly built index. In-flight requests keep whichever
    /// snapshot they observed; the old index dies with its last reader.
    pub fn install_index(&self, index: VirtualTreeIndex) {
        let mut slot = self.index.write().expect("index lock was poisoned!");
        *slot = Arc::new(index);
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub(crate) fn uid(&self) -> u32 {
        self.uid
    }

    pub(crate) fn gid(&self) -> u32 {
        self.gid
    }
}
