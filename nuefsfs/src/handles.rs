// Per-mount table of open handles.
// FUSE sees an opaque id; the table maps it back to the backend file or to the
// virtual directory a readdir is walking.

use std::collections::HashMap;
use std::fs::File;
use std::sync::{Arc, Mutex};

use rand::{thread_rng, Rng};

/// The maximum number of attempts when randomly generating a unique handle id.
/// This should rarely, if ever, be hit under normal circumstances.
const MAX_HANDLE_GENERATION_TRIES: u8 = 100;

/// What an opaque handle id refers to.
pub enum BackendHandle {
    /// An open backend file. Kept behind an *Arc* so I/O runs outside the
    /// table's mutex.
    File(Arc<File>),

    /// An open virtual directory, remembered by its virtual path.
    Dir(String),
}

/// The handle table itself. All access goes through its own mutex; the table
/// is never locked across backend I/O.
pub struct HandleTable {
    inner: Mutex<HashMap<u64, BackendHandle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert_file(&self, file: File) -> u64 {
        self.insert(BackendHandle::File(Arc::new(file)))
    }

    pub fn insert_dir(&self, virt: impl Into<String>) -> u64 {
        self.insert(BackendHandle::Dir(virt.into()))
    }

    /// The backend file behind a handle, if the handle is an open file.
    pub fn file(&self, fh: u64) -> Option<Arc<File>> {
        let table = self.inner.lock().expect("handle table was poisoned!");

        match table.get(&fh) {
            Some(BackendHandle::File(file)) => Some(file.clone()),
            _ => None,
        }
    }

    /// The virtual path behind a handle, if the handle is an open directory.
    pub fn dir(&self, fh: u64) -> Option<String> {
        let table = self.inner.lock().expect("handle table was poisoned!");

        match table.get(&fh) {
            Some(BackendHandle::Dir(virt)) => Some(virt.clone()),
            _ => None,
        }
    }

    /// Discards a handle. Silently does nothing for an unknown id.
    pub fn remove(&self, fh: u64) {
        let mut table = self.inner.lock().expect("handle table was poisoned!");
        table.remove(&fh);
    }

    fn insert(&self, handle: BackendHandle) -> u64 {
        let mut table = self.inner.lock().expect("handle table was poisoned!");
        let mut rng = thread_rng();

        let mut tries = 0;
        loop {
            if tries == MAX_HANDLE_GENERATION_TRIES {
                panic!("Could not generate new handle id in maximum number of attempts ({MAX_HANDLE_GENERATION_TRIES})");
            }

            let id: u64 = rng.gen();
            if let std::collections::hash_map::Entry::Vacant(slot) = table.entry(id) {
                slot.insert(handle);
                return id;
            }

            tries += 1;
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
