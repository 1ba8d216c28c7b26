// This is the root of nuefsfs, the filesystem engine behind NueFS.
// It compiles layer manifests into a virtual tree and serves that tree over FUSE,
// writing every change through to the backend paths.

#[macro_use]
extern crate log;

mod filesystem;
pub use filesystem::NueFs;

/// The session handle returned by *NueFs::spawn_mount*; dropping it unmounts.
pub use fuser::BackgroundSession;

mod handles;
mod index;
mod libc_extras;
mod libc_wrappers;
mod manifest;
mod state;

pub use index::{Resolution, VirtualTreeIndex};
pub use manifest::{compile, Layer, ManifestEntry, ManifestError, NamePredicate, OwnerInfo};
pub use state::{current_uid, MountState};

#[cfg(test)]
mod tests;
