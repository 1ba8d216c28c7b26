//! Wire types for the daemon's control channel.
//!
//! Requests and replies travel as newline-delimited JSON frames over the
//! daemon's Unix socket. The `op` and `reply` tags make every frame
//! self-describing, so a client never needs out-of-band schema knowledge.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// Environment variable overriding the default control socket path.
pub const SOCKET_ENV: &str = "NUEFSD_SOCKET";

/// A request frame, tagged by its verb.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Mount {
        root: PathBuf,
        entries: Vec<ManifestEntry>,
    },
    Update {
        mount_id: u64,
        entries: Vec<ManifestEntry>,
    },
    Unmount {
        mount_id: u64,
    },
    Resolve {
        root: PathBuf,
    },
    Status,
    GetManifest {
        mount_id: u64,
    },
    Which {
        mount_id: u64,
        virtual_path: String,
    },
    DaemonInfo,
    Shutdown,
}

/// A reply frame. Errors are ordinary frames; the connection survives them.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Mounted { mount_id: u64, root: PathBuf },
    Done,
    Resolved { mount_id: Option<u64> },
    Status { mounts: Vec<MountStatus> },
    Manifest { entries: Vec<ManifestEntry> },
    Owner { owner: Option<OwnerInfo> },
    Daemon { info: DaemonInfo },
    Error { message: String },
}

/// One active mount, as reported by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountStatus {
    pub mount_id: u64,
    pub root: PathBuf,
}

/// Facts about the daemon process, fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub pid: i64,
    pub socket: PathBuf,
    pub started_at: u64,
}

/// Default control socket: `$NUEFSD_SOCKET`, then `$XDG_RUNTIME_DIR`, then a
/// per-user path under /tmp.
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return PathBuf::from(path);
    }

    if let Ok(runtime) = env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime).join("nuefsd.sock");
    }

    PathBuf::from(format!("/tmp/nuefsd-{}.sock", nuefsfs::current_uid()))
}
