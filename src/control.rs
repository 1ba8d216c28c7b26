//! The control server: a local-socket RPC endpoint over the mount registry.
//!
//! Each accepted connection is served on its own thread, so a slow `mount`
//! never blocks a `status` query arriving on another connection. Registry
//! mutations take the registry mutex; everything else runs lock-free against
//! index snapshots.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;

use crate::prelude::*;
use crate::protocol::{DaemonInfo, Request, Response};
use crate::registry::MountRegistry;

pub struct ControlServer {
    listener: UnixListener,
    socket: PathBuf,
    registry: Arc<MountRegistry>,
    info: DaemonInfo,
    shutdown: Arc<AtomicBool>,
}

impl ControlServer {
    /// Binds the control socket. Failing here aborts daemon startup; a stale
    /// socket left behind by a dead daemon is swept away first.
    pub fn bind(socket: PathBuf, registry: Arc<MountRegistry>) -> AppResult<Self> {
        if socket.exists() {
            if UnixStream::connect(&socket).is_ok() {
                return Err(anyhow::anyhow!(
                    "another daemon is already listening on '{}'",
                    socket.display()
                )
                .into());
            }

            warn!("removing stale control socket '{}'", socket.display());
            fs::remove_file(&socket)?;
        }

        let listener = UnixListener::bind(&socket)
            .with_context(|| format!("cannot bind control socket '{}'", socket.display()))?;

        let info = DaemonInfo {
            pid: std::process::id() as i64,
            socket: socket.clone(),
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
        };

        Ok(Self {
            listener,
            socket,
            registry,
            info,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn info(&self) -> &DaemonInfo {
        &self.info
    }

    /// Accepts connections until a shutdown request has drained the registry.
    pub fn run(&self) -> AppResult<()> {
        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match stream {
                Ok(stream) => {
                    let registry = self.registry.clone();
                    let info = self.info.clone();
                    let shutdown = self.shutdown.clone();
                    let socket = self.socket.clone();

                    thread::spawn(move || {
                        if let Err(err) = serve_client(stream, &registry, &info, &shutdown, &socket)
                        {
                            debug!("control connection ended: {err}");
                        }
                    });
                }
                Err(err) => warn!("control accept failed: {err}"),
            }
        }

        info!("control server stopped");
        let _ = fs::remove_file(&self.socket);
        Ok(())
    }
}

/// Serves one client: one JSON frame per line, one reply per frame.
/// A malformed frame earns an error reply and the connection stays open.
fn serve_client(
    stream: UnixStream,
    registry: &MountRegistry,
    info: &DaemonInfo,
    shutdown: &AtomicBool,
    socket: &Path,
) -> AppResult<()> {
    let reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(request, registry, info, shutdown),
            Err(err) => Response::Error {
                message: format!("malformed request: {err}"),
            },
        };

        serde_json::to_writer(&mut writer, &response)?;
        writer.write_all(b"\n")?;

        if shutdown.load(Ordering::SeqCst) {
            // Nudge the accept loop awake so it can observe the flag.
            let _ = UnixStream::connect(socket);
            break;
        }
    }

    Ok(())
}

fn dispatch(
    request: Request,
    registry: &MountRegistry,
    info: &DaemonInfo,
    shutdown: &AtomicBool,
) -> Response {
    match request {
        Request::Mount { root, entries } => reply(
            registry
                .create(&root, entries)
                .map(|(mount_id, root)| Response::Mounted { mount_id, root }),
        ),
        Request::Update { mount_id, entries } => {
            reply(registry.update(mount_id, entries).map(|()| Response::Done))
        }
        Request::Unmount { mount_id } => {
            reply(registry.destroy(mount_id).map(|()| Response::Done))
        }
        Request::Resolve { root } => Response::Resolved {
            mount_id: registry.resolve(&root),
        },
        Request::Status => registry
            .list()
            .pipe(|mounts| Response::Status { mounts }),
        Request::GetManifest { mount_id } => reply(
            registry
                .get_manifest(mount_id)
                .map(|entries| Response::Manifest { entries }),
        ),
        Request::Which {
            mount_id,
            virtual_path,
        } => reply(
            registry
                .which(mount_id, &virtual_path)
                .map(|owner| Response::Owner { owner }),
        ),
        Request::DaemonInfo => Response::Daemon { info: info.clone() },
        Request::Shutdown => {
            info!("shutdown requested; unmounting everything");
            registry.destroy_all();
            shutdown.store(true, Ordering::SeqCst);
            Response::Done
        }
    }
}

/// Folds an operation's outcome into the matching reply frame.
fn reply(result: AppResult<Response>) -> Response {
    result.unwrap_or_else(|err| Response::Error {
        message: err.to_string(),
    })
}
