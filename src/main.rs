//! nuefsd is the NueFS mount daemon.
//! It serves layered, write-through filesystem views assembled from scattered
//! backend paths, and answers mount/unmount/status queries on a local socket.

mod control;
mod error;
mod prelude;
mod protocol;
mod registry;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;

use crate::control::ControlServer;
use crate::prelude::*;
use crate::registry::MountRegistry;

/// The NueFS mount daemon.
#[derive(Parser)]
#[command(
    name = "nuefsd",
    about = "Serves layered filesystem views and a control socket to manage them"
)]
struct Cli {
    /// Control socket path; defaults to $NUEFSD_SOCKET, then $XDG_RUNTIME_DIR/nuefsd.sock.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log verbosity (off, error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() -> AppResult<()> {
    let cli = Cli::parse();

    SimpleLogger::new()
        .with_colors(true)
        .with_level(cli.log_level)
        .init()
        .expect("Failed to start logger!");

    let socket = cli.socket.unwrap_or_else(protocol::default_socket_path);
    let registry = Arc::new(MountRegistry::new());

    let server = ControlServer::bind(socket, registry)?;
    info!(
        "nuefsd (pid {}) listening on '{}'",
        server.info().pid,
        server.info().socket.display()
    );

    server.run()
}
