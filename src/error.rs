//! This module contains the errors used all over this daemon.

use std::{io, path::PathBuf};

use crate::prelude::*;

/// Convenience wrapper around *Result<T, AppError>*.
pub type AppResult<T> = Result<T, AppError>;

/// Error returned by several functions in nuefsd.
#[derive(Error, Debug)]
pub enum AppError {
    /// Error returned by failing IO operations.
    /// Most of these will occur during filesystem interactions.
    #[error(transparent)]
    IO(#[from] io::Error),

    /// Error returned when a control frame cannot be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] serde_json::Error),

    /// Error returned when a manifest or one of its entries is invalid.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Error returned by failing mount lifecycle operations.
    #[error(transparent)]
    Mount(#[from] MountError),

    /// Error converted from any error that does not have a matching *AppError* variant.
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

/// An error returned by a failed operation on the mount registry.
#[derive(Error, Debug)]
pub enum MountError {
    /// The canonical root already belongs to an active mount.
    #[error("'{}' is already mounted", .0.display())]
    AlreadyMounted(PathBuf),

    /// Mountpoints must be empty so no real files get shadowed.
    #[error("mountpoint '{}' is not an empty directory", .0.display())]
    MountpointNotEmpty(PathBuf),

    /// The requested mountpoint is missing or not a directory at all.
    #[error("mountpoint '{}' does not exist or is not a directory", .0.display())]
    InvalidMountpoint(PathBuf),

    /// The request names a mount this daemon does not hold.
    #[error("no active mount has the id {0}")]
    UnknownMountId(u64),
}
