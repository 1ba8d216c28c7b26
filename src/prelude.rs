//! This module re-exports a bunch of utilities used across this daemon.

#![allow(unused_imports)]

pub use tap::prelude::*;

pub use indexmap::IndexMap;
pub use itertools::Itertools;
pub use thiserror::Error;

pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::warn;

pub use crate::error::AppError;
pub use crate::error::AppResult;
pub use crate::error::MountError;

pub use nuefsfs::{ManifestEntry, ManifestError, MountState, NueFs, OwnerInfo, VirtualTreeIndex};
