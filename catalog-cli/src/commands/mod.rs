pub mod daemon;
pub mod index;
pub mod reconcile;
pub mod refresh;
pub mod repo;

use std::path::PathBuf;

use anyhow::{Context, Result};

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}
