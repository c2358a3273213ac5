pub mod check;
pub mod password;
pub mod run;
pub mod template;

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::Party;

/// `--config` when given, otherwise `<config dir>/filesync/<party>.yaml`.
pub fn config_path(explicit: Option<PathBuf>, party: Party) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    let dir = dirs::config_dir().context("could not determine the config directory")?;
    Ok(dir.join("filesync").join(party.default_file()))
}
