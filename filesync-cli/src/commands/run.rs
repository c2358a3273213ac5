//! `filesync server` and `filesync client`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use filesync_daemon::{start_client_blocking, start_server_blocking};

use super::config_path;
use crate::Party;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// YAML configuration file.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

impl RunArgs {
    pub fn run(self, party: Party) -> Result<()> {
        let path = config_path(self.config, party)?;
        match party {
            Party::Server => start_server_blocking(&path)
                .with_context(|| format!("server exited with error ({})", path.display())),
            Party::Client => start_client_blocking(&path)
                .with_context(|| format!("client exited with error ({})", path.display())),
        }
    }
}
