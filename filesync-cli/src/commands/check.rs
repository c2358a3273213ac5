//! `filesync check-config server|client [--config <path>]`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use filesync_core::config::{self, validate_root, ClientConfig, ServerConfig};

use super::config_path;
use crate::Party;

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[arg(value_enum)]
    pub party: Party,

    /// YAML configuration file.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

impl CheckArgs {
    pub fn run(self) -> Result<()> {
        let path = config_path(self.config, self.party)?;
        let lines = match self.party {
            Party::Server => {
                let cfg: ServerConfig = load(&path)?;
                vec![
                    ("listen", cfg.listen.clone()),
                    ("root", checked_root(&cfg.root)?),
                    ("staging", cfg.staging.display().to_string()),
                    ("users", cfg.users.len().to_string()),
                    ("max clients", limit(cfg.limits.max_clients as u64)),
                    ("max file size", limit(cfg.limits.max_file_size)),
                ]
            }
            Party::Client => {
                let cfg: ClientConfig = load(&path)?;
                vec![
                    ("server", cfg.server.clone()),
                    ("login", cfg.login.clone()),
                    ("root", checked_root(&cfg.root)?),
                    ("staging", cfg.staging.display().to_string()),
                    ("reconnect delay", format!("{}s", cfg.reconnect_delay_secs)),
                ]
            }
        };

        println!("{} {}", "■".green().bold(), path.display().to_string().bold());
        for (key, value) in lines {
            println!("  {} {value}", format!("{key:<16}").bright_black());
        }
        Ok(())
    }
}

fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    config::load(path).with_context(|| format!("invalid config '{}'", path.display()))
}

fn checked_root(root: &Path) -> Result<String> {
    let root = validate_root(root).context("unusable root directory")?;
    Ok(root.display().to_string())
}

fn limit(value: u64) -> String {
    if value == 0 {
        "unlimited".to_string()
    } else {
        value.to_string()
    }
}
