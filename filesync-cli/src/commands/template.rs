//! `filesync config-template server|client [--output <path>]`

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use filesync_core::config::{self, ClientConfig, ServerConfig};

use crate::Party;

#[derive(Args, Debug)]
pub struct TemplateArgs {
    #[arg(value_enum)]
    pub party: Party,

    /// Write the template here instead of stdout. Existing files are kept.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

impl TemplateArgs {
    pub fn run(self) -> Result<()> {
        let yaml = match self.party {
            Party::Server => config::to_yaml(&ServerConfig::default()),
            Party::Client => config::to_yaml(&ClientConfig::default()),
        }
        .context("failed to render config template")?;

        let Some(output) = self.output else {
            print!("{yaml}");
            return Ok(());
        };
        if output.exists() {
            anyhow::bail!("{} already exists", output.display());
        }
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create '{}'", parent.display()))?;
        }
        fs::write(&output, yaml)
            .with_context(|| format!("cannot write '{}'", output.display()))?;
        println!("✓ Wrote {} template to {}", party_label(self.party), output.display());
        Ok(())
    }
}

fn party_label(party: Party) -> &'static str {
    match party {
        Party::Server => "server",
        Party::Client => "client",
    }
}
