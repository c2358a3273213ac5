//! filesync: two-party file synchronization.
//!
//! # Usage
//!
//! ```text
//! filesync server [--config <path>]
//! filesync client [--config <path>]
//! filesync hash-password --salt <salt> [<password>]
//! filesync config-template server|client [--output <path>]
//! filesync check-config server|client [--config <path>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    check::CheckArgs, password::HashPasswordArgs, run::RunArgs, template::TemplateArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "filesync",
    version,
    about = "Keep a local directory in sync with a filesync server",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server in the foreground.
    Server(RunArgs),

    /// Run the client in the foreground, reconnecting until stopped.
    Client(RunArgs),

    /// Print the salted password hash for a server user entry.
    HashPassword(HashPasswordArgs),

    /// Print a configuration file with every default filled in.
    ConfigTemplate(TemplateArgs),

    /// Load a configuration file and check its root directory.
    CheckConfig(CheckArgs),
}

/// Which party a configuration file belongs to.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Server,
    Client,
}

impl Party {
    fn default_file(self) -> &'static str {
        match self {
            Party::Server => "server.yaml",
            Party::Client => "client.yaml",
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Server(args) => args.run(Party::Server),
        Commands::Client(args) => args.run(Party::Client),
        Commands::HashPassword(args) => args.run(),
        Commands::ConfigTemplate(args) => args.run(),
        Commands::CheckConfig(args) => args.run(),
    }
}
