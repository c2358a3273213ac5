//! `filesync hash-password`

use std::io::{self, BufRead};

use anyhow::{bail, Context, Result};
use clap::Args;

use filesync_daemon::hash_password;

#[derive(Args, Debug)]
pub struct HashPasswordArgs {
    /// The server's `password_salt`.
    #[arg(long, default_value = "")]
    pub salt: String,

    /// Password to hash. Read from the first line of stdin when omitted.
    pub password: Option<String>,
}

impl HashPasswordArgs {
    pub fn run(self) -> Result<()> {
        let password = match self.password {
            Some(password) => password,
            None => {
                let mut line = String::new();
                io::stdin()
                    .lock()
                    .read_line(&mut line)
                    .context("failed to read password from stdin")?;
                line.trim_end_matches(['\r', '\n']).to_string()
            }
        };
        if password.is_empty() {
            bail!("refusing to hash an empty password");
        }
        println!("{}", hash_password(&self.salt, &password));
        Ok(())
    }
}
