//! Config CLI command: inspect the resolved configuration and home path.

use std::io::Write;

use clap::{Args, Subcommand};

use super::Runtime;
use crate::Result;

/// Inspects configuration (§6 "Configuration").
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

/// What to show.
#[derive(Debug, Clone, Subcommand)]
pub enum ConfigSubcommand {
    /// Prints the resolved engrammar home directory.
    Path,
    /// Prints the effective configuration as JSON (defaults folded in).
    Show,
}

impl ConfigArgs {
    /// Runs the requested inspection.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn run<W: Write>(&self, runtime: &Runtime, writer: &mut W) -> Result<()> {
        match self.command {
            ConfigSubcommand::Path => {
                writeln!(writer, "{}", runtime.home.display()).map_err(io_err)?;
            }
            ConfigSubcommand::Show => {
                let text = serde_json::to_string_pretty(&runtime.config).map_err(|e| {
                    crate::Error::OperationFailed { operation: "cli_json".to_string(), cause: e.to_string() }
                })?;
                writeln!(writer, "{text}").map_err(io_err)?;
            }
        }
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> crate::Error {
    crate::Error::OperationFailed { operation: "cli_write".to_string(), cause: e.to_string() }
}
