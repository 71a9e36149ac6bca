//! Serve CLI command: runs the long-lived retrieval daemon (§4.H).

use std::io::Write;
use std::sync::Arc;

use clap::Args;

use super::Runtime;
use crate::Result;
use crate::services::{RequestServer, ServerPaths};

/// Starts the request daemon and blocks until it shuts down.
#[derive(Debug, Clone, Default, Args)]
pub struct ServeArgs;

impl ServeArgs {
    /// Runs the accept loop to completion.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound or the PID file
    /// cannot be written; losing a stale-socket race to a live daemon is
    /// not an error (see [`RequestServer::run`]).
    pub async fn run<W: Write>(&self, runtime: &Runtime, writer: &mut W) -> Result<()> {
        let paths = ServerPaths::under(&runtime.home);
        let server = RequestServer::new(
            Arc::clone(&runtime.store),
            Arc::clone(&runtime.retriever),
            paths,
            runtime.binary.clone(),
        );
        writeln!(writer, "engrammar daemon listening under {}", runtime.home.display()).map_err(io_err)?;
        server.run().await
    }
}

fn io_err(e: std::io::Error) -> crate::Error {
    crate::Error::OperationFailed { operation: "cli_write".to_string(), cause: e.to_string() }
}
