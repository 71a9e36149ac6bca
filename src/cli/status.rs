//! Status CLI command: pings the daemon, or reports a local summary if
//! none is running.

use std::io::Write;
use std::time::Duration;

use clap::Args;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use super::Runtime;
use crate::Result;
use crate::services::ServerPaths;

const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Reports whether the daemon is reachable, and basic counts either way.
#[derive(Debug, Clone, Default, Args)]
pub struct StatusArgs;

impl StatusArgs {
    /// Runs the probe and writes a human-readable summary.
    ///
    /// # Errors
    /// Returns an error only if the local fallback summary itself can't
    /// be computed (a storage failure); a missing or unresponsive daemon
    /// is reported, not treated as an error.
    pub async fn run<W: Write>(&self, runtime: &Runtime, writer: &mut W) -> Result<()> {
        let socket = ServerPaths::under(&runtime.home).socket;

        match timeout(PING_TIMEOUT, ping(&socket)).await {
            Ok(Ok(response)) => {
                writeln!(writer, "daemon: {response}").map_err(io_err)?;
            }
            _ => {
                let active = runtime.store.list_active()?.len();
                let pinned = runtime.store.list_pinned()?.len();
                writeln!(writer, "daemon: not running")
                    .map_err(io_err)?;
                writeln!(writer, "engrams: {active} active, {pinned} pinned").map_err(io_err)?;
            }
        }
        Ok(())
    }
}

async fn ping(socket: &std::path::Path) -> std::io::Result<String> {
    let stream = UnixStream::connect(socket).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(b"{\"type\":\"ping\"}\n").await?;

    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    Ok(line.trim().to_string())
}

fn io_err(e: std::io::Error) -> crate::Error {
    crate::Error::OperationFailed { operation: "cli_write".to_string(), cause: e.to_string() }
}
