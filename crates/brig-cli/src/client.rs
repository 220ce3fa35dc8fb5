//! Daemon client

use anyhow::{Context, Result, bail};
use brig_core::protocol::{TERMINATOR, split_response};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Send one payload and wait for the terminated response
///
/// The response is everything the daemon sent before the terminator:
/// captured output followed by any diagnostic.
pub async fn exec(socket: &Path, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    if payload.contains(&TERMINATOR) {
        bail!("payload contains a NUL byte");
    }

    let mut stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("cannot connect to {}", socket.display()))?;
    tracing::debug!(socket = %socket.display(), bytes = payload.len(), "sending payload");

    stream.write_all(payload).await?;
    stream.write_all(&[TERMINATOR]).await?;

    tokio::time::timeout(timeout, read_response(&mut stream))
        .await
        .context("timed out waiting for response")?
}

async fn read_response(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed before end of response");
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(response) = split_response(&buffer) {
            return Ok(response.to_vec());
        }
    }
}
