use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::content::protocol::{format_transfer_request, parse_transfer_header};
use crate::directory::types::RoutingDecision;
use crate::error::{CdnError, Result};
use crate::transport::LineConn;

const CHUNK_SIZE: usize = 4096;

/// Fetches the file named in `decision` into `output_dir`.
///
/// Bytes land in a `.part` file that is renamed only once the announced size
/// has arrived, so an interrupted download never leaves a complete-looking
/// file behind. `progress` is called with `(received, total)` after each
/// chunk.
pub async fn download<F>(
    decision: &RoutingDecision,
    output_dir: &Path,
    connect_timeout: Duration,
    read_timeout: Duration,
    mut progress: F,
) -> Result<PathBuf>
where
    F: FnMut(u64, u64),
{
    let addr = decision.address.to_string();
    let name = &decision.file_name;
    if Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name.as_str()) {
        return Err(CdnError::InvalidFormat(format!("refusing file name {:?}", name)));
    }

    let mut conn = LineConn::connect(&addr, connect_timeout).await?;
    conn.write_line(&format_transfer_request(name)).await?;

    let header = conn
        .read_line()
        .await?
        .ok_or_else(|| CdnError::Unreachable(addr.clone()))?;
    let total = parse_transfer_header(&header, name)?;
    if total != decision.size {
        tracing::debug!(
            "{} changed size since registration ({} -> {})",
            name,
            decision.size,
            total
        );
    }

    tokio::fs::create_dir_all(output_dir).await?;
    let target = output_dir.join(name);
    let partial = output_dir.join(format!("{}.part", name));

    if let Err(e) = receive_into(&mut conn, &partial, name, total, read_timeout, &mut progress).await
    {
        if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
            tracing::debug!("Could not remove {}: {}", partial.display(), cleanup);
        }
        return Err(e);
    }
    tokio::fs::rename(&partial, &target).await?;
    conn.shutdown().await;

    tracing::info!("Downloaded {} ({} bytes) from {}", name, total, addr);
    Ok(target)
}

/// Copies exactly `total` body bytes from `conn` into `partial`.
async fn receive_into<F>(
    conn: &mut LineConn,
    partial: &Path,
    name: &str,
    total: u64,
    read_timeout: Duration,
    progress: &mut F,
) -> Result<()>
where
    F: FnMut(u64, u64),
{
    let mut file = tokio::fs::File::create(partial).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut received = 0u64;
    progress(received, total);

    while received < total {
        let want = CHUNK_SIZE.min((total - received) as usize);
        let n = match tokio::time::timeout(read_timeout, conn.reader_mut().read(&mut buf[..want]))
            .await
        {
            Ok(read) => read?,
            Err(_) => return Err(CdnError::Timeout(read_timeout)),
        };
        if n == 0 {
            return Err(CdnError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} truncated at {} of {} bytes", name, received, total),
            )));
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
        progress(received, total);
    }

    file.flush().await?;
    Ok(())
}
