//! Line-oriented TCP plumbing shared by every control-plane endpoint.
//!
//! All reads and writes are bounded by the connection's I/O timeout, and each
//! listener sheds connections beyond its permit budget instead of queueing.

use crate::error::{CdnError, Result};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};

/// Longest accepted control line, newline included.
pub const MAX_LINE_LEN: usize = 4096;

/// Sentinel closing every multi-row response.
pub const END: &str = "END";

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct LineConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl LineConn {
    pub fn new(stream: TcpStream, timeout: Duration) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        }
    }

    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(Self::new(stream, timeout)),
            Ok(Err(e)) => {
                tracing::debug!("Connect to {} failed: {}", addr, e);
                Err(CdnError::Unreachable(addr.to_string()))
            }
            Err(_) => Err(CdnError::Unreachable(addr.to_string())),
        }
    }

    /// Reads one line without its terminator. `Ok(None)` means the peer
    /// closed the connection cleanly.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        self.read_line_within(self.timeout).await
    }

    /// Like [`LineConn::read_line`] but waits at most `limit`.
    pub async fn read_line_within(&mut self, limit: Duration) -> Result<Option<String>> {
        let mut buf = String::new();
        let mut limited = (&mut self.reader).take(MAX_LINE_LEN as u64);

        let n = match tokio::time::timeout(limit, limited.read_line(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(CdnError::InvalidFormat("line is not valid UTF-8".into()));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(CdnError::Timeout(limit)),
        };

        if n == 0 {
            return Ok(None);
        }
        if !buf.ends_with('\n') && n >= MAX_LINE_LEN {
            match tokio::time::timeout(limit, self.discard_rest_of_line()).await {
                Ok(result) => result?,
                Err(_) => return Err(CdnError::Timeout(limit)),
            }
            return Err(CdnError::InvalidFormat("line too long".into()));
        }

        Ok(Some(buf.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Skips buffered input up to and including the next newline.
    async fn discard_rest_of_line(&mut self) -> Result<()> {
        loop {
            let (consumed, done) = {
                let available = self.reader.fill_buf().await?;
                match available.iter().position(|b| *b == b'\n') {
                    Some(pos) => (pos + 1, true),
                    None => (available.len(), available.is_empty()),
                }
            };
            self.reader.consume(consumed);
            if done {
                return Ok(());
            }
        }
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        self.write_raw(framed.as_bytes()).await
    }

    /// Writes every row followed by the `END` sentinel in a single write.
    pub async fn write_rows<I>(&mut self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        let mut framed = String::new();
        for row in rows {
            framed.push_str(&row);
            framed.push('\n');
        }
        framed.push_str(END);
        framed.push('\n');
        self.write_raw(framed.as_bytes()).await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.writer.write_all(bytes)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CdnError::Timeout(self.timeout)),
        }
    }

    /// Reads rows until `END`. A connection closed before the sentinel is an
    /// incomplete response.
    pub async fn read_rows(&mut self) -> Result<Vec<String>> {
        let mut rows = Vec::new();
        loop {
            match self.read_line().await? {
                Some(line) if line == END => return Ok(rows),
                Some(line) => rows.push(line),
                None => {
                    return Err(CdnError::InvalidFormat(
                        "connection closed before END".into(),
                    ));
                }
            }
        }
    }

    pub fn reader_mut(&mut self) -> &mut BufReader<OwnedReadHalf> {
        &mut self.reader
    }

    pub fn writer_mut(&mut self) -> &mut OwnedWriteHalf {
        &mut self.writer
    }

    pub async fn shutdown(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Opens a connection, sends one line and closes it. Used for
/// fire-and-forget notifications.
pub async fn send_line(addr: &str, line: &str, timeout: Duration) -> Result<()> {
    let mut conn = LineConn::connect(addr, timeout).await?;
    conn.write_line(line).await?;
    conn.shutdown().await;
    Ok(())
}

/// Sends one request line and collects the `END`-terminated response.
pub async fn request_rows(addr: &str, line: &str, timeout: Duration) -> Result<Vec<String>> {
    let mut conn = LineConn::connect(addr, timeout).await?;
    conn.write_line(line).await?;
    let rows = conn.read_rows().await?;
    conn.shutdown().await;
    Ok(rows)
}

/// Accepts connections until shutdown is signalled, running `handler` on a
/// task per connection. Connections beyond `max_connections` are answered
/// with `ERROR BUSY` and closed.
pub async fn accept_loop<F, Fut>(
    name: &'static str,
    listener: TcpListener,
    max_connections: usize,
    mut shutdown: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(max_connections));

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok((stream, peer)) => match permits.clone().try_acquire_owned() {
                Ok(permit) => {
                    let session = handler(stream, peer);
                    tokio::spawn(async move {
                        session.await;
                        drop(permit);
                    });
                }
                Err(_) => {
                    tracing::warn!("{} at capacity, shedding connection from {}", name, peer);
                    tokio::spawn(reject_busy(stream));
                }
            },
            Err(e) => {
                tracing::error!("{} failed to accept connection: {}", name, e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    tracing::info!("{} listener stopped", name);
}

async fn reject_busy(stream: TcpStream) {
    let mut conn = LineConn::new(stream, Duration::from_secs(1));
    let _ = conn.write_line(&CdnError::Busy.to_wire()).await;
    conn.shutdown().await;
}

/// Splits a control line into its verb and argument tokens.
pub fn split_line(line: &str) -> Option<(&str, Vec<&str>)> {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next()?;
    Some((verb, tokens.collect()))
}

pub fn parse_num<T: std::str::FromStr>(token: &str, field: &str) -> Result<T> {
    token
        .parse()
        .map_err(|_| CdnError::InvalidFormat(format!("{} is not a number: {}", field, token)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_line_skips_repeated_spaces() {
        let (verb, args) = split_line("GET   doc.txt ").unwrap();
        assert_eq!(verb, "GET");
        assert_eq!(args, vec!["doc.txt"]);
        assert!(split_line("   ").is_none());
    }

    #[test]
    fn test_parse_num_reports_field() {
        let err = parse_num::<u16>("abc", "tcp-port").unwrap_err();
        assert!(err.to_string().contains("tcp-port"));
        assert_eq!(parse_num::<u64>("42", "load").unwrap(), 42);
    }

    #[tokio::test]
    async fn test_read_line_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let mut conn = LineConn::new(server_side, Duration::from_millis(50));
        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, CdnError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_rows_round_trip_until_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = LineConn::new(stream, Duration::from_secs(1));
            let request = conn.read_line().await.unwrap().unwrap();
            assert_eq!(request, "LIST_FILES");
            conn.write_rows(vec!["FILE a 1".to_string(), "FILE b 2".to_string()])
                .await
                .unwrap();
        });

        let rows = request_rows(&addr.to_string(), "LIST_FILES", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(rows, vec!["FILE a 1", "FILE b 2"]);
    }

    #[tokio::test]
    async fn test_overlong_line_is_skipped_whole() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let mut payload = "A".repeat(MAX_LINE_LEN + 900);
        payload.push_str("\nPING\n");
        client.write_all(payload.as_bytes()).await.unwrap();

        let mut conn = LineConn::new(server_side, Duration::from_secs(1));
        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, CdnError::InvalidFormat(_)));
        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("PING"));
    }

    // ============================================================
    // BACKPRESSURE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_accept_loop_sheds_connections_over_capacity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = tokio::spawn(accept_loop(
            "test listener",
            listener,
            1,
            shutdown_rx,
            |stream: TcpStream, _peer: SocketAddr| async move {
                let mut conn = LineConn::new(stream, Duration::from_secs(5));
                if conn.write_line("READY").await.is_ok() {
                    let _ = conn.read_line().await;
                }
                conn.shutdown().await;
            },
        ));

        let timeout = Duration::from_secs(1);
        let mut held = LineConn::connect(&addr, timeout).await.unwrap();
        assert_eq!(held.read_line().await.unwrap().as_deref(), Some("READY"));

        let mut shed = LineConn::connect(&addr, timeout).await.unwrap();
        assert_eq!(shed.read_line().await.unwrap().as_deref(), Some("ERROR BUSY"));
        assert_eq!(shed.read_line().await.unwrap(), None);

        held.write_line("BYE").await.unwrap();
        assert_eq!(held.read_line().await.unwrap(), None);

        // The permit comes back once the first session ends.
        let mut admitted = false;
        for _ in 0..50 {
            let mut conn = LineConn::connect(&addr, timeout).await.unwrap();
            if conn.read_line().await.unwrap().as_deref() == Some("READY") {
                conn.write_line("BYE").await.unwrap();
                admitted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(admitted);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }
}
