//! Plaintext line protocol over TCP
//!
//! One sample per line: `<key> <value> <unixSeconds>\n`. A malformed line
//! is logged and skipped; only a failed read closes the connection.

use super::forward;
use crossbeam_channel::Sender;
use std::net::SocketAddr;
use tempora_core::{Metric, Result, TemporaError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Parse one plaintext line
pub fn parse_line(line: &str) -> Result<Metric> {
    let parts: Vec<&str> = line.trim_end_matches(['\r', '\n']).splitn(4, ' ').collect();
    if parts.len() != 3 {
        return Err(TemporaError::Decode(format!(
            "found {} parts, expected 3",
            parts.len()
        )));
    }

    let value: f64 = parts[1]
        .parse()
        .map_err(|_| TemporaError::Decode(format!("invalid value '{}'", parts[1])))?;
    let unix: i64 = parts[2]
        .trim()
        .parse()
        .map_err(|_| TemporaError::Decode(format!("invalid timestamp '{}'", parts[2])))?;

    Metric::try_from_unix(parts[0], value, unix)
}

/// Accept connections until `cancel` fires
pub async fn serve(listener: TcpListener, sink: Sender<Metric>, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!("Line protocol listening on {}", addr);
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_conn(stream, peer, sink.clone(), cancel.clone()));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }

    info!("Line protocol listener stopped");
}

async fn handle_conn(
    stream: TcpStream,
    peer: SocketAddr,
    sink: Sender<Metric>,
    cancel: CancellationToken,
) {
    debug!(%peer, "Connection opened");
    let mut lines = BufReader::new(stream).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok(metric) => {
                        if let Err(e) = forward(&sink, vec![metric]).await {
                            warn!(%peer, error = %e, "Dropping connection");
                            break;
                        }
                    }
                    Err(e) => warn!(%peer, error = %e, "Skipping malformed line"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "Read failed");
                break;
            }
        }
    }

    debug!(%peer, "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_line() {
        let m = parse_line("servers.web01.load 3.14159 1485004710\n").unwrap();
        assert_eq!(m.key, "servers.web01.load");
        assert_eq!(m.value, 3.14159);
        assert_eq!(m.unix_seconds(), 1485004710);
        assert!(m.metadata.is_empty());
    }

    #[test]
    fn test_malformed_lines() {
        for line in [
            "foo 1",
            "foo 1 2 3",
            "foo bar 1485004710",
            "foo 1.0 yesterday",
            "foo 1 99999999999",
            "foo 1 -99999999999",
            "",
        ] {
            assert!(
                matches!(parse_line(line), Err(TemporaError::Decode(_))),
                "accepted {:?}",
                line
            );
        }
    }

    #[tokio::test]
    async fn test_connection_survives_bad_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = crossbeam_channel::bounded(16);
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, tx, cancel.clone()));

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"a 1 100\nnot a metric\nb 2 200\n").await.unwrap();
        conn.flush().await.unwrap();

        let mut received = Vec::new();
        for _ in 0..200 {
            while let Ok(m) = rx.try_recv() {
                received.push(m);
            }
            if received.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let keys: Vec<_> = received.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        cancel.cancel();
        server.await.unwrap();
    }
}
