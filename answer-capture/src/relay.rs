//! Forwarding of new units to the history relay

use async_trait::async_trait;
use capture_relay::{ExtractedBatch, RelayAck, RelayMessage, RelayServer};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("relay message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("relay rejected batch: {0}")]
    Rejected(String),

    #[error("relay did not answer within {0:?}")]
    Timeout(Duration),
}

/// Destination for captured batches
#[async_trait]
pub trait RelaySink: Send + Sync {
    /// Append one batch; returns the relay's acknowledgement
    async fn append(&self, batch: ExtractedBatch) -> Result<RelayAck, RelayError>;
}

fn accept(ack: RelayAck) -> Result<RelayAck, RelayError> {
    if ack.is_stored() {
        Ok(ack)
    } else {
        let reason = ack.message.unwrap_or_else(|| "no reason given".to_string());
        Err(RelayError::Rejected(reason))
    }
}

/// Talks to a relay server over its Unix socket, one connection per batch
#[derive(Debug, Clone)]
pub struct SocketRelay {
    socket_path: PathBuf,
}

impl SocketRelay {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn exchange(&self, line: String) -> Result<RelayAck, RelayError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (reader, mut writer) = stream.into_split();

        // Newline-delimited JSON both ways
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let mut reader = BufReader::new(reader);
        let mut response = String::new();
        reader.read_line(&mut response).await?;
        if response.trim().is_empty() {
            return Err(RelayError::Rejected("connection closed without ack".to_string()));
        }

        Ok(serde_json::from_str(response.trim())?)
    }
}

#[async_trait]
impl RelaySink for SocketRelay {
    async fn append(&self, batch: ExtractedBatch) -> Result<RelayAck, RelayError> {
        let line = serde_json::to_string(&RelayMessage::extracted_text(batch))?;
        debug!("Forwarding batch to relay at {:?}", self.socket_path);

        let ack = tokio::time::timeout(SOCKET_TIMEOUT, self.exchange(line))
            .await
            .map_err(|_| RelayError::Timeout(SOCKET_TIMEOUT))??;
        accept(ack)
    }
}

/// In-process relay, used when the relay runs inside the same binary
#[async_trait]
impl RelaySink for RelayServer {
    async fn append(&self, batch: ExtractedBatch) -> Result<RelayAck, RelayError> {
        accept(self.process(RelayMessage::extracted_text(batch)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture_relay::{HistoryLog, RelayConfig, UnitRecord};
    use chrono::Utc;
    use std::sync::Arc;

    fn batch(origin_id: &str, text: &str) -> ExtractedBatch {
        ExtractedBatch {
            origin_id: origin_id.to_string(),
            origin_locator: "https://example.com/search?q=1".to_string(),
            captured_at: Utc::now(),
            units: vec![UnitRecord {
                text: text.to_string(),
                index: 0,
            }],
        }
    }

    fn server_at(socket_path: PathBuf) -> RelayServer {
        let config = RelayConfig {
            socket_path,
            ..RelayConfig::default()
        };
        RelayServer::with_history(config, HistoryLog::open_in_memory(50).unwrap())
    }

    #[tokio::test]
    async fn test_in_process_append() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_at(dir.path().join("relay.sock"));

        let ack = server.append(batch("7", "captured text")).await.unwrap();
        assert_eq!(ack.stored, Some(1));

        let history = server.history();
        let entries = history.lock().await.entries().unwrap();
        assert_eq!(entries[0].origin_locator, "https://example.com/search");
    }

    #[tokio::test]
    async fn test_socket_append() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("relay.sock");
        let server = Arc::new(server_at(socket_path.clone()));

        let running = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = running.run().await;
        });

        // Wait for the listener to bind
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let relay = SocketRelay::new(&socket_path);
        let ack = relay.append(batch("1", "first")).await.unwrap();
        assert_eq!(ack.stored, Some(1));
        let ack = relay.append(batch("2", "second")).await.unwrap();
        assert_eq!(ack.stored, Some(2));
    }

    #[tokio::test]
    async fn test_missing_socket_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let relay = SocketRelay::new(dir.path().join("absent.sock"));
        let err = relay.append(batch("1", "text")).await.unwrap_err();
        assert!(matches!(err, RelayError::Io(_)));
    }

    #[test]
    fn test_accept_rejects_unstored_ack() {
        let err = accept(RelayAck::error("disk full")).unwrap_err();
        assert!(matches!(err, RelayError::Rejected(ref reason) if reason == "disk full"));
        assert!(accept(RelayAck::stored(3)).is_ok());
    }
}
