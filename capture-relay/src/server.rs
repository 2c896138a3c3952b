//! Unix socket server for receiving extracted-text batches

use crate::payload::{ExtractedBatch, RelayAck, RelayMessage, EXTRACTED_TEXT_ACTION};
use crate::storage::{HistoryLog, StorageError, DEFAULT_CAPACITY};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Length of the per-unit previews written to the log
const PREVIEW_CHARS: usize = 100;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Path to the Unix socket
    pub socket_path: PathBuf,
    /// Path to the SQLite database
    pub db_path: PathBuf,
    /// Maximum number of history entries kept
    pub capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("answer-capture");

        Self {
            socket_path: PathBuf::from("/tmp/answer-capture-relay.sock"),
            db_path: data_dir.join("history.db"),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Relay that listens on a Unix socket and appends batches to the history
pub struct RelayServer {
    config: RelayConfig,
    history: Arc<Mutex<HistoryLog>>,
}

impl RelayServer {
    /// Create a new server with the given configuration
    pub fn new(config: RelayConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let history = HistoryLog::open(&config.db_path, config.capacity)?;
        Ok(Self::with_history(config, history))
    }

    /// Create a server around an already opened history
    pub fn with_history(config: RelayConfig, history: HistoryLog) -> Self {
        Self {
            config,
            history: Arc::new(Mutex::new(history)),
        }
    }

    /// Start the server and listen for connections
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path)?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)?;
        info!("Relay listening on {:?}", self.config.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let history = Arc::clone(&self.history);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, history).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Get the socket path
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Process a single message (for direct integration without socket)
    pub async fn process(&self, message: RelayMessage) -> RelayAck {
        let mut history = self.history.lock().await;
        process_message(&mut history, message)
    }

    /// Shared handle to the history, for inspection
    pub fn history(&self) -> Arc<Mutex<HistoryLog>> {
        Arc::clone(&self.history)
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    history: Arc<Mutex<HistoryLog>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    // One JSON message per line
    while reader.read_line(&mut line).await? > 0 {
        let ack = match serde_json::from_str::<RelayMessage>(&line) {
            Ok(message) => {
                let mut history = history.lock().await;
                process_message(&mut history, message)
            }
            Err(e) => {
                warn!("Failed to parse relay message: {}", e);
                RelayAck::error(&format!("Parse error: {}", e))
            }
        };

        let ack_json = serde_json::to_string(&ack)?;
        writer.write_all(ack_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

/// Process a single message while holding the history lock
fn process_message(history: &mut HistoryLog, message: RelayMessage) -> RelayAck {
    if message.action != EXTRACTED_TEXT_ACTION {
        debug!("Ignoring relay action: {}", message.action);
        return RelayAck::ignored("Unknown action");
    }

    let Some(mut batch) = message.data else {
        warn!("extractedText message without data");
        return RelayAck::error("Missing data");
    };

    batch.origin_locator = normalize_locator(&batch.origin_locator);
    log_batch(&batch);

    match history.append(&batch) {
        Ok(total) => {
            info!("Batch stored. Total entries: {}", total);
            RelayAck::stored(total)
        }
        Err(e) => {
            error!("History append error: {}", e);
            RelayAck::error(&format!("Storage error: {}", e))
        }
    }
}

fn log_batch(batch: &ExtractedBatch) {
    info!(
        "Received {} units from {} ({})",
        batch.units.len(),
        batch.origin_id,
        batch.origin_locator
    );

    for unit in &batch.units {
        let char_count = unit.text.chars().count();
        let preview: String = unit.text.chars().take(PREVIEW_CHARS).collect();
        let ellipsis = if char_count > PREVIEW_CHARS { "..." } else { "" };
        debug!(
            "Unit {}: {}{} ({} chars)",
            unit.index, preview, ellipsis, char_count
        );
    }
}

/// Strip query parameters and fragments so the same page is logged under one locator
fn normalize_locator(locator: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(locator) {
        parsed.set_query(None);
        parsed.set_fragment(None);
        parsed.to_string()
    } else {
        locator.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::UnitRecord;
    use chrono::Utc;

    fn make_server(capacity: usize) -> RelayServer {
        let config = RelayConfig {
            socket_path: PathBuf::from("/tmp/unused.sock"),
            db_path: PathBuf::from(":memory:"),
            capacity,
        };
        RelayServer::with_history(config, HistoryLog::open_in_memory(capacity).unwrap())
    }

    fn make_message(origin_id: &str, locator: &str) -> RelayMessage {
        RelayMessage::extracted_text(ExtractedBatch {
            origin_id: origin_id.to_string(),
            origin_locator: locator.to_string(),
            captured_at: Utc::now(),
            units: vec![UnitRecord {
                text: "x".repeat(120),
                index: 0,
            }],
        })
    }

    #[test]
    fn test_normalize_locator() {
        assert_eq!(
            normalize_locator("https://www.perplexity.ai/search/abc?q=1#frag"),
            "https://www.perplexity.ai/search/abc"
        );
        assert_eq!(normalize_locator(""), "");
        assert_eq!(normalize_locator("not a url"), "not a url");
    }

    #[tokio::test]
    async fn test_process_stores_batch() {
        let server = make_server(DEFAULT_CAPACITY);
        let ack = server
            .process(make_message("7", "https://www.perplexity.ai/search/abc?x=1"))
            .await;
        assert!(ack.is_stored());
        assert_eq!(ack.stored, Some(1));

        let history = server.history();
        let history = history.lock().await;
        let entries = history.entries().unwrap();
        assert_eq!(entries[0].origin_locator, "https://www.perplexity.ai/search/abc");
    }

    #[tokio::test]
    async fn test_process_ignores_other_actions() {
        let server = make_server(DEFAULT_CAPACITY);
        let ack = server
            .process(RelayMessage {
                action: "ping".to_string(),
                data: None,
            })
            .await;
        assert!(ack.received);
        assert!(!ack.is_stored());
        assert!(server.history().lock().await.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_process_rejects_missing_data() {
        let server = make_server(DEFAULT_CAPACITY);
        let ack = server
            .process(RelayMessage {
                action: EXTRACTED_TEXT_ACTION.to_string(),
                data: None,
            })
            .await;
        assert!(!ack.received);
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig {
            socket_path: dir.path().join("relay.sock"),
            db_path: dir.path().join("history.db"),
            capacity: 3,
        };
        let server = Arc::new(RelayServer::new(config.clone()).unwrap());

        let running = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = running.run().await;
        });

        // Wait for the listener to bind
        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = UnixStream::connect(&config.socket_path).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let stream = stream.expect("relay socket never came up");
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        for i in 0..4 {
            let line = serde_json::to_string(&make_message(&i.to_string(), "")).unwrap();
            writer.write_all(line.as_bytes()).await.unwrap();
            writer.write_all(b"\n").await.unwrap();

            let mut response = String::new();
            reader.read_line(&mut response).await.unwrap();
            let ack: RelayAck = serde_json::from_str(&response).unwrap();
            assert_eq!(ack.stored, Some((i + 1).min(3)));
        }

        writer.write_all(b"not json\n").await.unwrap();
        let mut response = String::new();
        reader.read_line(&mut response).await.unwrap();
        let ack: RelayAck = serde_json::from_str(&response).unwrap();
        assert!(!ack.received);
    }
}
