//! Relay message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Action name carried by batches of extracted text
pub const EXTRACTED_TEXT_ACTION: &str = "extractedText";

/// Message received from a capture process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    /// What the sender wants done; only "extractedText" is stored
    pub action: String,

    /// Batch payload, absent for control messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ExtractedBatch>,
}

impl RelayMessage {
    pub fn extracted_text(batch: ExtractedBatch) -> Self {
        Self {
            action: EXTRACTED_TEXT_ACTION.to_string(),
            data: Some(batch),
        }
    }
}

/// New units discovered by one pipeline run, plus where they came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedBatch {
    /// Opaque identifier of the originating document (e.g. a tab id)
    pub origin_id: String,

    /// Where the document lives (URL, or empty string if unknown)
    pub origin_locator: String,

    /// When the units were captured
    pub captured_at: DateTime<Utc>,

    /// Units in document order
    pub units: Vec<UnitRecord>,
}

/// One captured text unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub text: String,
    /// Position among matched elements at extraction time
    pub index: usize,
}

/// Acknowledgement sent back for every message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAck {
    pub received: bool,
    /// Number of history entries held after the append
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RelayAck {
    pub fn stored(total: usize) -> Self {
        Self {
            received: true,
            stored: Some(total),
            message: None,
        }
    }

    pub fn ignored(reason: &str) -> Self {
        Self {
            received: true,
            stored: None,
            message: Some(reason.to_string()),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            received: false,
            stored: None,
            message: Some(message.to_string()),
        }
    }

    /// Whether the relay persisted the batch
    pub fn is_stored(&self) -> bool {
        self.received && self.stored.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_uses_camel_case() {
        let batch = ExtractedBatch {
            origin_id: "17".to_string(),
            origin_locator: "https://www.perplexity.ai/search/abc".to_string(),
            captured_at: Utc::now(),
            units: vec![UnitRecord {
                text: "Some answer".to_string(),
                index: 2,
            }],
        };

        let json = serde_json::to_value(RelayMessage::extracted_text(batch)).unwrap();
        assert_eq!(json["action"], "extractedText");
        assert_eq!(json["data"]["originId"], "17");
        assert_eq!(json["data"]["originLocator"], "https://www.perplexity.ai/search/abc");
        assert!(json["data"]["capturedAt"].is_string());
        assert_eq!(json["data"]["units"][0]["index"], 2);
    }

    #[test]
    fn test_control_message_without_data() {
        let message: RelayMessage = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert_eq!(message.action, "ping");
        assert!(message.data.is_none());
    }

    #[test]
    fn test_ack_shapes() {
        assert!(RelayAck::stored(3).is_stored());
        assert!(!RelayAck::ignored("unknown action").is_stored());
        assert!(!RelayAck::error("boom").received);
    }
}
