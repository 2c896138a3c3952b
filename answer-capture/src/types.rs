//! Core types shared by the capture pipeline.

use capture_relay::UnitRecord;
use serde::{Deserialize, Serialize};

/// One candidate block of text found by the extractor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUnit {
    /// Trimmed, non-empty text of the matched element
    pub text: String,
    /// Position among matched elements at extraction time
    pub source_index: usize,
}

impl ContentUnit {
    pub fn new(text: impl Into<String>, source_index: usize) -> Self {
        Self {
            text: text.into(),
            source_index,
        }
    }

    /// Short single-line preview for logs
    pub fn preview(&self, max_chars: usize) -> String {
        let preview: String = self.text.chars().take(max_chars).collect();
        if self.text.chars().count() > max_chars {
            format!("{}...", preview.replace('\n', " "))
        } else {
            preview.replace('\n', " ")
        }
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

impl From<&ContentUnit> for UnitRecord {
    fn from(unit: &ContentUnit) -> Self {
        UnitRecord {
            text: unit.text.clone(),
            index: unit.source_index,
        }
    }
}

/// Body posted to the processing endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    /// Constant naming the site the content came from
    pub source: String,
    pub content: String,
}

/// Identifies the document units were captured from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginContext {
    /// Opaque host identifier (e.g. a tab id)
    pub origin_id: String,
    /// Where the document lives (URL, or empty string if unknown)
    pub origin_locator: String,
}

impl OriginContext {
    pub fn new(origin_id: impl Into<String>, origin_locator: impl Into<String>) -> Self {
        Self {
            origin_id: origin_id.into(),
            origin_locator: origin_locator.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates() {
        let unit = ContentUnit::new("a".repeat(150), 0);
        let preview = unit.preview(100);
        assert_eq!(preview.len(), 103);
        assert!(preview.ends_with("..."));

        let short = ContentUnit::new("line one\nline two", 1);
        assert_eq!(short.preview(100), "line one line two");
    }

    #[test]
    fn test_unit_record_conversion() {
        let unit = ContentUnit::new("text", 4);
        let record = UnitRecord::from(&unit);
        assert_eq!(record.text, "text");
        assert_eq!(record.index, 4);
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = DeliveryPayload {
            source: "perplexity".to_string(),
            content: "hello".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"source": "perplexity", "content": "hello"}));
    }
}
