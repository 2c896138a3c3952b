//! Extract → dedup → deliver/relay pipeline

use crate::config::Config;
use crate::dedup::{Classification, Deduplicator, SharedDeduplicator};
use crate::delivery::{DeliveryClient, DeliveryHandle};
use crate::dom::LiveDocument;
use crate::extractor::Extractor;
use crate::relay::RelaySink;
use crate::types::{ContentUnit, OriginContext};
use capture_relay::{ExtractedBatch, UnitRecord};
use chrono::Utc;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// What one pipeline run found
#[derive(Debug, Default)]
pub struct RunReport {
    /// Units the extractor returned
    pub extracted: usize,
    /// Units classified New, in document order
    pub new_units: Vec<ContentUnit>,
    /// Units classified Seen
    pub seen: usize,
    /// Deliveries started for `new_units`
    pub deliveries: DeliveryHandle,
}

impl RunReport {
    pub fn is_empty(&self) -> bool {
        self.extracted == 0
    }
}

/// Runs extraction against one live document
pub struct CapturePipeline {
    document: LiveDocument,
    extractor: Extractor,
    dedup: SharedDeduplicator,
    delivery: Arc<DeliveryClient>,
    relay: Option<Arc<dyn RelaySink>>,
    origin: RwLock<OriginContext>,
}

impl CapturePipeline {
    pub fn new(
        document: LiveDocument,
        extractor: Extractor,
        dedup: SharedDeduplicator,
        delivery: DeliveryClient,
    ) -> Self {
        Self {
            document,
            extractor,
            dedup,
            delivery: Arc::new(delivery),
            relay: None,
            origin: RwLock::new(OriginContext::default()),
        }
    }

    /// Build every stage from configuration
    pub fn from_config(document: LiveDocument, config: &Config) -> Self {
        Self::new(
            document,
            Extractor::from_config(&config.extraction),
            Deduplicator::new(config.dedup.fingerprint_chars).shared(),
            DeliveryClient::from_config(&config.delivery),
        )
    }

    pub fn with_relay(mut self, relay: Arc<dyn RelaySink>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn document(&self) -> &LiveDocument {
        &self.document
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn set_origin(&self, origin: OriginContext) {
        let mut current = match self.origin.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        info!(
            "Origin changed to {} ({})",
            origin.origin_id, origin.origin_locator
        );
        *current = origin;
    }

    pub fn origin(&self) -> OriginContext {
        match self.origin.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Manual trigger for an on-demand run
    pub async fn trigger(&self) -> RunReport {
        info!("Manual extraction triggered");
        self.run().await
    }

    /// One full pass over the current document.
    ///
    /// Delivery and relay failures are logged here and never returned.
    pub async fn run(&self) -> RunReport {
        let units = {
            let tree = self.document.read();
            self.extractor.extract(&tree)
        };

        if units.is_empty() {
            debug!("ExtractionEmpty: no qualifying content");
            return RunReport::default();
        }
        let extracted = units.len();

        // Whole batch under one lock so overlapping runs cannot both see New
        let new_units: Vec<ContentUnit> = {
            let mut dedup = self.dedup.lock().await;
            units
                .into_iter()
                .filter(|unit| match dedup.classify(unit) {
                    Classification::New => {
                        info!("New content [{}]: {}", unit.source_index, unit.preview(100));
                        true
                    }
                    Classification::Seen => {
                        debug!("Seen content [{}], skipping", unit.source_index);
                        false
                    }
                })
                .collect()
        };
        let seen = extracted - new_units.len();

        let deliveries = DeliveryHandle::spawn_all(&self.delivery, &new_units);

        if !new_units.is_empty() {
            self.forward_to_relay(&new_units).await;
        }

        debug!(
            "Run finished: {} extracted, {} new, {} seen",
            extracted,
            new_units.len(),
            seen
        );

        RunReport {
            extracted,
            new_units,
            seen,
            deliveries,
        }
    }

    async fn forward_to_relay(&self, units: &[ContentUnit]) {
        let Some(relay) = &self.relay else {
            return;
        };

        let origin = self.origin();
        let batch = ExtractedBatch {
            origin_id: origin.origin_id,
            origin_locator: origin.origin_locator,
            captured_at: Utc::now(),
            units: units.iter().map(UnitRecord::from).collect(),
        };

        match relay.append(batch).await {
            Ok(ack) => debug!("Relay stored batch ({:?} entries)", ack.stored),
            Err(e) => warn!("RelayWriteFailure: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::NodeId;
    use crate::relay::RelayError;
    use async_trait::async_trait;
    use capture_relay::RelayAck;
    use tokio::sync::Mutex;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records every batch it is handed
    #[derive(Default)]
    struct RecordingRelay {
        batches: Mutex<Vec<ExtractedBatch>>,
        fail: bool,
    }

    #[async_trait]
    impl RelaySink for RecordingRelay {
        async fn append(&self, batch: ExtractedBatch) -> Result<RelayAck, RelayError> {
            if self.fail {
                return Err(RelayError::Rejected("unavailable".to_string()));
            }
            let mut batches = self.batches.lock().await;
            batches.push(batch);
            Ok(RelayAck::stored(batches.len()))
        }
    }

    fn add_answer(doc: &LiveDocument, text: &str) -> NodeId {
        let root = doc.root();
        doc.mutate(|m| {
            let el = m.create_element("div");
            m.set_attribute(el, "class", "prose").unwrap();
            let t = m.create_text(text);
            m.append_child(el, t).unwrap();
            m.append_child(root, el).unwrap();
            el
        })
    }

    async fn pipeline_for(server: &MockServer, doc: &LiveDocument) -> CapturePipeline {
        let mut config = Config::default();
        config.delivery.endpoint = format!("{}/summarize", server.uri());
        CapturePipeline::from_config(doc.clone(), &config)
    }

    #[tokio::test]
    async fn test_empty_document_is_noop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let doc = LiveDocument::new("body");
        let relay = Arc::new(RecordingRelay::default());
        let pipeline = pipeline_for(&server, &doc).await.with_relay(relay.clone());

        let report = pipeline.run().await;
        assert!(report.is_empty());
        assert!(report.deliveries.is_empty());
        assert!(relay.batches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(2)
            .mount(&server)
            .await;

        let doc = LiveDocument::new("body");
        add_answer(&doc, &"a".repeat(60));
        add_answer(&doc, &"b".repeat(60));
        let relay = Arc::new(RecordingRelay::default());
        let pipeline = pipeline_for(&server, &doc).await.with_relay(relay.clone());
        pipeline.set_origin(OriginContext::new("42", "https://www.perplexity.ai/search/x"));

        let first = pipeline.run().await;
        assert_eq!(first.extracted, 2);
        assert_eq!(first.new_units.len(), 2);
        let reports = first.deliveries.wait().await;
        assert!(reports.iter().all(|r| r.is_success()));

        let second = pipeline.run().await;
        assert_eq!(second.extracted, 2);
        assert!(second.new_units.is_empty());
        assert_eq!(second.seen, 2);
        assert!(second.deliveries.is_empty());

        // Only the run with new content reaches the relay
        let batches = relay.batches.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].origin_id, "42");
        assert_eq!(batches[0].units.len(), 2);
        assert_eq!(batches[0].units[1].index, 1);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let doc = LiveDocument::new("body");
        add_answer(&doc, &"c".repeat(70));
        let relay = Arc::new(RecordingRelay {
            fail: true,
            ..RecordingRelay::default()
        });
        let pipeline = pipeline_for(&server, &doc).await.with_relay(relay);

        let report = pipeline.trigger().await;
        assert_eq!(report.new_units.len(), 1);
        let reports = report.deliveries.wait().await;
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].is_success());
    }

    #[tokio::test]
    async fn test_concurrent_runs_classify_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let doc = LiveDocument::new("body");
        add_answer(&doc, &"d".repeat(90));
        let pipeline = Arc::new(pipeline_for(&server, &doc).await);

        let a = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.run().await }
        });
        let b = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.run().await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a.new_units.len() + b.new_units.len(), 1);
        assert_eq!(a.seen + b.seen, 1);
        a.deliveries.wait().await;
        b.deliveries.wait().await;
    }

    #[tokio::test]
    async fn test_fresh_dedup_per_pipeline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let doc = LiveDocument::new("body");
        add_answer(&doc, &"e".repeat(55));

        for _ in 0..2 {
            let pipeline = pipeline_for(&server, &doc).await;
            let report = pipeline.run().await;
            assert_eq!(report.new_units.len(), 1);
            report.deliveries.wait().await;
        }
    }
}
