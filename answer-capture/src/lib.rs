//! Answer Capture - change-driven capture of new answer content
//!
//! Watches a live document for structural changes and, once the document
//! settles, extracts answer blocks, drops content already seen this session
//! and forwards each new block to a processing endpoint. New blocks are also
//! handed to the capture relay, which keeps a bounded history.
//!
//! # Architecture
//!
//! The host page mirrors its document over native messaging ([`host`]) into a
//! [`LiveDocument`]. A [`ChangeObserver`] subscribes to the document and
//! schedules [`CapturePipeline`] runs: [`Extractor`] → [`Deduplicator`] →
//! [`DeliveryClient`] plus an optional [`RelaySink`].

pub mod config;
pub mod dedup;
pub mod delivery;
pub mod dom;
pub mod extractor;
pub mod host;
pub mod observer;
pub mod pipeline;
pub mod relay;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use dedup::{Classification, Deduplicator, Fingerprint, SharedDeduplicator};
pub use delivery::{DeliveryClient, DeliveryError, DeliveryHandle, DeliveryReport};
pub use dom::{DocumentTree, LiveDocument, MutationBatch, MutationRecord, NodeId, ObserveOptions};
pub use extractor::{ExtractionPattern, Extractor};
pub use host::{HostBridge, HostError, HostMessage, HostNode, HostOp, HostSession};
pub use observer::{ChangeObserver, Dispatch, PendingRuns};
pub use pipeline::{CapturePipeline, RunReport};
pub use relay::{RelayError, RelaySink, SocketRelay};
pub use types::{ContentUnit, DeliveryPayload, OriginContext};
