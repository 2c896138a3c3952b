//! Host bridge over native messaging.
//!
//! The browser side mirrors its document into a [`LiveDocument`] by sending
//! framed JSON messages on stdin: a 4-byte little-endian length followed by
//! the body. Every message is acknowledged on stdout with the same framing.

use crate::dom::{DomError, LiveDocument, Mutator, NodeId};
use crate::observer::PendingRuns;
use crate::pipeline::{CapturePipeline, RunReport};
use crate::types::OriginContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Largest accepted message body
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Host key of the document-level anchor
pub const ROOT_KEY: u64 = 0;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("message of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("unknown node key {0}")]
    UnknownKey(u64),

    #[error("node key {0} is reserved for the document root")]
    ReservedKey(u64),

    #[error("node key {0} is already in use")]
    DuplicateKey(u64),

    #[error(transparent)]
    Dom(#[from] DomError),
}

/// Message from the host page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// One group of document changes
    Mutations { ops: Vec<HostOp> },
    /// Run the pipeline now
    Extract,
    /// The page moved to a new location
    Navigate { url: String, origin_id: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostOp {
    Insert { parent: u64, node: HostNode },
    Remove { node: u64 },
    SetAttribute {
        node: u64,
        name: String,
        /// `None` removes the attribute
        value: Option<String>,
    },
    SetText { node: u64, text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostNode {
    Element {
        key: u64,
        tag: String,
        #[serde(default)]
        attributes: BTreeMap<String, String>,
        #[serde(default)]
        children: Vec<HostNode>,
    },
    Text {
        key: u64,
        text: String,
    },
}

impl HostNode {
    pub fn key(&self) -> u64 {
        match self {
            HostNode::Element { key, .. } | HostNode::Text { key, .. } => *key,
        }
    }
}

/// Acknowledgement written back to the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostResponse {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub received: bool,
}

impl HostResponse {
    pub fn received() -> Self {
        Self {
            msg_type: "status".to_string(),
            received: true,
        }
    }
}

/// Read one framed message; `Ok(None)` on a clean end of stream
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<HostMessage>, HostError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(HostError::TooLarge(len));
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer)?;
    Ok(Some(serde_json::from_slice(&buffer)?))
}

/// Write one framed message
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), HostError> {
    let json = serde_json::to_vec(message)?;
    if json.len() > MAX_MESSAGE_BYTES {
        return Err(HostError::TooLarge(json.len()));
    }

    writer.write_all(&(json.len() as u32).to_le_bytes())?;
    writer.write_all(&json)?;
    writer.flush()?;
    Ok(())
}

/// Reader loop (blocking, run in its own thread). A frame that does not
/// parse is acknowledged and skipped. Ends on end of stream, on a read error,
/// on an oversized frame, or when the receiving side is gone.
pub fn run_native_messaging_loop<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    sender: mpsc::Sender<HostMessage>,
) {
    debug!("Starting native messaging loop");

    loop {
        match read_message(&mut reader) {
            Ok(Some(message)) => {
                if let Err(e) = write_message(&mut writer, &HostResponse::received()) {
                    warn!("Failed to send response: {}", e);
                }
                if sender.blocking_send(message).is_err() {
                    error!("Message channel closed, exiting native messaging loop");
                    break;
                }
            }
            Ok(None) => {
                debug!("Host disconnected");
                break;
            }
            Err(HostError::Decode(e)) => {
                warn!("Ignoring malformed host message: {}", e);
                if let Err(e) = write_message(&mut writer, &HostResponse::received()) {
                    warn!("Failed to send response: {}", e);
                }
            }
            Err(e) => {
                error!("Error reading host message: {}", e);
                break;
            }
        }
    }
}

/// Outcome of applying one mutations message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: usize,
    pub skipped: usize,
}

/// Mirrors host nodes into the live document
pub struct HostBridge {
    document: LiveDocument,
    nodes: HashMap<u64, NodeId>,
}

impl HostBridge {
    pub fn new(document: LiveDocument) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_KEY, document.root());
        Self { document, nodes }
    }

    /// Node currently mirrored for a host key
    pub fn node(&self, key: u64) -> Option<NodeId> {
        self.nodes.get(&key).copied()
    }

    /// Apply ops as one transaction, producing a single mutation batch.
    /// Failing ops are logged and skipped.
    pub fn apply(&mut self, ops: Vec<HostOp>) -> ApplyStats {
        let Self { document, nodes } = self;
        document.mutate(|m| {
            let mut stats = ApplyStats::default();
            for op in ops {
                match apply_op(m, nodes, op) {
                    Ok(()) => stats.applied += 1,
                    Err(e) => {
                        warn!("Skipping host op: {}", e);
                        stats.skipped += 1;
                    }
                }
            }
            stats
        })
    }
}

fn lookup(nodes: &HashMap<u64, NodeId>, key: u64) -> Result<NodeId, HostError> {
    nodes.get(&key).copied().ok_or(HostError::UnknownKey(key))
}

fn apply_op(m: &mut Mutator<'_>, nodes: &mut HashMap<u64, NodeId>, op: HostOp) -> Result<(), HostError> {
    trace!("Applying host op {:?}", op);
    match op {
        HostOp::Insert { parent, node } => {
            let parent = lookup(nodes, parent)?;
            check_keys(nodes, &node)?;
            let child = build(m, nodes, node)?;
            m.append_child(parent, child)?;
        }
        HostOp::Remove { node } => {
            let id = lookup(nodes, node)?;
            let mut removed: HashSet<NodeId> = m.tree().descendants(id).into_iter().collect();
            removed.insert(id);
            m.remove(id)?;
            // Keys below the removed node go with it
            nodes.retain(|_, mapped| !removed.contains(mapped));
        }
        HostOp::SetAttribute { node, name, value } => {
            let id = lookup(nodes, node)?;
            match value {
                Some(value) => m.set_attribute(id, &name, &value)?,
                None => m.remove_attribute(id, &name)?,
            }
        }
        HostOp::SetText { node, text } => {
            let id = lookup(nodes, node)?;
            m.set_text(id, &text)?;
        }
    }
    Ok(())
}

/// Every key in the subtree must be new, distinct and not the root's
fn check_keys(nodes: &HashMap<u64, NodeId>, node: &HostNode) -> Result<(), HostError> {
    let mut seen = HashSet::new();
    let mut stack = vec![node];
    while let Some(node) = stack.pop() {
        let key = node.key();
        if key == ROOT_KEY {
            return Err(HostError::ReservedKey(key));
        }
        if nodes.contains_key(&key) || !seen.insert(key) {
            return Err(HostError::DuplicateKey(key));
        }
        if let HostNode::Element { children, .. } = node {
            stack.extend(children);
        }
    }
    Ok(())
}

/// Create a detached subtree; only the final insert is observable
fn build(m: &mut Mutator<'_>, nodes: &mut HashMap<u64, NodeId>, node: HostNode) -> Result<NodeId, HostError> {
    match node {
        HostNode::Element {
            key,
            tag,
            attributes,
            children,
        } => {
            let id = m.create_element(&tag);
            for (name, value) in &attributes {
                m.set_attribute(id, name, value)?;
            }
            for child in children {
                let child = build(m, nodes, child)?;
                m.append_child(id, child)?;
            }
            nodes.insert(key, id);
            Ok(id)
        }
        HostNode::Text { key, text } => {
            let id = m.create_text(&text);
            nodes.insert(key, id);
            Ok(id)
        }
    }
}

/// Routes host messages to the bridge and the pipeline.
///
/// The first mutations message is the host's snapshot of the loaded page;
/// once it is applied the pipeline runs at once, without a settle delay.
pub struct HostSession {
    bridge: HostBridge,
    pipeline: Arc<CapturePipeline>,
    pending: PendingRuns,
    snapshot_applied: bool,
}

impl HostSession {
    pub fn new(pipeline: Arc<CapturePipeline>, pending: PendingRuns) -> Self {
        Self {
            bridge: HostBridge::new(pipeline.document().clone()),
            pipeline,
            pending,
            snapshot_applied: false,
        }
    }

    pub fn bridge(&self) -> &HostBridge {
        &self.bridge
    }

    /// Handle one message; returns the pipeline run it started, if any
    pub fn handle(&mut self, message: HostMessage) -> Option<JoinHandle<RunReport>> {
        match message {
            HostMessage::Mutations { ops } => {
                let stats = self.bridge.apply(ops);
                trace!("Applied {} host ops, skipped {}", stats.applied, stats.skipped);
                if self.snapshot_applied {
                    return None;
                }
                self.snapshot_applied = true;
                info!("Initial snapshot applied ({} ops), extracting", stats.applied);
                Some(self.spawn_trigger())
            }
            HostMessage::Extract => Some(self.spawn_trigger()),
            HostMessage::Navigate { url, origin_id } => {
                self.pipeline.set_origin(OriginContext::new(origin_id, url));
                None
            }
            HostMessage::Unknown => {
                trace!("Ignoring unknown host message");
                None
            }
        }
    }

    fn spawn_trigger(&self) -> JoinHandle<RunReport> {
        let pipeline = Arc::clone(&self.pipeline);
        self.pending.spawn(async move { pipeline.trigger().await })
    }
}
