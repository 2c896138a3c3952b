//! Live document model.
//!
//! The host document is mirrored as an arena tree behind a cloneable
//! [`LiveDocument`] handle. Changes are applied in [`LiveDocument::mutate`]
//! transactions, and every record produced by one transaction reaches each
//! subscriber as a single [`MutationBatch`], the same way a browser delivers
//! mutation observer callbacks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use tokio::sync::mpsc;
use tracing::trace;

/// Index of a node in the document arena
pub type NodeId = usize;

/// Records delivered together to one subscriber
pub type MutationBatch = Vec<MutationRecord>;

/// Errors raised by tree mutations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomError {
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Node {0} is not an element")]
    NotAnElement(NodeId),

    #[error("Node {0} is not a text node")]
    NotText(NodeId),

    #[error("Cannot insert node {child} under {parent}")]
    Hierarchy { parent: NodeId, child: NodeId },
}

/// Payload of a node
#[derive(Debug, Clone)]
pub enum NodeData {
    Element {
        tag: String,
        attributes: BTreeMap<String, String>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Read-only view of the document tree
///
/// Detached nodes stay in the arena, so a record that names a node removed
/// later can still be inspected.
#[derive(Debug, Clone)]
pub struct DocumentTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl DocumentTree {
    fn new(root_tag: &str) -> Self {
        Self {
            nodes: vec![Node {
                data: NodeData::Element {
                    tag: root_tag.to_string(),
                    attributes: BTreeMap::new(),
                },
                parent: None,
                children: Vec::new(),
            }],
            root: 0,
        }
    }

    /// The document-level anchor all observation starts from
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        id < self.nodes.len()
    }

    pub fn data(&self, id: NodeId) -> Option<&NodeData> {
        self.nodes.get(id).map(|n| &n.data)
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.data(id), Some(NodeData::Element { .. }))
    }

    /// Lowercase tag name of an element
    pub fn tag(&self, id: NodeId) -> Option<&str> {
        match self.data(id)? {
            NodeData::Element { tag, .. } => Some(tag.as_str()),
            NodeData::Text(_) => None,
        }
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        match self.data(id)? {
            NodeData::Element { attributes, .. } => attributes.get(name).map(String::as_str),
            NodeData::Text(_) => None,
        }
    }

    /// Whitespace-separated entries of the `class` attribute
    pub fn has_class(&self, id: NodeId, class_name: &str) -> bool {
        self.attribute(id, "class")
            .map(|classes| classes.split_whitespace().any(|c| c == class_name))
            .unwrap_or(false)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id)?.parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// Inclusive ancestor chain, starting at `id`
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = self.contains_node(id).then_some(id);
        while let Some(node) = current {
            chain.push(node);
            current = self.parent(node);
        }
        chain
    }

    /// Whether `ancestor` is `node` or one of its ancestors
    pub fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.ancestors(node).contains(&ancestor)
    }

    /// Whether the node is reachable from the root
    pub fn is_attached(&self, id: NodeId) -> bool {
        self.is_inclusive_ancestor(self.root, id)
    }

    /// Descendants of `id` in document order, excluding `id` itself
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children(node).iter().rev().copied());
        }
        out
    }

    /// Elements under the root (root included) satisfying `pred`, in document order
    pub fn find_all<F>(&self, mut pred: F) -> Vec<NodeId>
    where
        F: FnMut(&Self, NodeId) -> bool,
    {
        std::iter::once(self.root)
            .chain(self.descendants(self.root))
            .filter(|&id| self.is_element(id) && pred(self, id))
            .collect()
    }

    /// Concatenated text of all descendant text nodes
    pub fn text_content(&self, id: NodeId) -> String {
        let mut text = String::new();
        if let Some(NodeData::Text(t)) = self.data(id) {
            text.push_str(t);
            return text;
        }
        for node in self.descendants(id) {
            if let Some(NodeData::Text(t)) = self.data(node) {
                text.push_str(t);
            }
        }
        text
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, DomError> {
        self.nodes.get_mut(id).ok_or(DomError::UnknownNode(id))
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        self.nodes.push(Node {
            data,
            parent: None,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    fn detach(&mut self, id: NodeId) -> Result<Option<NodeId>, DomError> {
        let parent = self.node_mut(id)?.parent.take();
        if let Some(parent) = parent {
            self.node_mut(parent)?.children.retain(|&c| c != id);
        }
        Ok(parent)
    }
}

/// What changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    ChildList {
        added: Vec<NodeId>,
        removed: Vec<NodeId>,
    },
    Attributes {
        name: String,
    },
    CharacterData,
}

/// One structural change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub target: NodeId,
    pub kind: MutationKind,
}

impl MutationRecord {
    /// Nodes inserted by this change
    pub fn added_nodes(&self) -> &[NodeId] {
        match &self.kind {
            MutationKind::ChildList { added, .. } => added,
            _ => &[],
        }
    }
}

/// Which changes a subscription wants to see
#[derive(Debug, Clone, Default)]
pub struct ObserveOptions {
    pub child_list: bool,
    pub attributes: bool,
    pub character_data: bool,
    /// Watch the whole subtree instead of the root only
    pub subtree: bool,
    /// Attribute names to report; `None` reports all
    pub attribute_filter: Option<Vec<String>>,
}

impl ObserveOptions {
    fn accepts(&self, root: NodeId, record: &PendingRecord) -> bool {
        let in_scope = if self.subtree {
            record.target_chain.contains(&root)
        } else {
            record.record.target == root
        };
        if !in_scope {
            return false;
        }

        match &record.record.kind {
            MutationKind::ChildList { .. } => self.child_list,
            MutationKind::CharacterData => self.character_data,
            MutationKind::Attributes { name } => {
                self.attributes
                    && self
                        .attribute_filter
                        .as_ref()
                        .map_or(true, |filter| filter.iter().any(|f| f == name))
            }
        }
    }
}

/// A record plus the target's ancestor chain at the time it was made
struct PendingRecord {
    record: MutationRecord,
    target_chain: Vec<NodeId>,
}

/// Handle used inside [`LiveDocument::mutate`] to change the tree
pub struct Mutator<'a> {
    tree: &'a mut DocumentTree,
    pending: Vec<PendingRecord>,
}

impl Mutator<'_> {
    /// Read access to the tree in its current, partially mutated state
    pub fn tree(&self) -> &DocumentTree {
        self.tree
    }

    /// Create a detached element; no record until it is inserted
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.tree.push(NodeData::Element {
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
        })
    }

    /// Create a detached text node
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.tree.push(NodeData::Text(text.to_string()))
    }

    /// Append `child` as the last child of `parent`, moving it if attached elsewhere
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        if !self.tree.is_element(parent) {
            return Err(if self.tree.contains_node(parent) {
                DomError::NotAnElement(parent)
            } else {
                DomError::UnknownNode(parent)
            });
        }
        if !self.tree.contains_node(child) {
            return Err(DomError::UnknownNode(child));
        }
        if child == self.tree.root || self.tree.is_inclusive_ancestor(child, parent) {
            return Err(DomError::Hierarchy { parent, child });
        }

        if self.tree.parent(child).is_some() {
            self.remove(child)?;
        }

        self.tree.node_mut(child)?.parent = Some(parent);
        self.tree.node_mut(parent)?.children.push(child);
        self.record(
            parent,
            MutationKind::ChildList {
                added: vec![child],
                removed: Vec::new(),
            },
        );
        Ok(())
    }

    /// Detach a node from its parent; a no-op for already detached nodes
    pub fn remove(&mut self, node: NodeId) -> Result<(), DomError> {
        if node == self.tree.root {
            return Err(DomError::Hierarchy {
                parent: node,
                child: node,
            });
        }
        if let Some(parent) = self.tree.detach(node)? {
            self.record(
                parent,
                MutationKind::ChildList {
                    added: Vec::new(),
                    removed: vec![node],
                },
            );
        }
        Ok(())
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        match &mut self.tree.node_mut(node)?.data {
            NodeData::Element { attributes, .. } => {
                attributes.insert(name.to_string(), value.to_string());
            }
            NodeData::Text(_) => return Err(DomError::NotAnElement(node)),
        }
        self.record(
            node,
            MutationKind::Attributes {
                name: name.to_string(),
            },
        );
        Ok(())
    }

    pub fn remove_attribute(&mut self, node: NodeId, name: &str) -> Result<(), DomError> {
        let removed = match &mut self.tree.node_mut(node)?.data {
            NodeData::Element { attributes, .. } => attributes.remove(name).is_some(),
            NodeData::Text(_) => return Err(DomError::NotAnElement(node)),
        };
        if removed {
            self.record(
                node,
                MutationKind::Attributes {
                    name: name.to_string(),
                },
            );
        }
        Ok(())
    }

    /// Replace the data of a text node
    pub fn set_text(&mut self, node: NodeId, text: &str) -> Result<(), DomError> {
        match &mut self.tree.node_mut(node)?.data {
            NodeData::Text(t) => *t = text.to_string(),
            NodeData::Element { .. } => return Err(DomError::NotText(node)),
        }
        self.record(node, MutationKind::CharacterData);
        Ok(())
    }

    fn record(&mut self, target: NodeId, kind: MutationKind) {
        let target_chain = self.tree.ancestors(target);
        self.pending.push(PendingRecord {
            record: MutationRecord { target, kind },
            target_chain,
        });
    }
}

struct Registration {
    root: NodeId,
    options: ObserveOptions,
    tx: mpsc::UnboundedSender<MutationBatch>,
}

struct Shared {
    tree: RwLock<DocumentTree>,
    registrations: Mutex<Vec<Registration>>,
}

/// Cloneable handle to the live document
#[derive(Clone)]
pub struct LiveDocument {
    shared: Arc<Shared>,
}

impl LiveDocument {
    /// Create an empty document whose root element has the given tag
    pub fn new(root_tag: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                tree: RwLock::new(DocumentTree::new(root_tag)),
                registrations: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Read-only view; do not hold it across an await
    pub fn read(&self) -> RwLockReadGuard<'_, DocumentTree> {
        self.shared
            .tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> NodeId {
        self.read().root()
    }

    /// Subscribe to changes under `root`
    pub fn observe(&self, root: NodeId, options: ObserveOptions) -> MutationSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration { root, options, tx });
        MutationSubscription { rx }
    }

    /// Apply a group of changes and notify subscribers once
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Mutator<'_>) -> R) -> R {
        let (result, pending) = {
            let mut tree = self
                .shared
                .tree
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut mutator = Mutator {
                tree: &mut *tree,
                pending: Vec::new(),
            };
            let result = f(&mut mutator);
            (result, mutator.pending)
        };

        if !pending.is_empty() {
            self.notify(&pending);
        }
        result
    }

    fn notify(&self, pending: &[PendingRecord]) {
        let mut registrations = self
            .shared
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        registrations.retain(|registration| {
            let batch: MutationBatch = pending
                .iter()
                .filter(|p| registration.options.accepts(registration.root, p))
                .map(|p| p.record.clone())
                .collect();

            if batch.is_empty() {
                return !registration.tx.is_closed();
            }

            trace!("Delivering batch of {} mutation records", batch.len());
            registration.tx.send(batch).is_ok()
        });
    }
}

/// Lazy, unbounded stream of mutation batches for one subscriber
pub struct MutationSubscription {
    rx: mpsc::UnboundedReceiver<MutationBatch>,
}

impl MutationSubscription {
    /// Wait for the next batch; `None` once the document is gone
    pub async fn next_batch(&mut self) -> Option<MutationBatch> {
        self.rx.recv().await
    }

    /// Take a batch if one is already queued
    pub fn try_next_batch(&mut self) -> Option<MutationBatch> {
        self.rx.try_recv().ok()
    }
}
