//! Extraction of answer blocks from the live document.

use crate::config::ExtractionConfig;
use crate::dom::{DocumentTree, NodeId};
use crate::types::ContentUnit;
use tracing::{debug, trace};

/// Structural pattern an answer block matches: a tag plus either a style
/// class or an identifier prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionPattern {
    /// Required tag; `None` accepts any element
    pub tag: Option<String>,
    pub class_name: String,
    pub id_prefix: String,
}

impl ExtractionPattern {
    pub fn new(tag: Option<&str>, class_name: &str, id_prefix: &str) -> Self {
        Self {
            tag: tag.map(str::to_ascii_lowercase),
            class_name: class_name.to_string(),
            id_prefix: id_prefix.to_string(),
        }
    }

    pub fn from_config(config: &ExtractionConfig) -> Self {
        let tag = (!config.tag.is_empty()).then_some(config.tag.as_str());
        Self::new(tag, &config.class_name, &config.id_prefix)
    }

    /// Whether the node is an element carrying the class or the id prefix,
    /// whatever its tag
    pub fn has_marker(&self, tree: &DocumentTree, id: NodeId) -> bool {
        tree.is_element(id)
            && (tree.has_class(id, &self.class_name)
                || tree
                    .attribute(id, "id")
                    .is_some_and(|value| value.starts_with(&self.id_prefix)))
    }

    /// Whether the node itself is an answer block
    pub fn matches(&self, tree: &DocumentTree, id: NodeId) -> bool {
        let Some(tag) = tree.tag(id) else {
            return false;
        };
        if self.tag.as_deref().is_some_and(|wanted| wanted != tag) {
            return false;
        }
        self.has_marker(tree, id)
    }

    /// Whether the node carries the marker or holds an answer block below it
    pub fn matches_within(&self, tree: &DocumentTree, id: NodeId) -> bool {
        self.has_marker(tree, id)
            || tree
                .descendants(id)
                .into_iter()
                .any(|node| self.matches(tree, node))
    }
}

/// Finds answer blocks and turns them into content units
#[derive(Debug, Clone)]
pub struct Extractor {
    pattern: ExtractionPattern,
    min_chars: usize,
}

impl Extractor {
    pub fn new(pattern: ExtractionPattern, min_chars: usize) -> Self {
        Self { pattern, min_chars }
    }

    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self::new(ExtractionPattern::from_config(config), config.min_chars)
    }

    pub fn pattern(&self) -> &ExtractionPattern {
        &self.pattern
    }

    /// Query the tree once and return qualifying units in document order.
    ///
    /// Units whose trimmed text is `min_chars` characters or shorter are
    /// dropped; `source_index` keeps the position among all matched elements.
    pub fn extract(&self, tree: &DocumentTree) -> Vec<ContentUnit> {
        let matched = tree.find_all(|t, id| self.pattern.matches(t, id));
        debug!("Extractor matched {} elements", matched.len());

        matched
            .into_iter()
            .enumerate()
            .filter_map(|(index, node)| {
                let text = tree.text_content(node);
                let text = text.trim();
                let len = text.chars().count();
                if len > self.min_chars {
                    Some(ContentUnit::new(text, index))
                } else {
                    trace!("Skipping element {} ({} chars)", index, len);
                    None
                }
            })
            .collect()
    }
}
