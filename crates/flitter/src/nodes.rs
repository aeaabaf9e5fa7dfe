//! Scene-graph nodes: the output of evaluating a program.
//!
//! A node has a kind, a set of tags, an insertion-ordered attribute map and
//! an ordered sequence of children. Nodes are immutable; every update copies.
//! Renderers receive one subtree per frame and read attributes through the
//! typed getters.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{hashing::StableHasher, symbols::Symbol, values::Vector};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: Symbol,
    pub tags: SmallVec<[Symbol; 4]>,
    pub attributes: IndexMap<Symbol, Vector>,
    pub children: Vec<Arc<Node>>,
}

impl Node {
    #[must_use]
    pub fn new(kind: Symbol) -> Self {
        Self {
            kind,
            tags: SmallVec::new(),
            attributes: IndexMap::new(),
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tags(kind: Symbol, tags: impl IntoIterator<Item = Symbol>) -> Self {
        let mut node = Self::new(kind);
        for tag in tags {
            node.add_tag(tag);
        }
        node
    }

    pub fn add_tag(&mut self, tag: Symbol) {
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    #[must_use]
    pub fn tagged(&self, tag: Symbol) -> Self {
        let mut node = self.clone();
        node.add_tag(tag);
        node
    }

    /// Sets an attribute; a null value removes it instead.
    pub fn set_attribute(&mut self, name: Symbol, value: Vector) {
        if value.is_null() {
            self.attributes.shift_remove(&name);
        } else {
            self.attributes.insert(name, value);
        }
    }

    #[must_use]
    pub fn get(&self, name: Symbol) -> Option<&Vector> {
        self.attributes.get(&name)
    }

    /// The attribute as exactly `count` numbers, cycling a shorter vector.
    #[must_use]
    pub fn get_f64s(&self, name: Symbol, count: usize) -> Option<Vec<f64>> {
        let xs = self.get(name)?.numbers()?;
        if xs.is_empty() {
            return None;
        }
        Some((0..count).map(|i| xs[i % xs.len()]).collect())
    }

    #[must_use]
    pub fn get_f64(&self, name: Symbol) -> Option<f64> {
        self.get(name)?.as_f64()
    }

    #[must_use]
    pub fn get_bool(&self, name: Symbol) -> Option<bool> {
        Some(self.get(name)?.truthy())
    }

    #[must_use]
    pub fn get_string(&self, name: Symbol) -> Option<String> {
        self.get(name)?.as_string()
    }

    pub fn append(&mut self, child: Arc<Self>) {
        self.children.push(child);
    }

    pub fn extend(&mut self, children: impl IntoIterator<Item = Arc<Self>>) {
        self.children.extend(children);
    }

    /// Direct children of the given kind, in document order.
    pub fn children_of_kind(&self, kind: Symbol) -> impl Iterator<Item = &Arc<Self>> {
        self.children.iter().filter(move |child| child.kind == kind)
    }

    /// All descendants matching `query`, in document order.
    #[must_use]
    pub fn select_below(&self, query: &NodeQuery) -> Vec<Arc<Self>> {
        let mut matches = Vec::new();
        for child in &self.children {
            child.collect_matches(query, &mut matches);
        }
        matches
    }

    fn collect_matches(self: &Arc<Self>, query: &NodeQuery, matches: &mut Vec<Arc<Self>>) {
        if query.matches(self) {
            matches.push(self.clone());
        }
        for child in &self.children {
            child.collect_matches(query, matches);
        }
    }

    /// Structure-sensitive stable hash over kind, tags, attributes and
    /// children.
    #[must_use]
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = StableHasher::new();
        hasher.write_str(self.kind.as_str());
        for tag in &self.tags {
            hasher.write_str(tag.as_str());
        }
        for (name, value) in &self.attributes {
            hasher.write_str(name.as_str());
            hasher.write_u64(value.stable_hash(false));
        }
        for child in &self.children {
            hasher.write_u64(child.stable_hash());
        }
        hasher.finish()
    }
}

/// A parsed selection query: `kind.tag1.tag2.` matches nodes of that kind
/// carrying all the listed tags. Either part may be omitted — `window.`
/// selects by kind alone, `.glow` by tag alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeQuery {
    pub kind: Option<Symbol>,
    pub tags: Vec<Symbol>,
}

impl NodeQuery {
    #[must_use]
    pub fn parse(query: &str) -> Self {
        let mut parts = query.split('.');
        let kind = match parts.next() {
            Some("") | None => None,
            Some(kind) => Some(Symbol::new(kind)),
        };
        let tags = parts.filter(|tag| !tag.is_empty()).map(Symbol::new).collect();
        Self { kind, tags }
    }

    #[must_use]
    pub fn matches(&self, node: &Node) -> bool {
        if let Some(kind) = self.kind
            && node.kind != kind
        {
            return false;
        }
        self.tags.iter().all(|tag| node.tags.contains(tag))
    }
}
