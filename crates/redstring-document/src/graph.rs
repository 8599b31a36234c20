// graph.rs — Typed in-memory graph snapshot.
//
// The host application owns rendering; all this crate sees is a snapshot of
// what should be persisted. Containers are key-unique and keep insertion
// order, because the UI lists graphs and prototypes in the order the user
// created them.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::stats::ContentStats;

/// Anything stored in a [`Collection`] exposes a unique string key.
pub trait Keyed {
    fn key(&self) -> &str;
}

/// An insertion-ordered container where every item has a unique key.
///
/// Inserting an item whose key already exists replaces it in place, so the
/// original position is kept. Serializes as a plain JSON array; duplicate
/// keys in incoming arrays collapse onto the first position (last write wins).
#[derive(Debug, Clone, PartialEq)]
pub struct Collection<T> {
    items: Vec<T>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Keyed> Collection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the replaced item, if any.
    pub fn insert(&mut self, item: T) -> Option<T> {
        match self.items.iter().position(|i| i.key() == item.key()) {
            Some(idx) => Some(std::mem::replace(&mut self.items[idx], item)),
            None => {
                self.items.push(item);
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.items.iter().find(|i| i.key() == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        let idx = self.items.iter().position(|i| i.key() == key)?;
        Some(self.items.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.key()).collect()
    }
}

impl<T: Keyed> FromIterator<T> for Collection<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut collection = Collection::new();
        for item in iter {
            collection.insert(item);
        }
        collection
    }
}

impl<'a, T> IntoIterator for &'a Collection<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: Serialize> Serialize for Collection<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.items.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Collection<T>
where
    T: Deserialize<'de> + Keyed,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SeqVisitor<T>(PhantomData<T>);

        impl<'de, T> Visitor<'de> for SeqVisitor<T>
        where
            T: Deserialize<'de> + Keyed,
        {
            type Value = Collection<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an array of keyed items")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut collection = Collection::new();
                while let Some(item) = seq.next_element::<T>()? {
                    collection.insert(item);
                }
                Ok(collection)
            }
        }

        deserializer.deserialize_seq(SeqVisitor(PhantomData))
    }
}

/// A node prototype: the reusable concept that graph instances point at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Prototype this node is a specialization of, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_node_id: Option<String>,
    /// Opaque host-side properties (semantic annotations and the like).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            color: None,
            type_node_id: None,
            properties: BTreeMap::new(),
        }
    }
}

impl Keyed for Node {
    fn key(&self) -> &str {
        &self.id
    }
}

/// A placement of a node prototype inside a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub prototype_id: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl Keyed for Instance {
    fn key(&self) -> &str {
        &self.id
    }
}

/// A spatial graph (one canvas) containing instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Graph {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instances: Collection<Instance>,
    /// Node prototype this graph defines, for nested "definition" graphs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defining_node_id: Option<String>,
}

impl Graph {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            instances: Collection::new(),
            defining_node_id: None,
        }
    }
}

impl Keyed for Graph {
    fn key(&self) -> &str {
        &self.id
    }
}

/// A relationship between two instances or prototypes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source_id: String,
    pub destination_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub directed: bool,
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            name: None,
            directed: true,
        }
    }
}

impl Keyed for Edge {
    fn key(&self) -> &str {
        &self.id
    }
}

/// The full state the host hands us to persist, and receives back on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    #[serde(default)]
    pub graphs: Collection<Graph>,
    #[serde(default)]
    pub nodes: Collection<Node>,
    #[serde(default)]
    pub edges: Collection<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_graph_id: Option<String>,
    #[serde(default)]
    pub open_graph_ids: Vec<String>,
}

impl GraphSnapshot {
    /// The empty state a workspace starts from when no tier has data.
    pub fn bootstrap() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ContentStats {
        ContentStats {
            node_count: self.nodes.len(),
            edge_count: self.edges.len(),
            graph_count: self.graphs.len(),
        }
    }

    /// True when there is nothing worth persisting.
    pub fn is_empty(&self) -> bool {
        !self.stats().has_content()
    }
}
