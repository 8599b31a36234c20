// document.rs — The persisted workspace document.
//
// One format is shared by every tier. The current shape looks like:
//
//   {
//     "metadata":       { "title", "created", "modified", "version" },
//     "prototypeSpace": { "prototypes": [Node, ..] },
//     "spatialGraphs":  { "graphs": [Graph, ..] },
//     "relationships":  { "edges": [Edge, ..] },
//     "session":        { "activeGraphId", "openGraphIds" }
//   }
//
// Readers also accept the legacy-nested and oldest-flat shapes (see
// legacy.rs). Writers always emit the shape above, pretty-printed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::DocumentError;
use crate::graph::{Collection, Edge, Graph, GraphSnapshot, Node};
use crate::legacy;
use crate::stats::ContentStats;

/// Version written into `metadata.version` by this crate.
pub const FORMAT_VERSION: &str = "3.0.0";

/// File extension of workspace documents (without the dot).
pub const FILE_EXTENSION: &str = "redstring";

/// Suffix appended to a document path to name its shadow backup copy.
pub const BACKUP_SUFFIX: &str = ".backup";

/// Which on-disk layout a document was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaShape {
    /// `prototypeSpace` / `spatialGraphs` / `relationships`.
    Current,
    /// Everything under a top-level `legacy` object.
    LegacyNested,
    /// `nodePrototypes` / `graphs` / `edges` at the top level.
    OldestFlat,
}

impl SchemaShape {
    /// Identify the shape of a parsed document, or `None` if it matches none.
    pub fn detect(value: &Value) -> Option<Self> {
        Self::present(value).first().copied()
    }

    /// Every shape whose sections appear in `value`, in reading priority.
    pub fn present(value: &Value) -> Vec<Self> {
        let Some(obj) = value.as_object() else {
            return Vec::new();
        };
        let mut shapes = Vec::new();
        if obj.contains_key("prototypeSpace")
            || obj.contains_key("spatialGraphs")
            || obj.contains_key("relationships")
        {
            shapes.push(SchemaShape::Current);
        }
        if obj.get("legacy").is_some_and(Value::is_object) {
            shapes.push(SchemaShape::LegacyNested);
        }
        if obj.contains_key("nodePrototypes") || obj.contains_key("graphs") {
            shapes.push(SchemaShape::OldestFlat);
        }
        shapes
    }
}

/// Document header. Older files may lack some fields, so each one defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub modified: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    FORMAT_VERSION.to_string()
}

impl DocumentMetadata {
    pub fn new(title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            created: now,
            modified: now,
            version: default_version(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PrototypeSpace {
    #[serde(default)]
    prototypes: Collection<Node>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SpatialGraphs {
    #[serde(default)]
    graphs: Collection<Graph>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Relationships {
    #[serde(default)]
    edges: Collection<Edge>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active_graph_id: Option<String>,
    #[serde(default)]
    open_graph_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentDocument {
    metadata: DocumentMetadata,
    #[serde(default)]
    prototype_space: PrototypeSpace,
    #[serde(default)]
    spatial_graphs: SpatialGraphs,
    #[serde(default)]
    relationships: Relationships,
    #[serde(default)]
    session: Session,
}

/// A parsed workspace document: header plus graph snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceDocument {
    pub metadata: DocumentMetadata,
    pub snapshot: GraphSnapshot,
    /// Shape the document was read from (`Current` for fresh documents).
    pub shape: SchemaShape,
}

impl WorkspaceDocument {
    pub fn new(title: impl Into<String>, snapshot: GraphSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            metadata: DocumentMetadata::new(title, now),
            snapshot,
            shape: SchemaShape::Current,
        }
    }

    /// Parse document text in any accepted shape.
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        if text.trim().is_empty() {
            return Err(DocumentError::Empty);
        }
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Read `value` under the first shape that yields content. A document
    /// carrying sections of several shapes is only empty if all of them are.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        let mut fallback = None;
        for shape in SchemaShape::present(&value) {
            let parsed = Self::from_shape(&value, shape);
            if matches!(&parsed, Ok(doc) if !doc.snapshot.is_empty()) {
                return parsed;
            }
            fallback.get_or_insert(parsed);
        }
        match fallback {
            Some(parsed) => parsed,
            None => Err(DocumentError::UnrecognizedShape {
                keys: top_level_keys(&value),
            }),
        }
    }

    fn from_shape(value: &Value, shape: SchemaShape) -> Result<Self, DocumentError> {
        match shape {
            SchemaShape::Current => {
                let doc = CurrentDocument::deserialize(value)?;
                Ok(Self {
                    metadata: doc.metadata,
                    snapshot: GraphSnapshot {
                        graphs: doc.spatial_graphs.graphs,
                        nodes: doc.prototype_space.prototypes,
                        edges: doc.relationships.edges,
                        active_graph_id: doc.session.active_graph_id,
                        open_graph_ids: doc.session.open_graph_ids,
                    },
                    shape,
                })
            }
            SchemaShape::LegacyNested | SchemaShape::OldestFlat => {
                let metadata = match value.get("metadata") {
                    Some(meta) => DocumentMetadata::deserialize(meta)?,
                    None => DocumentMetadata::new("", DateTime::<Utc>::default()),
                };
                let container = if shape == SchemaShape::LegacyNested {
                    value.get("legacy").and_then(Value::as_object)
                } else {
                    value.as_object()
                };
                let snapshot = match container {
                    Some(container) => legacy::snapshot_from_container(container)?,
                    None => GraphSnapshot::default(),
                };
                Ok(Self {
                    metadata,
                    snapshot,
                    shape,
                })
            }
        }
    }

    /// Serialize in the current shape.
    pub fn to_value(&self) -> Result<Value, DocumentError> {
        let doc = CurrentDocument {
            metadata: self.metadata.clone(),
            prototype_space: PrototypeSpace {
                prototypes: self.snapshot.nodes.clone(),
            },
            spatial_graphs: SpatialGraphs {
                graphs: self.snapshot.graphs.clone(),
            },
            relationships: Relationships {
                edges: self.snapshot.edges.clone(),
            },
            session: Session {
                active_graph_id: self.snapshot.active_graph_id.clone(),
                open_graph_ids: self.snapshot.open_graph_ids.clone(),
            },
        };
        Ok(serde_json::to_value(doc)?)
    }

    /// Indented, human-readable text in the current shape.
    pub fn to_pretty_string(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string_pretty(&self.to_value()?)?)
    }

    pub fn stats(&self) -> ContentStats {
        self.snapshot.stats()
    }

    /// The in-file title, if one is set.
    pub fn title(&self) -> Option<&str> {
        let title = self.metadata.title.trim();
        (!title.is_empty()).then_some(title)
    }
}

fn top_level_keys(value: &Value) -> String {
    match value.as_object() {
        Some(obj) if !obj.is_empty() => obj.keys().cloned().collect::<Vec<_>>().join(", "),
        Some(_) => "<none>".to_string(),
        None => "<not an object>".to_string(),
    }
}

/// Path of the shadow backup copy for a document path.
pub fn backup_path(path: &str) -> String {
    format!("{}{}", path, BACKUP_SUFFIX)
}

/// Header state carried between saves of the same workspace.
///
/// `modified` only moves when the snapshot content actually changes, so two
/// saves of the same snapshot render byte-identical documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStamp {
    pub title: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl DocumentStamp {
    pub fn new(title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            created: now,
            modified: now,
            content_hash: None,
        }
    }

    /// SHA-256 of the snapshot's compact JSON.
    pub fn fingerprint(snapshot: &GraphSnapshot) -> Result<String, DocumentError> {
        let json = serde_json::to_vec(snapshot)?;
        Ok(format!("{:x}", Sha256::digest(&json)))
    }

    /// Record `snapshot` as the latest content. Returns true if it changed.
    pub fn touch(&mut self, snapshot: &GraphSnapshot, now: DateTime<Utc>) -> Result<bool, DocumentError> {
        let hash = Self::fingerprint(snapshot)?;
        if self.content_hash.as_deref() == Some(hash.as_str()) {
            return Ok(false);
        }
        self.content_hash = Some(hash);
        self.modified = now;
        Ok(true)
    }

    /// Render `snapshot` under this stamp's header.
    pub fn render(&self, snapshot: &GraphSnapshot) -> Result<String, DocumentError> {
        let doc = WorkspaceDocument {
            metadata: DocumentMetadata {
                title: self.title.clone(),
                created: self.created,
                modified: self.modified,
                version: default_version(),
            },
            snapshot: snapshot.clone(),
            shape: SchemaShape::Current,
        };
        doc.to_pretty_string()
    }

    /// `touch` followed by `render`.
    pub fn stamp_and_render(
        &mut self,
        snapshot: &GraphSnapshot,
        now: DateTime<Utc>,
    ) -> Result<String, DocumentError> {
        self.touch(snapshot, now)?;
        self.render(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn sample_snapshot() -> GraphSnapshot {
        let mut snapshot = GraphSnapshot::default();
        snapshot.nodes.insert(Node::new("n1", "Thought"));
        snapshot.graphs.insert(Graph::new("g1", "Main"));
        snapshot.active_graph_id = Some("g1".to_string());
        snapshot
    }

    #[test]
    fn detect_shapes() {
        assert_eq!(
            SchemaShape::detect(&json!({"prototypeSpace": {}})),
            Some(SchemaShape::Current)
        );
        assert_eq!(
            SchemaShape::detect(&json!({"legacy": {"graphs": {}}})),
            Some(SchemaShape::LegacyNested)
        );
        assert_eq!(
            SchemaShape::detect(&json!({"nodePrototypes": {}})),
            Some(SchemaShape::OldestFlat)
        );
        assert_eq!(SchemaShape::detect(&json!({"hello": 1})), None);
        assert_eq!(SchemaShape::detect(&json!([1, 2])), None);
    }

    #[test]
    fn writer_emits_current_shape_with_metadata() {
        let doc = WorkspaceDocument::new("Alpha", sample_snapshot(), Utc::now());
        let value = doc.to_value().unwrap();
        assert_eq!(value["metadata"]["title"], "Alpha");
        assert_eq!(value["metadata"]["version"], FORMAT_VERSION);
        assert_eq!(value["prototypeSpace"]["prototypes"][0]["id"], "n1");
        assert_eq!(value["session"]["activeGraphId"], "g1");
    }

    #[test]
    fn pretty_output_is_indented() {
        let doc = WorkspaceDocument::new("Alpha", sample_snapshot(), Utc::now());
        let text = doc.to_pretty_string().unwrap();
        assert!(text.contains("\n  \"metadata\""));
    }

    #[test]
    fn parse_rejects_empty_and_unknown() {
        assert!(matches!(
            WorkspaceDocument::parse("   "),
            Err(DocumentError::Empty)
        ));
        assert!(matches!(
            WorkspaceDocument::parse("{\"foo\": 1}"),
            Err(DocumentError::UnrecognizedShape { .. })
        ));
        assert!(matches!(
            WorkspaceDocument::parse("{not json"),
            Err(DocumentError::Malformed(_))
        ));
    }

    #[test]
    fn current_shape_requires_metadata() {
        let err = WorkspaceDocument::parse(r#"{"prototypeSpace": {"prototypes": []}}"#);
        assert!(matches!(err, Err(DocumentError::Malformed(_))));
    }

    #[test]
    fn legacy_shape_without_metadata_parses() {
        let doc = WorkspaceDocument::parse(r#"{"nodePrototypes": {"n1": {"name": "x"}}}"#).unwrap();
        assert_eq!(doc.shape, SchemaShape::OldestFlat);
        assert_eq!(doc.title(), None);
        assert_eq!(doc.stats().node_count, 1);
    }

    #[test]
    fn mixed_shapes_read_whichever_section_has_content() {
        let text = r#"{
            "metadata": {"title": "Mixed"},
            "prototypeSpace": {"prototypes": []},
            "legacy": {"nodePrototypes": {"n1": {"name": "Kept"}}}
        }"#;
        assert_eq!(
            SchemaShape::present(&serde_json::from_str(text).unwrap()),
            vec![SchemaShape::Current, SchemaShape::LegacyNested]
        );
        let doc = WorkspaceDocument::parse(text).unwrap();
        assert_eq!(doc.shape, SchemaShape::LegacyNested);
        assert_eq!(doc.title(), Some("Mixed"));
        assert_eq!(doc.stats().node_count, 1);

        // All sections empty: the highest-priority shape is reported.
        let empty = WorkspaceDocument::parse(
            r#"{"metadata": {}, "prototypeSpace": {}, "nodePrototypes": {}}"#,
        )
        .unwrap();
        assert_eq!(empty.shape, SchemaShape::Current);
        assert!(empty.snapshot.is_empty());
    }

    #[test]
    fn stamp_keeps_modified_for_unchanged_content() {
        let t0 = Utc::now();
        let mut stamp = DocumentStamp::new("Alpha", t0);
        let snapshot = sample_snapshot();

        assert!(stamp.touch(&snapshot, t0 + Duration::seconds(1)).unwrap());
        let first = stamp.render(&snapshot).unwrap();

        assert!(!stamp.touch(&snapshot, t0 + Duration::seconds(30)).unwrap());
        let second = stamp.render(&snapshot).unwrap();
        assert_eq!(first, second);

        let mut changed = snapshot.clone();
        changed.nodes.insert(Node::new("n2", "Another"));
        assert!(stamp.touch(&changed, t0 + Duration::seconds(60)).unwrap());
        assert_eq!(stamp.modified, t0 + Duration::seconds(60));
    }

    #[test]
    fn backup_path_appends_suffix() {
        assert_eq!(
            backup_path("universes/alpha/alpha.redstring"),
            "universes/alpha/alpha.redstring.backup"
        );
    }
}
