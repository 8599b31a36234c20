//! # redstring-document
//!
//! The in-memory graph snapshot and its on-disk representation.
//!
//! Every storage tier (local file, remote repository, browser cache) persists
//! the same structured document. Writers always emit the newest schema shape;
//! readers accept all three shapes that have existed in the wild.
//!
//! ## Key components
//!
//! - [`GraphSnapshot`] — typed snapshot of graphs, node prototypes and edges,
//!   held in key-unique, insertion-ordered [`Collection`]s.
//! - [`WorkspaceDocument`] — metadata + snapshot, with [`WorkspaceDocument::parse`]
//!   accepting the current, legacy-nested and oldest-flat [`SchemaShape`]s.
//! - [`DocumentStamp`] — keeps `metadata.modified` stable across saves of
//!   unchanged content so repeated saves serialize identically.
//! - [`ContentStats`] — node / edge / graph counts used by discovery and
//!   workspace metadata.

pub mod document;
pub mod error;
pub mod graph;
pub mod legacy;
pub mod stats;

pub use document::{
    backup_path, DocumentMetadata, DocumentStamp, SchemaShape, WorkspaceDocument, BACKUP_SUFFIX,
    FILE_EXTENSION, FORMAT_VERSION,
};
pub use error::DocumentError;
pub use graph::{Collection, Edge, Graph, GraphSnapshot, Instance, Keyed, Node};
pub use stats::ContentStats;
