// stats.rs — Content statistics for snapshots and discovered files.

use serde::{Deserialize, Serialize};

/// How much content a snapshot or document carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub graph_count: usize,
}

impl ContentStats {
    /// A document has content if any of its containers is non-empty.
    pub fn has_content(&self) -> bool {
        self.node_count > 0 || self.edge_count > 0 || self.graph_count > 0
    }
}
