use serde::{Deserialize, Serialize};

/// A directed connection between two nodes.
///
/// Decision nodes carry their true/false targets as node fields; parallel
/// edges may still exist for visualization, and execution prefers the
/// branch fields over edge lookup for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}
