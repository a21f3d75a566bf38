//! Topics exchanged on the authenticated pub/sub bus.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of bus topics known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UvnTopic {
    UvnId,
    CellId,
    Backbone,
}

impl UvnTopic {
    pub const ALL: [UvnTopic; 3] = [UvnTopic::UvnId, UvnTopic::CellId, UvnTopic::Backbone];

    /// The wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            UvnTopic::UvnId => "uno/uvn",
            UvnTopic::CellId => "uno/cell",
            UvnTopic::Backbone => "uno/config",
        }
    }
}

impl fmt::Display for UvnTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
