use serde::{Deserialize, Serialize};

/// Depth report for one queue. A failed lookup is reported in place of the depth so a
/// single missing queue does not hide the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueueStats {
    Depth {
        length: u64,

        #[serde(rename = "type")]
        backend_kind: String,
    },
    Unavailable {
        error: String,
    },
}

impl QueueStats {
    pub fn length(&self) -> Option<u64> {
        match self {
            QueueStats::Depth { length, .. } => Some(*length),
            QueueStats::Unavailable { .. } => None,
        }
    }
}
