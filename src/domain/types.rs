//! Small enums shared across chunk queries.

use serde::{Deserialize, Serialize};

/// How the tag filter of a search combines multiple tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagLogic {
    #[default]
    And,
    Or,
}

impl TagLogic {
    pub fn as_str(self) -> &'static str {
        match self {
            TagLogic::And => "and",
            TagLogic::Or => "or",
        }
    }
}

/// Matching mode for multi-tag lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMatch {
    #[default]
    All,
    Any,
}

impl TagMatch {
    pub fn as_str(self) -> &'static str {
        match self {
            TagMatch::All => "all",
            TagMatch::Any => "any",
        }
    }
}
