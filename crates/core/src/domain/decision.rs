use serde::{Deserialize, Serialize};

/// One item the model chose from a fetched candidate batch, in the model's
/// own words. The id must refer to a candidate from the batch it was shown;
/// that is enforced during validation, not here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPick {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The closed set of next actions a decision step can produce. Raw model
/// output is repaired and validated into this type by the decision engine;
/// code past that boundary never sees a partially valid decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentDecision {
    Reply {
        text: String,
    },
    Search {
        keyword: String,
        #[serde(default)]
        summary: String,
        #[serde(default = "default_page")]
        page: u32,
    },
    Select {
        #[serde(default)]
        items: Vec<ItemPick>,
        #[serde(default)]
        done: bool,
    },
}

fn default_page() -> u32 {
    1
}

impl AgentDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reply { .. } => "reply",
            Self::Search { .. } => "search",
            Self::Select { .. } => "select",
        }
    }
}
