use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::candidate::{normalize_tags, Candidate};
use crate::domain::decision::ItemPick;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One transcript turn as exchanged with the client. Assistant turns that
/// carried recommendations keep their structured `items`; those ids seed the
/// exclusion set for later requests in the same chat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub items: Option<Vec<SelectedItem>>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::User,
            text: Some(text.into()),
            image_ref: None,
            items: None,
        }
    }

    pub fn assistant(text: impl Into<String>, items: Option<Vec<SelectedItem>>) -> Self {
        Self { id: None, role: Role::Assistant, text: Some(text.into()), image_ref: None, items }
    }

    /// True when the turn carries something the agent can act on.
    pub fn has_payload(&self) -> bool {
        let has_text = self.text.as_deref().is_some_and(|text| !text.trim().is_empty());
        let has_image = self.image_ref.as_deref().is_some_and(|image| !image.trim().is_empty());
        has_text || has_image
    }
}

/// A recommended item as delivered to the client: the candidate projection
/// plus the agent's own description, tags, and reasoning. Field order is the
/// wire order of the fenced items block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedItem {
    pub id: String,
    pub title: String,
    pub shop_name: String,
    pub price: String,
    pub url: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub description: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl SelectedItem {
    /// Projects a candidate through the model's pick. Empty pick fields fall
    /// back to what the marketplace said about the item.
    pub fn from_candidate(candidate: &Candidate, pick: &ItemPick) -> Self {
        let description = pick
            .description
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(&candidate.description)
            .to_string();
        let tags = if pick.tags.is_empty() {
            candidate.tags.clone()
        } else {
            normalize_tags(pick.tags.clone())
        };

        Self {
            id: candidate.id.clone(),
            title: candidate.title.clone(),
            shop_name: candidate.shop_name.clone(),
            price: candidate.price.clone(),
            url: candidate.url.clone(),
            image_url: candidate.image_url.clone(),
            description,
            tags,
            reason: pick.reason.clone(),
        }
    }
}

/// The turn the agent should act on: the most recent user message.
pub fn latest_instruction(messages: &[ChatMessage]) -> Option<&ChatMessage> {
    messages.iter().rev().find(|message| message.role == Role::User)
}

/// The image attached to the current instruction, if any. Images from older
/// turns are deliberately not resent to the model.
pub fn latest_image_ref(messages: &[ChatMessage]) -> Option<&str> {
    latest_instruction(messages)
        .and_then(|message| message.image_ref.as_deref())
        .filter(|image| !image.trim().is_empty())
}

/// Every item id already shown to this user in earlier assistant turns.
/// Feeding this set back to the selection step is what makes re-running a
/// request converge instead of repeating recommendations.
pub fn shown_item_ids(messages: &[ChatMessage]) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    for message in messages {
        if message.role != Role::Assistant {
            continue;
        }
        let Some(items) = &message.items else {
            continue;
        };
        for item in items {
            ids.insert(item.id.clone());
        }
    }
    ids
}
