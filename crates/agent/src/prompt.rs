//! Prompt assembly for the decision and reply calls. Templates are embedded
//! at build time; everything size-sensitive (transcript window, id sets,
//! candidate digest) is capped here so no prompt grows without bound.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;
use trove_core::config::AgentConfig;
use trove_core::domain::message::{latest_image_ref, latest_instruction, shown_item_ids};
use trove_core::{Candidate, ChatMessage, Role, SelectedItem};

/// Characters of one transcript turn kept in the prompt.
const TURN_TEXT_MAX_CHARS: usize = 400;
/// Characters of a candidate description kept in the digest.
const DESCRIPTION_MAX_CHARS: usize = 280;

#[derive(Debug, Error)]
#[error("prompt render failed: {0}")]
pub struct PromptError(#[from] tera::Error);

/// Everything one turn of the loop knows: the compacted past plus the
/// request-scoped sets the loop mutates as it goes.
#[derive(Clone, Debug)]
pub struct TurnContext {
    pub history: Vec<ChatMessage>,
    pub instruction: String,
    pub image_ref: Option<String>,
    pub language: String,
    pub tried_keywords: Vec<String>,
    pub excluded_ids: BTreeSet<String>,
    pub picked_ids: BTreeSet<String>,
}

impl TurnContext {
    /// Seeds a context from the transcript: the latest user message becomes
    /// the instruction, its image (if any) rides along, and every item id
    /// shown in earlier assistant turns lands in the exclusion set.
    pub fn from_history(history: &[ChatMessage], language: &str) -> Self {
        let instruction = latest_instruction(history)
            .and_then(|message| message.text.clone())
            .unwrap_or_default();
        let image_ref = latest_image_ref(history).map(str::to_string);
        let excluded_ids = shown_item_ids(history);

        Self {
            history: history.to_vec(),
            instruction,
            image_ref,
            language: language.trim().to_string(),
            tried_keywords: Vec::new(),
            excluded_ids,
            picked_ids: BTreeSet::new(),
        }
    }

    pub fn record_keyword(&mut self, keyword: &str) {
        if !self.tried_keywords.iter().any(|tried| tried == keyword) {
            self.tried_keywords.push(keyword.to_string());
        }
    }
}

#[derive(Serialize)]
struct TranscriptTurn {
    role: &'static str,
    text: String,
    image: bool,
    items: usize,
}

#[derive(Serialize)]
struct CandidateDigest<'a> {
    id: &'a str,
    title: &'a str,
    #[serde(rename = "shopName")]
    shop_name: &'a str,
    price: &'a str,
    description: String,
    tags: &'a [String],
}

#[derive(Serialize)]
struct ReplyItem<'a> {
    title: &'a str,
    price: &'a str,
    shop_name: &'a str,
    reason: Option<&'a str>,
}

/// Renders the three prompt kinds from one shared template set.
#[derive(Clone)]
pub struct PromptBuilder {
    history_window: usize,
    max_candidate_payload: usize,
    max_id_payload: usize,
    need_min: usize,
    max_pick: usize,
}

impl PromptBuilder {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            history_window: config.history_window,
            max_candidate_payload: config.max_candidate_payload,
            max_id_payload: config.max_id_payload,
            need_min: config.need_min,
            max_pick: config.max_pick,
        }
    }

    pub fn system(&self, ctx: &TurnContext) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("language", &ctx.language);
        Ok(templates().render("system.txt", &context)?)
    }

    /// The decision-step prompt: transcript window, request-scoped sets, and
    /// the candidate digest when a batch has been fetched.
    pub fn decide(
        &self,
        ctx: &TurnContext,
        candidates: Option<&[Candidate]>,
    ) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("turns", &self.compact_transcript(&ctx.history));
        context.insert("instruction", &ctx.instruction);
        context.insert("has_image", &ctx.image_ref.is_some());
        context.insert("tried_keywords", &ctx.tried_keywords);
        context.insert("excluded_ids", &join_capped(&ctx.excluded_ids, self.max_id_payload));
        context.insert("picked_ids", &join_capped(&ctx.picked_ids, self.max_id_payload));
        context.insert("need_min", &self.need_min);
        context.insert("max_pick", &self.max_pick);

        let digest = candidates.map(|batch| self.digest(batch)).transpose()?;
        context.insert("candidates", &digest.unwrap_or_default());

        Ok(templates().render("decide.txt", &context)?)
    }

    /// The final-narrative prompt over whatever was picked.
    pub fn reply(&self, ctx: &TurnContext, items: &[SelectedItem]) -> Result<String, PromptError> {
        let digest: Vec<ReplyItem<'_>> = items
            .iter()
            .map(|item| ReplyItem {
                title: &item.title,
                price: &item.price,
                shop_name: &item.shop_name,
                reason: item.reason.as_deref(),
            })
            .collect();

        let mut context = Context::new();
        context.insert("instruction", &ctx.instruction);
        context.insert("items", &digest);
        Ok(templates().render("reply.txt", &context)?)
    }

    fn compact_transcript(&self, history: &[ChatMessage]) -> Vec<TranscriptTurn> {
        let start = history.len().saturating_sub(self.history_window);
        history[start..]
            .iter()
            .map(|message| TranscriptTurn {
                role: match message.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                text: clip(message.text.as_deref().unwrap_or_default(), TURN_TEXT_MAX_CHARS),
                image: message.image_ref.is_some(),
                items: message.items.as_ref().map(Vec::len).unwrap_or(0),
            })
            .collect()
    }

    /// Selection-relevant candidate fields as one compact JSON string,
    /// capped in length and per-item size.
    fn digest(&self, candidates: &[Candidate]) -> Result<String, PromptError> {
        let digest: Vec<CandidateDigest<'_>> = candidates
            .iter()
            .take(self.max_candidate_payload)
            .map(|candidate| CandidateDigest {
                id: &candidate.id,
                title: &candidate.title,
                shop_name: &candidate.shop_name,
                price: &candidate.price,
                description: clip(&candidate.description, DESCRIPTION_MAX_CHARS),
                tags: &candidate.tags,
            })
            .collect();
        serde_json::to_string(&digest)
            .map_err(|error| PromptError(tera::Error::msg(error.to_string())))
    }
}

fn templates() -> &'static Tera {
    static TEMPLATES: OnceLock<Tera> = OnceLock::new();
    TEMPLATES.get_or_init(|| {
        let mut tera = Tera::default();
        tera.add_raw_template("system.txt", include_str!("../templates/system.txt"))
            .expect("system.txt template parses");
        tera.add_raw_template("decide.txt", include_str!("../templates/decide.txt"))
            .expect("decide.txt template parses");
        tera.add_raw_template("reply.txt", include_str!("../templates/reply.txt"))
            .expect("reply.txt template parses");
        tera
    })
}

fn join_capped(ids: &BTreeSet<String>, cap: usize) -> String {
    ids.iter().take(cap).map(String::as_str).collect::<Vec<_>>().join(", ")
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max_chars).collect();
    clipped.push_str("...");
    clipped
}

#[cfg(test)]
mod tests {
    use trove_core::config::AgentConfig;
    use trove_core::{Candidate, ChatMessage, SelectedItem};

    use super::{PromptBuilder, TurnContext};

    fn agent_config() -> AgentConfig {
        AgentConfig {
            max_steps: 4,
            need_min: 5,
            max_pick: 15,
            history_window: 3,
            max_candidate_payload: 2,
            max_id_payload: 200,
        }
    }

    fn shown(id: &str) -> SelectedItem {
        SelectedItem {
            id: id.to_string(),
            title: "Stoneware mug".to_string(),
            shop_name: "KilnHouse".to_string(),
            price: "24.00".to_string(),
            url: format!("https://market.example/item/{id}"),
            image_url: None,
            description: "Wheel thrown.".to_string(),
            tags: vec!["ceramic".to_string()],
            reason: Some("matches the kitchen theme".to_string()),
        }
    }

    fn candidate(id: &str, title: &str) -> Candidate {
        Candidate {
            id: id.to_string(),
            title: title.to_string(),
            shop_name: "FixtureShop".to_string(),
            price: "10.00".to_string(),
            url: format!("https://market.example/item/{id}"),
            image_url: None,
            description: "Short description.".to_string(),
            tags: vec!["fixture".to_string()],
            variations: Vec::new(),
        }
    }

    #[test]
    fn context_seeds_instruction_image_and_exclusions_from_history() {
        let mut with_image = ChatMessage::user("find mugs like this");
        with_image.image_ref = Some("img-7".to_string());
        let history = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("round one", Some(vec![shown("itm-1"), shown("itm-2")])),
            with_image,
        ];

        let ctx = TurnContext::from_history(&history, "en");
        assert_eq!(ctx.instruction, "find mugs like this");
        assert_eq!(ctx.image_ref.as_deref(), Some("img-7"));
        assert!(ctx.excluded_ids.contains("itm-1") && ctx.excluded_ids.contains("itm-2"));
    }

    #[test]
    fn keyword_recording_is_ordered_and_deduplicated() {
        let mut ctx = TurnContext::from_history(&[ChatMessage::user("mugs")], "");
        ctx.record_keyword("ceramic mug");
        ctx.record_keyword("stoneware mug");
        ctx.record_keyword("ceramic mug");
        assert_eq!(ctx.tried_keywords, vec!["ceramic mug", "stoneware mug"]);
    }

    #[test]
    fn decide_prompt_windows_history_and_annotates_turns() {
        let history = vec![
            ChatMessage::user("ancient and should be dropped"),
            ChatMessage::user("first kept"),
            ChatMessage::assistant("shown some", Some(vec![shown("itm-1")])),
            ChatMessage::user("more like these"),
        ];
        let ctx = TurnContext::from_history(&history, "en");
        let prompt = PromptBuilder::new(&agent_config()).decide(&ctx, None).expect("render");

        assert!(!prompt.contains("ancient and should be dropped"));
        assert!(prompt.contains("first kept"));
        assert!(prompt.contains("[items: 1]"));
        assert!(prompt.contains("itm-1"));
        assert!(prompt.contains("Latest request: more like these"));
    }

    #[test]
    fn candidate_digest_is_capped_and_json_shaped() {
        let ctx = TurnContext::from_history(&[ChatMessage::user("vases")], "");
        let batch = vec![
            candidate("itm-1", "Blue vase"),
            candidate("itm-2", "Green vase"),
            candidate("itm-3", "Over the cap"),
        ];
        let prompt = PromptBuilder::new(&agent_config()).decide(&ctx, Some(&batch)).expect("render");

        assert!(prompt.contains(r#""id":"itm-1""#));
        assert!(prompt.contains(r#""id":"itm-2""#));
        assert!(!prompt.contains("Over the cap"));
    }

    #[test]
    fn reply_prompt_switches_on_whether_anything_was_picked() {
        let ctx = TurnContext::from_history(&[ChatMessage::user("mugs")], "");
        let builder = PromptBuilder::new(&agent_config());

        let with_items = builder.reply(&ctx, &[shown("itm-1")]).expect("render");
        assert!(with_items.contains("Stoneware mug"));
        assert!(with_items.contains("matches the kitchen theme"));

        let empty = builder.reply(&ctx, &[]).expect("render");
        assert!(empty.contains("found nothing"));
    }
}
