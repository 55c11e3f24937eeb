use std::collections::BTreeSet;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Upper bound on tags kept per candidate; extraction sources are noisy and
/// anything past this adds prompt weight without adding signal.
pub const MAX_TAGS: usize = 12;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceVariation {
    pub name: String,
    pub price: String,
}

/// One marketplace listing in uniform shape, regardless of whether it came
/// from a scraped listing page or a vector-search payload row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: String,
    pub title: String,
    pub shop_name: String,
    pub price: String,
    pub url: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub variations: Vec<PriceVariation>,
}

impl Candidate {
    /// Merges a detail-page payload into a listing-derived candidate. Detail
    /// fields win only when non-empty; variations replace wholesale and the
    /// price label is recomputed from them.
    pub fn merge_detail(
        &mut self,
        description: Option<String>,
        tags: Vec<String>,
        variations: Vec<PriceVariation>,
    ) {
        if let Some(description) = description {
            if !description.trim().is_empty() {
                self.description = description;
            }
        }
        if !tags.is_empty() {
            let mut merged = self.tags.clone();
            merged.extend(tags);
            self.tags = normalize_tags(merged);
        }
        if !variations.is_empty() {
            if let Some(label) = price_range_label(&variations) {
                self.price = label;
            }
            self.variations = variations;
        }
    }
}

/// Trims, deduplicates (first occurrence wins), and caps a tag list.
pub fn normalize_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut normalized = Vec::new();
    for tag in tags {
        let tag = tag.trim().to_string();
        if tag.is_empty() {
            continue;
        }
        if seen.insert(tag.to_ascii_lowercase()) {
            normalized.push(tag);
        }
        if normalized.len() == MAX_TAGS {
            break;
        }
    }
    normalized
}

/// Collapses variation prices into a display label: a single value when all
/// variations agree, otherwise `min ~ max`. Unparseable prices are skipped;
/// returns `None` when nothing parses.
pub fn price_range_label(variations: &[PriceVariation]) -> Option<String> {
    let mut min: Option<Decimal> = None;
    let mut max: Option<Decimal> = None;

    for variation in variations {
        let Ok(price) = Decimal::from_str(variation.price.trim()) else {
            continue;
        };
        min = Some(min.map_or(price, |current| current.min(price)));
        max = Some(max.map_or(price, |current| current.max(price)));
    }

    let (min, max) = (min?, max?);
    if min == max {
        Some(min.to_string())
    } else {
        Some(format!("{min} ~ {max}"))
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_tags, price_range_label, Candidate, PriceVariation, MAX_TAGS};

    fn candidate() -> Candidate {
        Candidate {
            id: "itm-100".to_string(),
            title: "Walnut desk organizer".to_string(),
            shop_name: "GrainAndGroove".to_string(),
            price: "48.00".to_string(),
            url: "https://market.example/item/itm-100".to_string(),
            image_url: None,
            description: String::new(),
            tags: vec!["walnut".to_string()],
            variations: Vec::new(),
        }
    }

    #[test]
    fn price_label_collapses_equal_variations() {
        let variations = vec![
            PriceVariation { name: "Small".to_string(), price: "48.00".to_string() },
            PriceVariation { name: "Large".to_string(), price: "48.00".to_string() },
        ];
        assert_eq!(price_range_label(&variations).as_deref(), Some("48.00"));
    }

    #[test]
    fn price_label_spans_min_to_max() {
        let variations = vec![
            PriceVariation { name: "Small".to_string(), price: "32.50".to_string() },
            PriceVariation { name: "Large".to_string(), price: "64.00".to_string() },
            PriceVariation { name: "Custom".to_string(), price: "not-a-price".to_string() },
        ];
        assert_eq!(price_range_label(&variations).as_deref(), Some("32.50 ~ 64.00"));
    }

    #[test]
    fn price_label_is_none_when_nothing_parses() {
        let variations =
            vec![PriceVariation { name: "Any".to_string(), price: "call us".to_string() }];
        assert_eq!(price_range_label(&variations), None);
    }

    #[test]
    fn tags_are_deduplicated_case_insensitively_and_capped() {
        let raw = (0..20)
            .map(|index| format!("tag-{}", index % 15))
            .chain(["  ".to_string(), "TAG-1".to_string()])
            .collect::<Vec<_>>();

        let normalized = normalize_tags(raw);
        assert_eq!(normalized.len(), MAX_TAGS);
        assert_eq!(normalized[0], "tag-0");
        assert!(normalized.iter().filter(|tag| tag.eq_ignore_ascii_case("tag-1")).count() == 1);
    }

    #[test]
    fn merge_detail_keeps_listing_fields_when_detail_is_empty() {
        let mut candidate = candidate();
        candidate.description = "from listing".to_string();

        candidate.merge_detail(Some("   ".to_string()), Vec::new(), Vec::new());

        assert_eq!(candidate.description, "from listing");
        assert_eq!(candidate.price, "48.00");
    }

    #[test]
    fn merge_detail_recomputes_price_from_variations() {
        let mut candidate = candidate();
        candidate.merge_detail(
            Some("Hand-finished walnut, three compartments.".to_string()),
            vec!["desk".to_string(), "Walnut".to_string()],
            vec![
                PriceVariation { name: "Oiled".to_string(), price: "48.00".to_string() },
                PriceVariation { name: "Lacquered".to_string(), price: "55.00".to_string() },
            ],
        );

        assert_eq!(candidate.price, "48.00 ~ 55.00");
        assert_eq!(candidate.tags, vec!["walnut".to_string(), "desk".to_string()]);
        assert!(candidate.description.starts_with("Hand-finished"));
    }
}
