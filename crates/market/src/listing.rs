//! Turns raw marketplace material into [`Candidate`]s: scraped listing pages
//! on one side, vector-search payload rows on the other. Both feed the same
//! uniform shape so the rest of the pipeline never cares where an item came
//! from.

use std::sync::OnceLock;

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use trove_core::domain::candidate::normalize_tags;
use trove_core::Candidate;
use url::Url;

struct CardSelectors {
    card: Selector,
    link: Selector,
    title: Selector,
    shop: Selector,
    price: Selector,
    image: Selector,
    description: Selector,
    tag: Selector,
}

fn selectors() -> &'static CardSelectors {
    static SELECTORS: OnceLock<CardSelectors> = OnceLock::new();
    SELECTORS.get_or_init(|| CardSelectors {
        card: sel("li.item-card"),
        link: sel("a"),
        title: sel(".item-title"),
        shop: sel(".item-shop"),
        price: sel(".item-price"),
        image: sel("img"),
        description: sel(".item-desc"),
        tag: sel(".item-tag"),
    })
}

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("listing selector parses")
}

/// Extracts candidates from a listing page. A card missing an explicit
/// `data-item-id` falls back to the trailing path segment of its link; a card
/// where neither yields an id is dropped, since nothing downstream could
/// reference it. A missing link is tolerated and the item URL reconstructed.
pub fn parse_listing_page(html: &str, base_url: &str) -> Vec<Candidate> {
    let document = Html::parse_document(html);
    let sels = selectors();
    let mut candidates = Vec::new();

    for card in document.select(&sels.card) {
        let href = card
            .select(&sels.link)
            .find_map(|link| link.value().attr("href"))
            .map(str::trim)
            .filter(|href| !href.is_empty())
            .map(str::to_string);

        let id = attr_of(card, "data-item-id")
            .or_else(|| href.as_deref().and_then(id_from_href));
        let Some(id) = id else {
            continue;
        };

        let url = href
            .as_deref()
            .and_then(|href| absolutize(href, base_url))
            .unwrap_or_else(|| item_url(base_url, &id));

        let image_url = card
            .select(&sels.image)
            .next()
            .and_then(|img| img.value().attr("src").or_else(|| img.value().attr("data-src")))
            .map(str::trim)
            .filter(|src| !src.is_empty())
            .map(str::to_string);

        candidates.push(Candidate {
            id,
            title: text_of(card, &sels.title).unwrap_or_default(),
            shop_name: text_of(card, &sels.shop).unwrap_or_default(),
            price: text_of(card, &sels.price).unwrap_or_default(),
            url,
            image_url,
            description: text_of(card, &sels.description).unwrap_or_default(),
            tags: normalize_tags(card.select(&sels.tag).map(|tag| tag.text().collect::<String>())),
            variations: Vec::new(),
        });
    }

    candidates
}

/// Normalizes vector-search hits. Each row may nest its fields under
/// `payload` or carry them flat; the id may be a string or a number. Rows
/// with no id at all are dropped.
pub fn parse_vector_rows(rows: &[Value], base_url: &str) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for row in rows {
        let payload = row.get("payload").filter(|p| p.is_object()).unwrap_or(row);
        let id = value_to_id(payload.get("id")).or_else(|| value_to_id(row.get("id")));
        let Some(id) = id else {
            continue;
        };

        let url = string_field(payload, "url").unwrap_or_else(|| item_url(base_url, &id));
        let tags = payload
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(|tag| tag.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let variations = payload
            .get("variations")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();

        candidates.push(Candidate {
            id,
            title: string_field(payload, "title").unwrap_or_default(),
            shop_name: string_field(payload, "shopName").unwrap_or_default(),
            price: string_field(payload, "price").unwrap_or_default(),
            url,
            image_url: string_field(payload, "imageUrl"),
            description: string_field(payload, "description").unwrap_or_default(),
            tags: normalize_tags(tags),
            variations,
        });
    }

    candidates
}

fn attr_of(card: ElementRef<'_>, name: &str) -> Option<String> {
    card.value()
        .attr(name)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn text_of(card: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let element = card.select(selector).next()?;
    let text = element.text().collect::<Vec<_>>().join(" ");
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!normalized.is_empty()).then_some(normalized)
}

/// Last non-empty path segment of a listing link, query and fragment
/// stripped.
fn id_from_href(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    path.rsplit('/').find(|segment| !segment.is_empty()).map(str::to_string)
}

fn absolutize(href: &str, base_url: &str) -> Option<String> {
    Url::parse(base_url).ok()?.join(href).ok().map(|url| url.to_string())
}

fn item_url(base_url: &str, id: &str) -> String {
    format!("{}/item/{}", base_url.trim_end_matches('/'), id)
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn value_to_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) => {
            let trimmed = id.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_listing_page, parse_vector_rows};

    const BASE: &str = "https://market.example";

    const LISTING: &str = r#"
    <html><body><ul>
      <li class="item-card" data-item-id="itm-101">
        <a href="/item/itm-101?ref=search"><span class="item-title">Stoneware   mug</span></a>
        <span class="item-shop">KilnHouse</span>
        <span class="item-price">24.00</span>
        <img data-src="https://img.example/itm-101.jpg" />
        <p class="item-desc">Hand thrown, 350ml.</p>
        <span class="item-tag">stoneware</span>
        <span class="item-tag">Mug</span>
        <span class="item-tag">STONEWARE</span>
      </li>
      <li class="item-card">
        <a href="https://market.example/item/itm-202#detail"><span class="item-title">Linen runner</span></a>
        <span class="item-price">31.50</span>
      </li>
      <li class="item-card" data-item-id="itm-303">
        <span class="item-title">Cast iron trivet</span>
      </li>
      <li class="item-card">
        <span class="item-title">Unlinked mystery item</span>
      </li>
    </ul></body></html>"#;

    #[test]
    fn parses_cards_and_drops_the_unidentifiable() {
        let candidates = parse_listing_page(LISTING, BASE);
        assert_eq!(candidates.len(), 3);

        let first = &candidates[0];
        assert_eq!(first.id, "itm-101");
        assert_eq!(first.title, "Stoneware mug");
        assert_eq!(first.shop_name, "KilnHouse");
        assert_eq!(first.price, "24.00");
        assert_eq!(first.url, "https://market.example/item/itm-101?ref=search");
        assert_eq!(first.image_url.as_deref(), Some("https://img.example/itm-101.jpg"));
        assert_eq!(first.description, "Hand thrown, 350ml.");
        assert_eq!(first.tags, vec!["stoneware".to_string(), "Mug".to_string()]);
    }

    #[test]
    fn id_falls_back_to_the_link_path() {
        let candidates = parse_listing_page(LISTING, BASE);
        let second = &candidates[1];
        assert_eq!(second.id, "itm-202");
        assert_eq!(second.url, "https://market.example/item/itm-202#detail");
        assert_eq!(second.shop_name, "");
    }

    #[test]
    fn url_is_reconstructed_when_the_card_has_no_link() {
        let candidates = parse_listing_page(LISTING, BASE);
        let third = &candidates[2];
        assert_eq!(third.id, "itm-303");
        assert_eq!(third.url, "https://market.example/item/itm-303");
        assert!(third.image_url.is_none());
    }

    #[test]
    fn vector_rows_read_nested_and_flat_payloads() {
        let rows = vec![
            json!({
                "score": 0.92,
                "payload": {
                    "id": "itm-401",
                    "title": "Walnut bookend",
                    "shopName": "GrainAndGroove",
                    "price": "52.00",
                    "url": "https://market.example/item/itm-401",
                    "imageUrl": "https://img.example/itm-401.jpg",
                    "description": "Solid walnut, pair.",
                    "tags": ["walnut", "walnut", "bookend"],
                    "variations": [{"name": "Pair", "price": "52.00"}]
                }
            }),
            json!({"id": 402, "title": "Brass hook"}),
            json!({"score": 0.5, "payload": {"title": "No id at all"}}),
        ];

        let candidates = parse_vector_rows(&rows, BASE);
        assert_eq!(candidates.len(), 2);

        let first = &candidates[0];
        assert_eq!(first.id, "itm-401");
        assert_eq!(first.shop_name, "GrainAndGroove");
        assert_eq!(first.tags, vec!["walnut".to_string(), "bookend".to_string()]);
        assert_eq!(first.variations.len(), 1);

        let second = &candidates[1];
        assert_eq!(second.id, "402");
        assert_eq!(second.title, "Brass hook");
        assert_eq!(second.url, "https://market.example/item/402");
        assert_eq!(second.description, "");
    }
}
