//! JSON deck import: parse, validate, sanitize, and summarize before saving.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::Difficulty;

pub const MAX_IMPORT_CARDS: usize = 500;
const TOP_SOURCES: usize = 5;

const ALLOWED_TAGS: &[&str] = &[
    "b", "i", "strong", "em", "p", "br", "ul", "ol", "li", "code", "pre", "h1", "h2", "h3",
    "blockquote", "span",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardImport {
    pub front_content: String,
    pub back_content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub base_difficulty: Difficulty,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeckImport {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    pub cards: Vec<CardImport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportStats {
    pub card_count: usize,
    pub unique_tags: Vec<String>,
    pub top_sources: Vec<(String, usize)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportPreview {
    pub deck: DeckImport,
    pub stats: ImportStats,
}

/// Strips everything outside a small formatting allow-list.
pub fn sanitize_html(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    ammonia::Builder::default()
        .tags(ALLOWED_TAGS.iter().copied().collect::<HashSet<_>>())
        .clean(content)
        .to_string()
}

/// Parses an uploaded deck file. Content comes back already sanitized, so the
/// preview shows exactly what would be saved.
pub fn parse_and_preview(file_content: &str) -> Result<ImportPreview> {
    let deck: DeckImport = serde_json::from_str(file_content).map_err(|e| {
        if e.is_syntax() || e.is_eof() {
            AppError::InvalidImport("invalid JSON file format".to_string())
        } else {
            AppError::InvalidImport(format!("schema error: {}", e))
        }
    })?;

    validate_and_preview(deck)
}

pub fn validate_and_preview(mut deck: DeckImport) -> Result<ImportPreview> {
    if deck.cards.is_empty() {
        return Err(AppError::InvalidImport(
            "deck must contain at least one card".to_string(),
        ));
    }
    if deck.cards.len() > MAX_IMPORT_CARDS {
        return Err(AppError::InvalidImport(format!(
            "max {} cards per import allowed",
            MAX_IMPORT_CARDS
        )));
    }

    for card in &mut deck.cards {
        card.front_content = sanitize_html(&card.front_content);
        card.back_content = sanitize_html(&card.back_content);
    }

    let stats = summarize(&deck);
    Ok(ImportPreview { deck, stats })
}

fn summarize(deck: &DeckImport) -> ImportStats {
    let mut unique_tags: Vec<String> = Vec::new();
    let mut seen_tags: HashSet<&str> = HashSet::new();
    let mut sources: Vec<(String, usize)> = Vec::new();
    let mut source_index: HashMap<&str, usize> = HashMap::new();

    for card in &deck.cards {
        for tag in card.tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if seen_tags.insert(tag) {
                unique_tags.push(tag.to_string());
            }
        }
        if let Some(source) = card.source.as_deref() {
            match source_index.get(source) {
                Some(&i) => sources[i].1 += 1,
                None => {
                    source_index.insert(source, sources.len());
                    sources.push((source.to_string(), 1));
                }
            }
        }
    }

    // Stable sort: equal counts keep first-seen order.
    sources.sort_by(|a, b| b.1.cmp(&a.1));
    sources.truncate(TOP_SOURCES);

    ImportStats {
        card_count: deck.cards.len(),
        unique_tags,
        top_sources: sources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_sanitizes_and_counts() {
        let json = r#"{
            "title": "Anatomy",
            "cards": [
                {"front_content": "<b>Femur</b><script>alert(1)</script>", "back_content": "Thigh bone",
                 "tags": ["bones", " legs "], "source": "Gray"},
                {"front_content": "Ulna", "back_content": "<a href='x'>Forearm</a>",
                 "tags": ["bones", ""], "base_difficulty": 5, "source": "Web"},
                {"front_content": "Skull", "back_content": "Head", "source": "Gray"}
            ]
        }"#;

        let preview = parse_and_preview(json).unwrap();
        assert_eq!(preview.deck.cards[0].front_content, "<b>Femur</b>");
        assert_eq!(preview.deck.cards[1].back_content, "Forearm");
        assert_eq!(preview.deck.cards[0].base_difficulty, Difficulty::Medium);
        assert_eq!(preview.deck.cards[1].base_difficulty, Difficulty::Hardest);
        assert!(!preview.deck.is_public);

        assert_eq!(preview.stats.card_count, 3);
        assert_eq!(preview.stats.unique_tags, vec!["bones", "legs"]);
        assert_eq!(
            preview.stats.top_sources,
            vec![("Gray".to_string(), 2), ("Web".to_string(), 1)]
        );
    }

    #[test]
    fn test_rejects_bad_json() {
        let err = parse_and_preview("{ not json").unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn test_rejects_schema_errors() {
        let err = parse_and_preview(r#"{"title": "x"}"#).unwrap_err();
        assert!(err.to_string().contains("schema error"));

        let err = parse_and_preview(
            r#"{"title": "x", "cards": [{"front_content": "a", "back_content": "b", "base_difficulty": 9}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("schema error"));
    }

    #[test]
    fn test_card_count_limits() {
        let err = parse_and_preview(r#"{"title": "x", "cards": []}"#).unwrap_err();
        assert!(err.to_string().contains("at least one card"));

        let cards: Vec<CardImport> = (0..=MAX_IMPORT_CARDS)
            .map(|i| CardImport {
                front_content: i.to_string(),
                back_content: i.to_string(),
                tags: Vec::new(),
                base_difficulty: Difficulty::default(),
                source: None,
            })
            .collect();
        let deck = DeckImport {
            title: "big".to_string(),
            description: None,
            is_public: false,
            cards,
        };
        assert!(matches!(validate_and_preview(deck), Err(AppError::InvalidImport(_))));
    }

    #[test]
    fn test_sanitize_keeps_allowed_markup() {
        assert_eq!(sanitize_html("<p>a<br>b</p>"), "<p>a<br>b</p>");
        assert_eq!(sanitize_html("<img src=x onerror=alert(1)>ok"), "ok");
        assert_eq!(sanitize_html(""), "");
    }
}
