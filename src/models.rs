use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Static difficulty rating set by the deck author, 1 (easiest) to 5 (hardest).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Difficulty {
    Easiest = 1,
    Easy = 2,
    #[default]
    Medium = 3,
    Hard = 4,
    Hardest = 5,
}

impl Difficulty {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;
}

impl From<Difficulty> for u8 {
    fn from(d: Difficulty) -> u8 {
        d as u8
    }
}

impl TryFrom<u8> for Difficulty {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Difficulty::Easiest),
            2 => Ok(Difficulty::Easy),
            3 => Ok(Difficulty::Medium),
            4 => Ok(Difficulty::Hard),
            5 => Ok(Difficulty::Hardest),
            other => Err(format!("difficulty must be between 1 and 5, got {}", other)),
        }
    }
}

/// Inclusive difficulty bounds for a study session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultyRange {
    pub min: u8,
    pub max: u8,
}

impl Default for DifficultyRange {
    fn default() -> Self {
        Self {
            min: Difficulty::MIN,
            max: Difficulty::MAX,
        }
    }
}

/// User response to a card in the study arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Know,
    Miss,
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub picture_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Profile claims of an already verified identity provider login.
#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: i64,
    pub deck_id: i64,
    pub front_content: String,
    pub back_content: String,
    pub base_difficulty: Difficulty,
    pub source: Option<String>,
    pub tag_ids: Vec<i64>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for Card {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let raw_difficulty: i64 = row.try_get("base_difficulty")?;
        let base_difficulty = u8::try_from(raw_difficulty)
            .map_err(|e| e.to_string())
            .and_then(Difficulty::try_from)
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "base_difficulty".to_string(),
                source: e.into(),
            })?;

        Ok(Card {
            id: row.try_get("id")?,
            deck_id: row.try_get("deck_id")?,
            front_content: row.try_get("front_content")?,
            back_content: row.try_get("back_content")?,
            base_difficulty,
            source: row.try_get("source")?,
            // Filled in by a second query; the card row carries no tags.
            tag_ids: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActiveDeck {
    pub id: i64,
    pub user_id: i64,
    pub deck_id: i64,
    pub is_favorite: bool,
    pub total_sessions_played: i64,
    pub last_played_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One row of the public library listing.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PublicDeck {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub author: String,
    pub front_language: String,
    pub back_language: String,
    pub card_count: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// One row of a user's bookshelf.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BookshelfEntry {
    pub active_id: i64,
    pub deck_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub front_language: String,
    pub back_language: String,
    pub is_favorite: bool,
    pub total_sessions_played: i64,
    pub last_played_at: Option<DateTime<Utc>>,
    pub card_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagInfo {
    pub id: i64,
    pub name: String,
}

/// What the study setup screen needs: the deck title and its filterable tags.
#[derive(Debug, Clone, Serialize)]
pub struct StudyMetadata {
    pub title: String,
    pub tags: Vec<TagInfo>,
}
