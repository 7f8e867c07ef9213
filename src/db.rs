use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    ConnectOptions, Pool, QueryBuilder, Sqlite,
};
use chrono::Utc;
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{AppError, Result};
use crate::import::DeckImport;
use crate::models::{
    ActiveDeck, BookshelfEntry, Card, DifficultyRange, Page, PublicDeck, StudyMetadata, TagInfo,
    User,
};
use crate::study::Catalog;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        picture_url TEXT,
        created_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS decks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id INTEGER NOT NULL REFERENCES users(id),
        title TEXT NOT NULL,
        description TEXT,
        is_public BOOLEAN NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 1,
        front_language TEXT NOT NULL DEFAULT 'en',
        back_language TEXT NOT NULL DEFAULT 'en',
        created_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cards (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        deck_id INTEGER NOT NULL REFERENCES decks(id),
        front_content TEXT NOT NULL,
        back_content TEXT NOT NULL,
        base_difficulty INTEGER NOT NULL DEFAULT 3,
        source TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS card_tags (
        tag_id INTEGER NOT NULL REFERENCES tags(id),
        card_id INTEGER NOT NULL REFERENCES cards(id),
        PRIMARY KEY (tag_id, card_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS active_decks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        deck_id INTEGER NOT NULL REFERENCES decks(id),
        is_favorite BOOLEAN NOT NULL DEFAULT 0,
        total_sessions_played INTEGER NOT NULL DEFAULT 0,
        last_played_at DATETIME,
        created_at DATETIME NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_cards_deck ON cards (deck_id)",
    "CREATE INDEX IF NOT EXISTS idx_active_decks_user ON active_decks (user_id)",
];

const CARD_COLUMNS: &str = "id, deck_id, front_content, back_content, base_difficulty, source";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .log_statements(log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let db = Db { pool };
        db.migrate().await?;

        Ok(db)
    }

    /// Single-connection in-memory database; every pooled connection would
    /// otherwise see its own empty database.
    #[cfg(test)]
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .log_statements(log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Db { pool };
        db.migrate().await?;

        Ok(db)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // --- Users ---

    /// Inserts the user or, if the email is known, syncs name and picture.
    pub async fn upsert_user(&self, email: &str, name: &str, picture_url: Option<&str>) -> Result<User> {
        let existing = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        match existing {
            Some(user) if user.name == name && user.picture_url.as_deref() == picture_url => {
                log::info!("User login (existing): {}", email);
                Ok(user)
            }
            Some(user) => {
                sqlx::query("UPDATE users SET name = ?, picture_url = ? WHERE id = ?")
                    .bind(name)
                    .bind(picture_url)
                    .bind(user.id)
                    .execute(&self.pool)
                    .await?;
                log::info!("Updated user profile for: {}", email);
                Ok(User {
                    name: name.to_string(),
                    picture_url: picture_url.map(str::to_string),
                    ..user
                })
            }
            None => {
                let now = Utc::now();
                let id = sqlx::query(
                    "INSERT INTO users (email, name, picture_url, created_at) VALUES (?, ?, ?, ?)",
                )
                .bind(email)
                .bind(name)
                .bind(picture_url)
                .bind(now)
                .execute(&self.pool)
                .await?
                .last_insert_rowid();
                log::info!("Created new user: {}", email);
                Ok(User {
                    id,
                    email: email.to_string(),
                    name: name.to_string(),
                    picture_url: picture_url.map(str::to_string),
                    created_at: now,
                })
            }
        }
    }

    // --- Public library ---

    /// Public decks, newest first. `is_active` reflects whether `user_id` already has the deck.
    pub async fn list_public_decks(&self, user_id: i64, page: u32, page_size: u32) -> Result<Page<PublicDeck>> {
        let page = page.max(1);
        let offset = i64::from(page - 1) * i64::from(page_size);

        let total: i64 = sqlx::query_scalar("SELECT count(*) FROM decks WHERE is_public = 1")
            .fetch_one(&self.pool)
            .await?;

        let items = sqlx::query_as::<_, PublicDeck>(
            r#"
            SELECT
                d.id, d.title, d.description, u.name AS author,
                d.front_language, d.back_language,
                (SELECT count(*) FROM cards c WHERE c.deck_id = d.id) AS card_count,
                EXISTS (
                    SELECT 1 FROM active_decks a WHERE a.deck_id = d.id AND a.user_id = ?
                ) AS is_active,
                d.created_at
            FROM decks d
            JOIN users u ON u.id = d.owner_id
            WHERE d.is_public = 1
            ORDER BY d.created_at DESC, d.id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(i64::from(page_size))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page { items, total, page, page_size })
    }

    /// Adds a deck to the user's bookshelf. Re-activating keeps the existing
    /// record (and its progress) and still succeeds.
    pub async fn activate_deck(&self, user_id: i64, deck_id: i64) -> Result<i64> {
        let deck_exists: Option<i64> = sqlx::query_scalar("SELECT id FROM decks WHERE id = ?")
            .bind(deck_id)
            .fetch_optional(&self.pool)
            .await?;
        if deck_exists.is_none() {
            return Err(AppError::NotFound(format!("deck {}", deck_id)));
        }

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM active_decks WHERE user_id = ? AND deck_id = ?")
                .bind(user_id)
                .bind(deck_id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = sqlx::query(
            "INSERT INTO active_decks (user_id, deck_id, is_favorite, created_at) VALUES (?, ?, 0, ?)",
        )
        .bind(user_id)
        .bind(deck_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        log::info!("User {} activated deck {} (active id {})", user_id, deck_id, id);
        Ok(id)
    }

    // --- Bookshelf ---

    const BOOKSHELF_SELECT: &'static str = r#"
        SELECT
            a.id AS active_id, d.id AS deck_id, d.title, d.description,
            d.front_language, d.back_language,
            a.is_favorite, a.total_sessions_played, a.last_played_at,
            (SELECT count(*) FROM cards c WHERE c.deck_id = d.id) AS card_count
        FROM active_decks a
        JOIN decks d ON d.id = a.deck_id
    "#;

    pub async fn bookshelf(&self, user_id: i64, page: u32, page_size: u32) -> Result<Page<BookshelfEntry>> {
        let page = page.max(1);
        let offset = i64::from(page - 1) * i64::from(page_size);

        let total: i64 = sqlx::query_scalar("SELECT count(*) FROM active_decks WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            "{} WHERE a.user_id = ? ORDER BY a.last_played_at DESC, a.created_at DESC, a.id DESC LIMIT ? OFFSET ?",
            Self::BOOKSHELF_SELECT
        );
        let items = sqlx::query_as::<_, BookshelfEntry>(&sql)
            .bind(user_id)
            .bind(i64::from(page_size))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(Page { items, total, page, page_size })
    }

    pub async fn favorites(&self, user_id: i64) -> Result<Vec<BookshelfEntry>> {
        let sql = format!(
            "{} WHERE a.user_id = ? AND a.is_favorite = 1 ORDER BY a.last_played_at DESC, a.id DESC",
            Self::BOOKSHELF_SELECT
        );
        Ok(sqlx::query_as::<_, BookshelfEntry>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn owned_active_deck(&self, user_id: i64, active_deck_id: i64) -> Result<ActiveDeck> {
        sqlx::query_as::<_, ActiveDeck>("SELECT * FROM active_decks WHERE id = ? AND user_id = ?")
            .bind(active_deck_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("active deck {}", active_deck_id)))
    }

    /// Flips the favorite flag and returns the new value.
    pub async fn toggle_favorite(&self, user_id: i64, active_deck_id: i64) -> Result<bool> {
        let active = self.owned_active_deck(user_id, active_deck_id).await?;
        let is_favorite = !active.is_favorite;

        sqlx::query("UPDATE active_decks SET is_favorite = ? WHERE id = ?")
            .bind(is_favorite)
            .bind(active.id)
            .execute(&self.pool)
            .await?;

        Ok(is_favorite)
    }

    pub async fn remove_from_bookshelf(&self, user_id: i64, active_deck_id: i64) -> Result<()> {
        let affected = sqlx::query("DELETE FROM active_decks WHERE id = ? AND user_id = ?")
            .bind(active_deck_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if affected == 0 {
            return Err(AppError::NotFound(format!("active deck {}", active_deck_id)));
        }
        Ok(())
    }

    pub async fn study_metadata(&self, user_id: i64, active_deck_id: i64) -> Result<StudyMetadata> {
        let active = self.owned_active_deck(user_id, active_deck_id).await?;

        let title: String = sqlx::query_scalar("SELECT title FROM decks WHERE id = ?")
            .bind(active.deck_id)
            .fetch_one(&self.pool)
            .await?;

        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT t.id, t.name
            FROM tags t
            JOIN card_tags ct ON ct.tag_id = t.id
            JOIN cards c ON c.id = ct.card_id
            WHERE c.deck_id = ?
            ORDER BY t.name
            "#,
        )
        .bind(active.deck_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(StudyMetadata {
            title,
            tags: rows.into_iter().map(|(id, name)| TagInfo { id, name }).collect(),
        })
    }

    // --- Import ---

    /// Writes an already validated and sanitized import as a new deck owned by `user_id`.
    pub async fn save_import(&self, user_id: i64, import: &DeckImport) -> Result<(i64, String)> {
        let mut tx = self.pool.begin().await?;

        let deck_id = sqlx::query(
            "INSERT INTO decks (owner_id, title, description, is_public, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&import.title)
        .bind(&import.description)
        .bind(import.is_public)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let mut tag_cache: HashMap<String, i64> = HashMap::new();

        for card in &import.cards {
            let card_id = sqlx::query(
                "INSERT INTO cards (deck_id, front_content, back_content, base_difficulty, source) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(deck_id)
            .bind(&card.front_content)
            .bind(&card.back_content)
            .bind(i64::from(u8::from(card.base_difficulty)))
            .bind(&card.source)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            for raw in &card.tags {
                let name = raw.trim();
                if name.is_empty() {
                    continue;
                }

                let tag_id = match tag_cache.get(name) {
                    Some(id) => *id,
                    None => {
                        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM tags WHERE name = ?")
                            .bind(name)
                            .fetch_optional(&mut *tx)
                            .await?;
                        let id = match found {
                            Some(id) => id,
                            None => sqlx::query("INSERT INTO tags (name) VALUES (?)")
                                .bind(name)
                                .execute(&mut *tx)
                                .await?
                                .last_insert_rowid(),
                        };
                        tag_cache.insert(name.to_string(), id);
                        id
                    }
                };

                sqlx::query("INSERT OR IGNORE INTO card_tags (tag_id, card_id) VALUES (?, ?)")
                    .bind(tag_id)
                    .bind(card_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;

        log::info!("Import Success: Deck '{}' (ID: {})", import.title, deck_id);
        Ok((deck_id, import.title.clone()))
    }
}

impl Catalog for Db {
    async fn resolve_active_deck(&self, user_id: i64, active_deck_id: i64) -> Result<Option<i64>> {
        let deck_id: Option<i64> =
            sqlx::query_scalar("SELECT deck_id FROM active_decks WHERE id = ? AND user_id = ?")
                .bind(active_deck_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(deck_id)
    }

    async fn list_card_ids(
        &self,
        deck_id: i64,
        difficulty: DifficultyRange,
        tag_ids: Option<&[i64]>,
    ) -> Result<Vec<i64>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT DISTINCT c.id FROM cards c");

        let tag_ids = tag_ids.filter(|ids| !ids.is_empty());
        if tag_ids.is_some() {
            qb.push(" JOIN card_tags ct ON ct.card_id = c.id");
        }

        qb.push(" WHERE c.deck_id = ")
            .push_bind(deck_id)
            .push(" AND c.base_difficulty >= ")
            .push_bind(i64::from(difficulty.min))
            .push(" AND c.base_difficulty <= ")
            .push_bind(i64::from(difficulty.max));

        if let Some(ids) = tag_ids {
            qb.push(" AND ct.tag_id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
        }

        qb.push(" ORDER BY c.id");

        Ok(qb.build_query_scalar::<i64>().fetch_all(&self.pool).await?)
    }

    async fn fetch_cards(&self, card_ids: &[i64]) -> Result<Vec<Card>> {
        if card_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM cards WHERE id IN (", CARD_COLUMNS));
        let mut separated = qb.separated(", ");
        for id in card_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        let mut cards = qb.build_query_as::<Card>().fetch_all(&self.pool).await?;

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT card_id, tag_id FROM card_tags WHERE card_id IN (");
        let mut separated = qb.separated(", ");
        for id in card_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY tag_id");
        let links: Vec<(i64, i64)> = qb.build_query_as().fetch_all(&self.pool).await?;

        let mut tags_by_card: HashMap<i64, Vec<i64>> = HashMap::new();
        for (card_id, tag_id) in links {
            tags_by_card.entry(card_id).or_default().push(tag_id);
        }
        for card in &mut cards {
            if let Some(tags) = tags_by_card.remove(&card.id) {
                card.tag_ids = tags;
            }
        }

        Ok(cards)
    }

    async fn record_session(&self, active_deck_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE active_decks SET total_sessions_played = total_sessions_played + 1, last_played_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(active_deck_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
