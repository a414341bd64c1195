//! Entity store — persistence boundary for cards and comments.
//!
//! SYSTEM CONTEXT
//! ==============
//! The collaboration core treats durable storage as an external collaborator
//! behind the [`EntityStore`] trait. Production uses [`PgEntityStore`] over
//! sqlx; tests and DB-less dev runs use [`MemoryStore`]. Store failures are
//! logged at the call site and surfaced to the requesting client only — they
//! never interrupt fan-out to other connections.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::protocol::ErrorCode;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// An editable unit of content on a board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub board_id: String,
    pub column: String,
    pub position: i64,
    /// Free-form named fields (title, description, assignee, ...).
    pub fields: serde_json::Value,
    pub version: i64,
}

/// A comment attached to a card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub card_id: String,
    pub author_id: String,
    pub content: String,
    pub version: i64,
}

/// Query filter for card listings.
#[derive(Debug, Clone, Default)]
pub struct CardFilter {
    pub board_id: Option<String>,
    pub column: Option<String>,
}

/// Offset pagination.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self { limit: 100, offset: 0 }
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// The subset of the persistence layer the collaboration core needs.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_card(&self, card_id: &str) -> Result<Option<Card>, StoreError>;

    async fn list_cards(&self, filter: &CardFilter, page: Page) -> Result<Vec<Card>, StoreError>;

    /// Persist one accepted field edit. The version has already been
    /// advanced by the version tracker.
    async fn update_card_field(
        &self,
        card_id: &str,
        field: &str,
        value: &serde_json::Value,
        version: i64,
    ) -> Result<(), StoreError>;

    async fn move_card(&self, card_id: &str, column: &str, position: i64) -> Result<(), StoreError>;

    async fn update_comment(&self, comment_id: &str, content: &str, version: i64) -> Result<(), StoreError>;

    async fn delete_comment(&self, comment_id: &str) -> Result<(), StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

/// Reference store backed by Postgres.
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn get_card(&self, card_id: &str) -> Result<Option<Card>, StoreError> {
        let row = sqlx::query_as::<_, (String, String, String, i64, serde_json::Value, i64)>(
            "SELECT id, board_id, col, position, fields, version FROM cards WHERE id = $1",
        )
        .bind(card_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, board_id, column, position, fields, version)| Card {
            id,
            board_id,
            column,
            position,
            fields,
            version,
        }))
    }

    async fn list_cards(&self, filter: &CardFilter, page: Page) -> Result<Vec<Card>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, String, i64, serde_json::Value, i64)>(
            "SELECT id, board_id, col, position, fields, version
             FROM cards
             WHERE ($1::text IS NULL OR board_id = $1)
               AND ($2::text IS NULL OR col = $2)
             ORDER BY board_id, col, position
             LIMIT $3 OFFSET $4",
        )
        .bind(filter.board_id.as_deref())
        .bind(filter.column.as_deref())
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, board_id, column, position, fields, version)| Card {
                id,
                board_id,
                column,
                position,
                fields,
                version,
            })
            .collect())
    }

    async fn update_card_field(
        &self,
        card_id: &str,
        field: &str,
        value: &serde_json::Value,
        version: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE cards
             SET fields = jsonb_set(fields, ARRAY[$2], $3::jsonb), version = $4, updated_at = now()
             WHERE id = $1",
        )
        .bind(card_id)
        .bind(field)
        .bind(value)
        .bind(version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(card_id.to_string()));
        }
        Ok(())
    }

    async fn move_card(&self, card_id: &str, column: &str, position: i64) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE cards SET col = $2, position = $3, updated_at = now() WHERE id = $1")
            .bind(card_id)
            .bind(column)
            .bind(position)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(card_id.to_string()));
        }
        Ok(())
    }

    async fn update_comment(&self, comment_id: &str, content: &str, version: i64) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE comments SET content = $2, version = $3, updated_at = now() WHERE id = $1")
                .bind(comment_id)
                .bind(content)
                .bind(version)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(comment_id.to_string()));
        }
        Ok(())
    }

    async fn delete_comment(&self, comment_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM comments WHERE id = $1")
            .bind(comment_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

/// Map-backed store for tests and DB-less development runs. Unknown entities
/// are created on first write so collaboration flows can be exercised
/// without seeding.
#[derive(Default)]
pub struct MemoryStore {
    cards: RwLock<HashMap<String, Card>>,
    comments: RwLock<HashMap<String, Comment>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_card(&self, card: Card) {
        self.cards.write().await.insert(card.id.clone(), card);
    }

    pub async fn insert_comment(&self, comment: Comment) {
        self.comments.write().await.insert(comment.id.clone(), comment);
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get_card(&self, card_id: &str) -> Result<Option<Card>, StoreError> {
        Ok(self.cards.read().await.get(card_id).cloned())
    }

    async fn list_cards(&self, filter: &CardFilter, page: Page) -> Result<Vec<Card>, StoreError> {
        let cards = self.cards.read().await;
        let mut matched: Vec<Card> = cards
            .values()
            .filter(|c| filter.board_id.as_ref().is_none_or(|b| &c.board_id == b))
            .filter(|c| filter.column.as_ref().is_none_or(|col| &c.column == col))
            .cloned()
            .collect();
        matched.sort_by(|a, b| (&a.board_id, &a.column, a.position).cmp(&(&b.board_id, &b.column, b.position)));

        let offset = usize::try_from(page.offset).unwrap_or(0);
        let limit = usize::try_from(page.limit).unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_card_field(
        &self,
        card_id: &str,
        field: &str,
        value: &serde_json::Value,
        version: i64,
    ) -> Result<(), StoreError> {
        let mut cards = self.cards.write().await;
        let card = cards.entry(card_id.to_string()).or_insert_with(|| Card {
            id: card_id.to_string(),
            board_id: String::new(),
            column: String::new(),
            position: 0,
            fields: serde_json::json!({}),
            version: 0,
        });
        if let serde_json::Value::Object(fields) = &mut card.fields {
            fields.insert(field.to_string(), value.clone());
        }
        card.version = version;
        Ok(())
    }

    async fn move_card(&self, card_id: &str, column: &str, position: i64) -> Result<(), StoreError> {
        let mut cards = self.cards.write().await;
        let card = cards
            .get_mut(card_id)
            .ok_or_else(|| StoreError::NotFound(card_id.to_string()))?;
        card.column = column.to_string();
        card.position = position;
        Ok(())
    }

    async fn update_comment(&self, comment_id: &str, content: &str, version: i64) -> Result<(), StoreError> {
        let mut comments = self.comments.write().await;
        let comment = comments.entry(comment_id.to_string()).or_insert_with(|| Comment {
            id: comment_id.to_string(),
            card_id: String::new(),
            author_id: String::new(),
            content: String::new(),
            version: 0,
        });
        comment.content = content.to_string();
        comment.version = version;
        Ok(())
    }

    async fn delete_comment(&self, comment_id: &str) -> Result<(), StoreError> {
        self.comments.write().await.remove(comment_id);
        Ok(())
    }
}
