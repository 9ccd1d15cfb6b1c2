use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use thiserror::Error;

use crate::search::{post_matches, PostFilter};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct Post {
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub handle: Option<String>,
}

#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn find_posts_matching(&self, filter: &PostFilter) -> Result<Vec<Post>, RepositoryError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_user_by_handle(&self, handle: &str)
        -> Result<Option<UserRecord>, RepositoryError>;
}

#[derive(Clone)]
pub struct PgRepository {
    pool: Pool<Postgres>,
}

impl PgRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PostRepository for PgRepository {
    async fn find_posts_matching(&self, filter: &PostFilter) -> Result<Vec<Post>, RepositoryError> {
        if filter.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT id, author_id, content, created_at FROM posts WHERE ",
        );
        let mut first = true;
        for tag in &filter.hashtags {
            if !first {
                builder.push(" AND ");
            }
            builder.push("content ILIKE ");
            builder.push_bind(format!("%{}%", escape_like(tag)));
            first = false;
        }
        if !filter.terms.is_empty() {
            if !first {
                builder.push(" AND ");
            }
            builder.push("(");
            for (index, term) in filter.terms.iter().enumerate() {
                if index > 0 {
                    builder.push(" OR ");
                }
                builder.push("content ILIKE ");
                builder.push_bind(format!("%{}%", escape_like(term)));
            }
            builder.push(")");
        }
        builder.push(" ORDER BY created_at DESC, id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut posts = Vec::with_capacity(rows.len());
        for row in rows {
            let post = Post {
                id: row.try_get("id")?,
                author_id: row.try_get("author_id")?,
                content: row.try_get("content")?,
                created_at: row.try_get("created_at")?,
            };
            // ILIKE is only a coarse prefilter; the exact token rule decides.
            if post_matches(&post.content, filter) {
                posts.push(post);
            }
        }
        Ok(posts)
    }
}

#[async_trait]
impl UserRepository for PgRepository {
    async fn find_user_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<UserRecord>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, handle FROM users WHERE handle = $1")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(UserRecord {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                handle: row.try_get("handle")?,
            })),
            None => Ok(None),
        }
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
