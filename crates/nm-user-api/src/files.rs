use axum::extract::{Path, State};
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Utc};
use nm_core::blob::{BlobClient, BlobError};
use nm_core::files::{BlobFile, UploadedFile};
use serde::Serialize;
use sqlx::{Pool, Postgres, Row};
use thiserror::Error;

use crate::auth::require_developer;
use crate::{ApiError, ApiResult, AppState};

#[derive(Debug, Error)]
pub(crate) enum FileStoreError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<FileStoreError> for ApiError {
    fn from(err: FileStoreError) -> Self {
        match err {
            FileStoreError::Blob(err) => err.into(),
            FileStoreError::Database(err) => err.into(),
        }
    }
}

/// Uploads objects to the blob store and keeps the `files` metadata table in
/// step. The metadata row is written only after the object write succeeded,
/// so a transport failure never leaves a row pointing at nothing.
pub(crate) struct FileRepository {
    blob: BlobClient,
    pool: Pool<Postgres>,
}

impl FileRepository {
    pub fn new(blob: BlobClient, pool: Pool<Postgres>) -> Self {
        Self { blob, pool }
    }

    pub async fn save_blob_file(&self, file: BlobFile) -> Result<UploadedFile, FileStoreError> {
        let BlobFile {
            id,
            bucket,
            key,
            content_type,
            bytes,
        } = file;
        let size = bytes.len() as i64;

        self.blob
            .put_object(&bucket, &key, bytes, &content_type)
            .await?;

        let uploaded_at = Utc::now();
        sqlx::query(
            "INSERT INTO files (id, bucket, key, content_type, size, uploaded_at)              VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id.as_str())
        .bind(&bucket)
        .bind(&key)
        .bind(&content_type)
        .bind(size)
        .bind(uploaded_at)
        .execute(&self.pool)
        .await?;

        Ok(UploadedFile {
            id,
            bucket,
            key,
            content_type,
            size,
            uploaded_at,
        })
    }

    /// Absent ids are a no-op; a 404 from the store counts as already gone.
    pub async fn delete_file_by_id(&self, file_id: &str) -> Result<(), FileStoreError> {
        let row = sqlx::query("SELECT bucket, key FROM files WHERE id = $1")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(());
        };

        let bucket: String = row.try_get("bucket")?;
        let key: String = row.try_get("key")?;
        self.blob.delete_object(&bucket, &key).await?;

        sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Serialize)]
pub struct StoredFile {
    pub id: String,
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub size: i64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct FileListResponse {
    pub files: Vec<StoredFile>,
}

pub async fn list_files(
    State(state): State<AppState>,
    jar: CookieJar,
) -> ApiResult<Json<FileListResponse>> {
    require_developer(&state, &jar).await?;

    let rows = sqlx::query(
        "SELECT id, bucket, key, content_type, size, uploaded_at          FROM files          ORDER BY uploaded_at DESC          LIMIT 200",
    )
    .fetch_all(&state.pool)
    .await?;

    let mut files = Vec::with_capacity(rows.len());
    for row in rows {
        files.push(StoredFile {
            id: row.try_get("id")?,
            bucket: row.try_get("bucket")?,
            key: row.try_get("key")?,
            content_type: row.try_get("content_type")?,
            size: row.try_get("size")?,
            uploaded_at: row.try_get("uploaded_at")?,
        });
    }
    Ok(Json(FileListResponse { files }))
}

pub async fn delete_file(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(file_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_developer(&state, &jar).await?;

    let repository = FileRepository::new(state.blob.clone(), state.pool.clone());
    repository.delete_file_by_id(&file_id).await?;

    Ok(Json(serde_json::json!({ "status": "ok" })))
}
