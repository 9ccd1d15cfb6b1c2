use axum::extract::State;
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use nm_core::files::{BlobFile, UploadedFile};
use serde::{Deserialize, Serialize};

use crate::auth::require_user;
use crate::files::FileRepository;
use crate::{ApiError, ApiResult, AppState};

#[derive(Deserialize)]
pub struct SecureMessageRequest {
    pub message: String,
}

#[derive(Serialize)]
pub struct SecureMessageResponse {
    pub file: UploadedFile,
}

/// Stores the message body as a private `text/plain` object keyed under the
/// caller's user id.
pub async fn create_secure_message(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<SecureMessageRequest>,
) -> ApiResult<Json<SecureMessageResponse>> {
    let user = require_user(&state, &jar).await?;

    if payload.message.trim().is_empty() {
        return Err(ApiError::validation("message is required"));
    }

    let file = BlobFile::new(
        payload.message.into_bytes(),
        state.message_bucket.clone(),
        &user.id,
        "text/plain",
    );

    let repository = FileRepository::new(state.blob.clone(), state.pool.clone());
    let uploaded = repository.save_blob_file(file).await?;

    Ok(Json(SecureMessageResponse { file: uploaded }))
}
