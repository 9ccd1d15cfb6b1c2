use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use nm_core::files::{BlobFile, UploadedFile};
use nm_core::handle::{display_handle, normalize_handle, parse_handle};
use serde::Serialize;
use sqlx::{Postgres, QueryBuilder, Row};

use crate::auth::require_user;
use crate::files::FileRepository;
use crate::{ApiError, ApiResult, AppState};

#[derive(Serialize)]
pub struct FollowStats {
    pub followers: i64,
    pub following: i64,
}

#[derive(Serialize)]
pub struct OwnProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    pub handle: Option<String>,
    pub display_handle: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub banner_url: Option<String>,
    pub stats: FollowStats,
}

#[derive(Serialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub handle: Option<String>,
    pub display_handle: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub banner_url: Option<String>,
    pub stats: FollowStats,
}

#[derive(Serialize)]
pub struct UserSummary {
    pub id: String,
    pub name: String,
    pub handle: Option<String>,
    pub display_handle: String,
}

#[derive(Serialize)]
pub struct ViewerState {
    pub is_following: bool,
}

#[derive(Serialize)]
pub struct MeResponse {
    pub user: OwnProfile,
}

#[derive(Serialize)]
pub struct ProfileResponse {
    pub user: UserProfile,
    pub viewer: ViewerState,
}

#[derive(Serialize)]
pub struct FollowResponse {
    pub viewer: ViewerState,
    pub stats: FollowerCount,
}

#[derive(Serialize)]
pub struct FollowerCount {
    pub followers: i64,
}

#[derive(Serialize)]
pub struct UserListResponse {
    pub users: Vec<UserSummary>,
}

pub async fn me(State(state): State<AppState>, jar: CookieJar) -> ApiResult<Json<MeResponse>> {
    let user = require_user(&state, &jar).await?;
    let profile = load_own_profile(&state, &user.id).await?;
    Ok(Json(MeResponse { user: profile }))
}

pub async fn update_me(
    State(state): State<AppState>,
    jar: CookieJar,
    mut multipart: Multipart,
) -> ApiResult<Json<MeResponse>> {
    let user = require_user(&state, &jar).await?;

    let mut name: Option<String> = None;
    let mut bio: Option<String> = None;
    let mut handle_field: Option<String> = None;
    let mut avatar: Option<(Vec<u8>, String)> = None;
    let mut banner: Option<(Vec<u8>, String)> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let Some(field_name) = field.name().map(str::to_string) else {
            continue;
        };
        match field_name.as_str() {
            "name" => name = Some(field.text().await.map_err(bad_multipart)?),
            "bio" => bio = Some(field.text().await.map_err(bad_multipart)?),
            "handle" => handle_field = Some(field.text().await.map_err(bad_multipart)?),
            "avatar" | "banner" => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(bad_multipart)?.to_vec();
                if field_name == "avatar" {
                    avatar = Some((bytes, content_type));
                } else {
                    banner = Some((bytes, content_type));
                }
            }
            _ => {}
        }
    }

    if let Some(name) = &name {
        if name.trim().is_empty() {
            return Err(ApiError::validation("name cannot be empty"));
        }
    }

    // Outer Option: was an update requested. Inner: the new value, where
    // None clears the handle.
    let mut handle_update: Option<Option<String>> = None;
    if let Some(raw) = handle_field {
        if normalize_handle(&raw).is_empty() {
            handle_update = Some(None);
        } else {
            let Some(parsed) = parse_handle(Some(&raw)) else {
                return Err(ApiError::validation(
                    "handle must be 1-15 characters drawn from a-z, 0-9 and _",
                ));
            };
            let taken = sqlx::query("SELECT id FROM users WHERE handle = $1 AND id <> $2")
                .bind(&parsed)
                .bind(&user.id)
                .fetch_optional(&state.pool)
                .await?;
            if taken.is_some() {
                return Err(ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "HANDLE_TAKEN",
                    "handle is already taken",
                ));
            }
            handle_update = Some(Some(parsed));
        }
    }

    let previous = sqlx::query("SELECT avatar_file_id, banner_file_id FROM users WHERE id = $1")
        .bind(&user.id)
        .fetch_optional(&state.pool)
        .await?;
    let Some(previous) = previous else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "user not found",
        ));
    };
    let previous_avatar: Option<String> = previous.try_get("avatar_file_id")?;
    let previous_banner: Option<String> = previous.try_get("banner_file_id")?;

    // Objects land in the blob store before any row is touched; a transport
    // failure aborts the whole update.
    let files = FileRepository::new(state.blob.clone(), state.pool.clone());
    let mut new_avatar: Option<UploadedFile> = None;
    if let Some((bytes, content_type)) = avatar {
        if bytes.is_empty() {
            return Err(ApiError::validation("avatar upload is empty"));
        }
        let file = BlobFile::new(
            bytes,
            state.media_bucket.clone(),
            &format!("avatars/{}", user.id),
            content_type,
        );
        new_avatar = Some(files.save_blob_file(file).await?);
    }
    let mut new_banner: Option<UploadedFile> = None;
    if let Some((bytes, content_type)) = banner {
        if bytes.is_empty() {
            return Err(ApiError::validation("banner upload is empty"));
        }
        let file = BlobFile::new(
            bytes,
            state.media_bucket.clone(),
            &format!("banners/{}", user.id),
            content_type,
        );
        new_banner = Some(files.save_blob_file(file).await?);
    }

    let has_update = name.is_some()
        || bio.is_some()
        || handle_update.is_some()
        || new_avatar.is_some()
        || new_banner.is_some();
    if has_update {
        let mut builder = QueryBuilder::<Postgres>::new("UPDATE users SET updated_at = NOW()");
        if let Some(name) = &name {
            builder.push(", name = ");
            builder.push_bind(name.trim().to_string());
        }
        if let Some(bio) = &bio {
            builder.push(", bio = ");
            builder.push_bind(bio.clone());
        }
        if let Some(handle) = &handle_update {
            builder.push(", handle = ");
            builder.push_bind(handle.clone());
        }
        if let Some(file) = &new_avatar {
            builder.push(", avatar_file_id = ");
            builder.push_bind(file.id.as_str().to_string());
        }
        if let Some(file) = &new_banner {
            builder.push(", banner_file_id = ");
            builder.push_bind(file.id.as_str().to_string());
        }
        builder.push(" WHERE id = ");
        builder.push_bind(&user.id);
        builder.build().execute(&state.pool).await?;
    }

    // Replaced media is removed best-effort; the profile update already
    // committed.
    if new_avatar.is_some() {
        if let Some(old) = previous_avatar {
            if files.delete_file_by_id(&old).await.is_err() {
                tracing::warn!(file_id = %old, "failed to delete replaced avatar");
            }
        }
    }
    if new_banner.is_some() {
        if let Some(old) = previous_banner {
            if files.delete_file_by_id(&old).await.is_err() {
                tracing::warn!(file_id = %old, "failed to delete replaced banner");
            }
        }
    }

    let profile = load_own_profile(&state, &user.id).await?;
    Ok(Json(MeResponse { user: profile }))
}

pub async fn profile(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(user_id): Path<String>,
) -> ApiResult<Json<ProfileResponse>> {
    let viewer = require_user(&state, &jar).await.ok();
    let profile = load_public_profile(&state, &user_id).await?;

    let is_following = match &viewer {
        Some(viewer) => is_following(&state, &viewer.id, &user_id).await?,
        None => false,
    };

    Ok(Json(ProfileResponse {
        user: profile,
        viewer: ViewerState { is_following },
    }))
}

pub async fn follow(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(user_id): Path<String>,
) -> ApiResult<Json<FollowResponse>> {
    let user = require_user(&state, &jar).await?;
    if user.id == user_id {
        return Err(ApiError::validation("cannot follow yourself"));
    }
    ensure_user_exists(&state, &user_id).await?;

    sqlx::query(
        "INSERT INTO follows (follower_id, followee_id, created_at)          VALUES ($1, $2, NOW())          ON CONFLICT (follower_id, followee_id) DO NOTHING",
    )
    .bind(&user.id)
    .bind(&user_id)
    .execute(&state.pool)
    .await?;

    let followers = follower_count(&state, &user_id).await?;
    Ok(Json(FollowResponse {
        viewer: ViewerState { is_following: true },
        stats: FollowerCount { followers },
    }))
}

pub async fn unfollow(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(user_id): Path<String>,
) -> ApiResult<Json<FollowResponse>> {
    let user = require_user(&state, &jar).await?;
    ensure_user_exists(&state, &user_id).await?;

    sqlx::query("DELETE FROM follows WHERE follower_id = $1 AND followee_id = $2")
        .bind(&user.id)
        .bind(&user_id)
        .execute(&state.pool)
        .await?;

    let followers = follower_count(&state, &user_id).await?;
    Ok(Json(FollowResponse {
        viewer: ViewerState {
            is_following: false,
        },
        stats: FollowerCount { followers },
    }))
}

pub async fn followers(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<UserListResponse>> {
    ensure_user_exists(&state, &user_id).await?;
    let users = load_follow_list(
        &state,
        "SELECT u.id, u.name, u.handle          FROM follows f          JOIN users u ON f.follower_id = u.id          WHERE f.followee_id = $1          ORDER BY f.created_at DESC",
        &user_id,
    )
    .await?;
    Ok(Json(UserListResponse { users }))
}

pub async fn following(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<UserListResponse>> {
    ensure_user_exists(&state, &user_id).await?;
    let users = load_follow_list(
        &state,
        "SELECT u.id, u.name, u.handle          FROM follows f          JOIN users u ON f.followee_id = u.id          WHERE f.follower_id = $1          ORDER BY f.created_at DESC",
        &user_id,
    )
    .await?;
    Ok(Json(UserListResponse { users }))
}

async fn load_own_profile(state: &AppState, user_id: &str) -> ApiResult<OwnProfile> {
    let row = sqlx::query(
        "SELECT u.id, u.email, u.name, u.handle, u.bio,                 af.bucket AS avatar_bucket, af.key AS avatar_key,                 bf.bucket AS banner_bucket, bf.key AS banner_key          FROM users u          LEFT JOIN files af ON u.avatar_file_id = af.id          LEFT JOIN files bf ON u.banner_file_id = bf.id          WHERE u.id = $1",
    )
    .bind(user_id)
    .fetch_optional(&state.pool)
    .await?;

    let Some(row) = row else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "user not found",
        ));
    };

    let id: String = row.try_get("id")?;
    let name: String = row.try_get("name")?;
    let handle: Option<String> = row.try_get("handle")?;
    let stats = follow_stats(state, &id).await?;

    Ok(OwnProfile {
        display_handle: display_handle(handle.as_deref(), Some(&name), &id),
        email: row.try_get("email")?,
        bio: row.try_get("bio")?,
        avatar_url: media_url(state, &row, "avatar_bucket", "avatar_key")?,
        banner_url: media_url(state, &row, "banner_bucket", "banner_key")?,
        id,
        name,
        handle,
        stats,
    })
}

async fn load_public_profile(state: &AppState, user_id: &str) -> ApiResult<UserProfile> {
    let own = load_own_profile(state, user_id).await?;
    Ok(UserProfile {
        id: own.id,
        name: own.name,
        handle: own.handle,
        display_handle: own.display_handle,
        bio: own.bio,
        avatar_url: own.avatar_url,
        banner_url: own.banner_url,
        stats: own.stats,
    })
}

async fn load_follow_list(
    state: &AppState,
    query: &str,
    user_id: &str,
) -> ApiResult<Vec<UserSummary>> {
    let rows = sqlx::query(query)
        .bind(user_id)
        .fetch_all(&state.pool)
        .await?;

    let mut users = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id")?;
        let name: String = row.try_get("name")?;
        let handle: Option<String> = row.try_get("handle")?;
        users.push(UserSummary {
            display_handle: display_handle(handle.as_deref(), Some(&name), &id),
            id,
            name,
            handle,
        });
    }
    Ok(users)
}

async fn follow_stats(state: &AppState, user_id: &str) -> ApiResult<FollowStats> {
    let row = sqlx::query(
        "SELECT            (SELECT COUNT(*) FROM follows WHERE followee_id = $1) AS followers,            (SELECT COUNT(*) FROM follows WHERE follower_id = $1) AS following",
    )
    .bind(user_id)
    .fetch_one(&state.pool)
    .await?;
    Ok(FollowStats {
        followers: row.try_get("followers")?,
        following: row.try_get("following")?,
    })
}

async fn follower_count(state: &AppState, user_id: &str) -> ApiResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM follows WHERE followee_id = $1")
        .bind(user_id)
        .fetch_one(&state.pool)
        .await?;
    Ok(count)
}

async fn is_following(state: &AppState, follower_id: &str, followee_id: &str) -> ApiResult<bool> {
    let row = sqlx::query("SELECT 1 FROM follows WHERE follower_id = $1 AND followee_id = $2")
        .bind(follower_id)
        .bind(followee_id)
        .fetch_optional(&state.pool)
        .await?;
    Ok(row.is_some())
}

async fn ensure_user_exists(state: &AppState, user_id: &str) -> ApiResult<()> {
    let row = sqlx::query("SELECT id FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&state.pool)
        .await?;
    if row.is_none() {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "user not found",
        ));
    }
    Ok(())
}

fn media_url(
    state: &AppState,
    row: &sqlx::postgres::PgRow,
    bucket_column: &str,
    key_column: &str,
) -> ApiResult<Option<String>> {
    let bucket: Option<String> = row.try_get(bucket_column)?;
    let key: Option<String> = row.try_get(key_column)?;
    Ok(match (bucket, key) {
        (Some(bucket), Some(key)) => Some(state.blob.object_url(&bucket, &key)),
        _ => None,
    })
}

fn bad_multipart(err: MultipartError) -> ApiError {
    ApiError::validation(format!("invalid multipart payload: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_state;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::{get, post};
    use axum::Router;
    use tower::ServiceExt;

    fn users_router() -> Router {
        Router::new()
            .route("/v1/users/me", get(me).patch(update_me))
            .route("/v1/users/:user_id/follow", post(follow).delete(unfollow))
            .with_state(test_state())
    }

    #[tokio::test]
    async fn me_requires_session_cookie() {
        let response = users_router()
            .oneshot(
                Request::builder()
                    .uri("/v1/users/me")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn follow_requires_session_cookie() {
        let response = users_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/users/someone/follow")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unfollow_requires_session_cookie() {
        let response = users_router()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/v1/users/someone/follow")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn update_me_requires_session_before_reading_the_form() {
        let response = users_router()
            .oneshot(
                Request::builder()
                    .method("PATCH")
                    .uri("/v1/users/me")
                    .header("content-type", "multipart/form-data; boundary=xyz")
                    .body(Body::from("--xyz--\r\n"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
