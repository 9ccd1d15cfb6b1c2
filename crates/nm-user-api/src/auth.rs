use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use nm_core::handle::{allocate_handle, display_handle};
use nm_core::repository::PgRepository;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::time::Duration;

use crate::{ApiError, ApiResult, AppState};

pub(crate) const SESSION_COOKIE: &str = "nm_session";

const MIN_PASSWORD_LENGTH: usize = 8;
const AUTH_ATTEMPT_LIMIT: u64 = 10;
const AUTH_ATTEMPT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub(crate) struct CurrentUser {
    pub id: String,
    pub email: String,
    pub is_developer: bool,
}

#[derive(Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthenticatedUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub handle: Option<String>,
    pub display_handle: String,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub user: AuthenticatedUser,
    pub expires_at: i64,
}

pub async fn signup(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<SignupRequest>,
) -> ApiResult<(CookieJar, Json<SessionResponse>)> {
    let email = payload.email.trim().to_lowercase();
    throttle(&state, "signup", &email).await?;

    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::validation("a valid email is required"));
    }
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    if payload.password.len() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::validation(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }

    let existing = sqlx::query("SELECT id FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&state.pool)
        .await?;
    if existing.is_some() {
        return Err(ApiError::validation("email is already registered"));
    }

    let user_id = uuid::Uuid::new_v4().to_string();
    let password_hash = hash_password(&payload.password)?;

    // No handle was chosen explicitly, so pick the first free auto candidate.
    // When every candidate is taken the account starts without one and the
    // display fallback covers rendering.
    let repo = PgRepository::new(state.pool.clone());
    let handle = allocate_handle(&repo, &user_id).await?;

    sqlx::query(
        "INSERT INTO users (id, email, name, handle, password_hash, is_developer, created_at, updated_at)          VALUES ($1, $2, $3, $4, $5, FALSE, NOW(), NOW())",
    )
    .bind(&user_id)
    .bind(&email)
    .bind(&name)
    .bind(&handle)
    .bind(&password_hash)
    .execute(&state.pool)
    .await?;

    let (jar, expires_at) = open_session(&state, jar, &user_id).await?;
    tracing::info!(user_id = %user_id, "user signed up");

    let display = display_handle(handle.as_deref(), Some(&name), &user_id);
    Ok((
        jar,
        Json(SessionResponse {
            user: AuthenticatedUser {
                id: user_id,
                email,
                name,
                handle,
                display_handle: display,
            },
            expires_at: expires_at.timestamp(),
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> ApiResult<(CookieJar, Json<SessionResponse>)> {
    let email = payload.email.trim().to_lowercase();
    throttle(&state, "login", &email).await?;

    let row = sqlx::query("SELECT id, email, name, handle, password_hash FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&state.pool)
        .await?;

    let Some(row) = row else {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "AUTH_FAILED",
            "invalid credentials",
        ));
    };

    let password_hash: String = row.try_get("password_hash")?;
    if !verify_password(&payload.password, &password_hash)? {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "AUTH_FAILED",
            "invalid credentials",
        ));
    }

    let user_id: String = row.try_get("id")?;
    let name: String = row.try_get("name")?;
    let handle: Option<String> = row.try_get("handle")?;

    let (jar, expires_at) = open_session(&state, jar, &user_id).await?;

    let display = display_handle(handle.as_deref(), Some(&name), &user_id);
    Ok((
        jar,
        Json(SessionResponse {
            user: AuthenticatedUser {
                id: user_id,
                email: row.try_get("email")?,
                name,
                handle,
                display_handle: display,
            },
            expires_at: expires_at.timestamp(),
        }),
    ))
}

pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> ApiResult<(CookieJar, Json<serde_json::Value>)> {
    let mut jar = jar;
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        let session_id = cookie.value().to_string();
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(&session_id)
            .execute(&state.pool)
            .await
            .ok();
        jar = jar.remove(Cookie::from(SESSION_COOKIE));
    }

    Ok((jar, Json(serde_json::json!({ "status": "ok" }))))
}

pub(crate) async fn require_user(state: &AppState, jar: &CookieJar) -> ApiResult<CurrentUser> {
    let Some(cookie) = jar.get(SESSION_COOKIE) else {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "AUTH_REQUIRED",
            "missing session",
        ));
    };

    let row = sqlx::query(
        "SELECT u.id, u.email, u.is_developer, s.expires_at          FROM sessions s          JOIN users u ON s.user_id = u.id          WHERE s.id = $1",
    )
    .bind(cookie.value())
    .fetch_optional(&state.pool)
    .await?;

    let Some(row) = row else {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "AUTH_REQUIRED",
            "invalid session",
        ));
    };

    let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
    if Utc::now() > expires_at {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "AUTH_REQUIRED",
            "session expired",
        ));
    }

    Ok(CurrentUser {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        is_developer: row.try_get("is_developer")?,
    })
}

pub(crate) async fn require_developer(state: &AppState, jar: &CookieJar) -> ApiResult<CurrentUser> {
    let user = require_user(state, jar).await?;
    if !user.is_developer {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "DEVELOPER_ONLY",
            "developer access required",
        ));
    }
    Ok(user)
}

async fn open_session(
    state: &AppState,
    jar: CookieJar,
    user_id: &str,
) -> ApiResult<(CookieJar, DateTime<Utc>)> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let expires_at = Utc::now() + chrono::Duration::seconds(state.session_ttl_seconds);

    sqlx::query("INSERT INTO sessions (id, user_id, expires_at, created_at) VALUES ($1, $2, $3, NOW())")
        .bind(&session_id)
        .bind(user_id)
        .bind(expires_at)
        .execute(&state.pool)
        .await?;

    let cookie = Cookie::build((SESSION_COOKIE, session_id))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .build();
    Ok((jar.add(cookie), expires_at))
}

async fn throttle(state: &AppState, action: &str, key: &str) -> ApiResult<()> {
    let outcome = state
        .rate_limiter
        .check(
            &format!("{action}:{key}"),
            AUTH_ATTEMPT_LIMIT,
            AUTH_ATTEMPT_WINDOW,
        )
        .await;
    if !outcome.allowed {
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "too many attempts, slow down",
        ));
    }
    Ok(())
}

fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "AUTH_ERROR",
                err.to_string(),
            )
        })?
        .to_string();
    Ok(hash)
}

fn verify_password(password: &str, hash: &str) -> ApiResult<bool> {
    let parsed = PasswordHash::new(hash).map_err(|err| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "AUTH_ERROR",
            err.to_string(),
        )
    })?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_state;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::post;
    use axum::Router;
    use tower::ServiceExt;

    fn auth_router() -> Router {
        Router::new()
            .route("/v1/auth/signup", post(signup))
            .route("/v1/auth/login", post(login))
            .route("/v1/auth/logout", post(logout))
            .with_state(test_state())
    }

    #[tokio::test]
    async fn signup_rejects_invalid_email_before_touching_the_db() {
        let response = auth_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/auth/signup")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"email":"not-an-email","password":"longenough","name":"A"}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn signup_rejects_short_passwords() {
        let response = auth_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/auth/signup")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"email":"a@example.com","password":"short","name":"A"}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn login_rejects_invalid_json() {
        let response = auth_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from("{invalid"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logout_without_cookie_returns_ok() {
        let response = auth_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/auth/logout")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn password_hash_roundtrip() {
        let hash = hash_password("correct horse battery").expect("hash");
        assert!(verify_password("correct horse battery", &hash).expect("verify"));
        assert!(!verify_password("wrong password", &hash).expect("verify"));
    }
}
