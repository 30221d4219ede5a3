use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;
use serde_json::json;

use crate::auth::password::{hash_password, verify_password, MIN_PASSWORD_LEN};
use crate::db::models::{User, USER_COLUMNS};
use crate::db::{file_exists, timestamp};
use crate::error::{AppError, AppResult};
use crate::extractors::{clear_session_cookie, session_cookie, CurrentUser};
use crate::state::AppState;

// -- Request types --

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub nickname: Option<String>,
    pub about: Option<String>,
    pub date_of_birth: Option<String>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub private: bool,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    /// Email address or nickname.
    #[serde(alias = "login")]
    pub email: String,
    pub password: String,
}

/// Trims optional free text, mapping blanks to `None`.
pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn validate_date_of_birth(raw: &Option<String>) -> AppResult<()> {
    if let Some(raw) = raw {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| AppError::BadRequest("date_of_birth must be YYYY-MM-DD".into()))?;
    }
    Ok(())
}

// -- Handlers --

/// POST /register — create an account and open its first session.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<Response> {
    let email = req.email.trim().to_string();
    let first_name = req.first_name.trim().to_string();
    let last_name = req.last_name.trim().to_string();

    if !email.contains('@') {
        return Err(AppError::BadRequest("A valid email is required".into()));
    }
    if first_name.is_empty() || last_name.is_empty() {
        return Err(AppError::BadRequest(
            "First and last name are required".into(),
        ));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    let nickname = non_blank(req.nickname);
    let about = non_blank(req.about);
    let date_of_birth = non_blank(req.date_of_birth);
    let avatar = non_blank(req.avatar);
    validate_date_of_birth(&date_of_birth)?;

    if let Some(ref token) = avatar {
        let conn = state.db.get()?;
        if !file_exists(&conn, token)? {
            return Err(AppError::BadRequest("Unknown avatar file".into()));
        }
    }

    let cost = state.config.auth.bcrypt_cost;
    let password = req.password;
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&password, cost))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

    let user = {
        let conn = state.db.get()?;
        conn.execute(
            "INSERT INTO users (email, password_hash, first_name, last_name, nickname, about,
                                avatar, date_of_birth, private, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                email,
                password_hash,
                first_name,
                last_name,
                nickname,
                about,
                avatar,
                date_of_birth,
                req.private,
                timestamp(chrono::Utc::now())
            ],
        )
        .map_err(|e| AppError::from_insert(e, "Email or nickname already taken"))?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {} FROM users u WHERE u.id = ?1", USER_COLUMNS),
            params![id],
            User::from_row,
        )?
    };

    let session = state.sessions.create(user.id).await?;
    tracing::info!(user_id = user.id, "Registered user");

    Ok((
        StatusCode::CREATED,
        [(
            header::SET_COOKIE,
            session_cookie(
                &state.config.auth.cookie_name,
                &session.token,
                session.expires_at,
            ),
        )],
        Json(json!({ "user": user, "token": session.token })),
    )
        .into_response())
}

/// POST /login — verify credentials and open a new session.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Response> {
    let login = req.email.trim().to_string();
    let user = {
        let conn = state.db.get()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM users u WHERE u.email = ?1 OR u.nickname = ?1",
                USER_COLUMNS
            ),
            params![login],
            User::from_row,
        )
        .optional()?
    };
    let user = user.ok_or(AppError::Unauthorized)?;

    let hash = user.password_hash.clone();
    let password = req.password;
    let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    if !verified {
        return Err(AppError::Unauthorized);
    }

    let session = state.sessions.create(user.id).await?;
    tracing::info!(user_id = user.id, "User logged in");

    Ok((
        [(
            header::SET_COOKIE,
            session_cookie(
                &state.config.auth.cookie_name,
                &session.token,
                session.expires_at,
            ),
        )],
        Json(json!({ "user": user, "token": session.token })),
    )
        .into_response())
}

/// GET /logout — end the current session only.
pub async fn logout(State(state): State<AppState>, user: CurrentUser) -> AppResult<Response> {
    if !state.sessions.delete(&user.token).await? {
        return Err(AppError::Unauthorized);
    }

    Ok((
        StatusCode::NO_CONTENT,
        [(
            header::SET_COOKIE,
            clear_session_cookie(&state.config.auth.cookie_name),
        )],
    )
        .into_response())
}

/// GET /logout/all — end every session of the current user.
pub async fn logout_all(State(state): State<AppState>, user: CurrentUser) -> AppResult<Response> {
    let count = state.sessions.delete_all_for_user(user.id).await?;
    tracing::info!(user_id = user.id, sessions = count, "Logged out everywhere");

    Ok((
        StatusCode::NO_CONTENT,
        [(
            header::SET_COOKIE,
            clear_session_cookie(&state.config.auth.cookie_name),
        )],
    )
        .into_response())
}
