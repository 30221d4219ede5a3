use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::{named_params, params};
use serde::Deserialize;

use crate::auth::handlers::non_blank;
use crate::db::models::{Comment, COMMENT_COLUMNS};
use crate::db::{file_exists, timestamp, PAGE_SIZE};
use crate::error::{AppError, AppResult};
use crate::extractors::{CurrentUser, MaybeUser};
use crate::routes::Page;
use crate::state::AppState;
use crate::visibility::queries::require_post;
use crate::visibility::Viewer;

#[derive(Deserialize)]
pub struct CreateCommentRequest {
    #[serde(default)]
    pub content: String,
    pub image: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/post/{id}/comment", post(create_comment))
        .route("/post/{id}/comments", get(list_comments))
}

/// Comments are visible to whoever can see the post.
async fn create_comment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(post_id): Path<i64>,
    Json(req): Json<CreateCommentRequest>,
) -> AppResult<(StatusCode, Json<Comment>)> {
    let content = req.content.trim().to_string();
    let image = non_blank(req.image);
    if content.is_empty() && image.is_none() {
        return Err(AppError::BadRequest("Content is required".into()));
    }

    let conn = state.db.get()?;
    require_post(&conn, Viewer::User(user.id), post_id)?;
    if let Some(ref token) = image {
        if !file_exists(&conn, token)? {
            return Err(AppError::BadRequest("Unknown image".into()));
        }
    }

    conn.execute(
        "INSERT INTO comments (post_id, author_id, content, image, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![post_id, user.id, content, image, timestamp(Utc::now())],
    )?;
    let id = conn.last_insert_rowid();

    let comment = conn.query_row(
        &format!(
            "SELECT {} FROM comments c JOIN users u ON u.id = c.author_id WHERE c.id = ?1",
            COMMENT_COLUMNS
        ),
        params![id],
        Comment::from_row,
    )?;
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn list_comments(
    State(state): State<AppState>,
    maybe: MaybeUser,
    Path(post_id): Path<i64>,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<Comment>>> {
    let conn = state.db.get()?;
    require_post(&conn, maybe.viewer(), post_id)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM comments c JOIN users u ON u.id = c.author_id
         WHERE c.post_id = :post AND (:before IS NULL OR c.id < :before)
         ORDER BY c.id DESC LIMIT :limit",
        COMMENT_COLUMNS
    ))?;
    let rows = stmt.query_map(
        named_params! {
            ":post": post_id,
            ":before": page.before_id,
            ":limit": PAGE_SIZE,
        },
        Comment::from_row,
    )?;
    Ok(Json(rows.collect::<Result<Vec<_>, _>>()?))
}
