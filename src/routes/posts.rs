use std::collections::BTreeSet;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::params;
use serde::Deserialize;

use crate::db::models::Post;
use crate::db::{file_exists, timestamp, user_exists};
use crate::error::{AppError, AppResult};
use crate::extractors::{CurrentUser, MaybeUser};
use crate::routes::Page;
use crate::state::AppState;
use crate::visibility::queries::{
    listed_posts, member_group_posts, require_group_member, require_post, Feed,
};
use crate::visibility::{PostPrivacy, Viewer};

// --- Forms ---

#[derive(Deserialize)]
pub struct CreatePostRequest {
    #[serde(default)]
    pub content: String,
    pub privacy: Option<PostPrivacy>,
    pub group_id: Option<i64>,
    #[serde(default)]
    pub images: Vec<String>,
    /// Allow-list for almost-private posts.
    #[serde(default, alias = "allowed_users")]
    pub selected_users: Vec<i64>,
}

// --- Router ---

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/post", post(create_post))
        .route("/post/{id}", get(get_post).delete(delete_post))
        .route("/posts", get(feed))
        .route("/posts/groups", get(group_feed))
        .route("/posts/following", get(following_feed))
}

/// Settles the stored privacy. A group post is always `group`.
fn effective_privacy(
    requested: Option<PostPrivacy>,
    group_id: Option<i64>,
) -> AppResult<PostPrivacy> {
    match (group_id, requested) {
        (Some(_), _) => Ok(PostPrivacy::Group),
        (None, Some(PostPrivacy::Group)) => Err(AppError::BadRequest(
            "Group privacy requires a group_id".into(),
        )),
        (None, Some(privacy)) => Ok(privacy),
        (None, None) => Ok(PostPrivacy::Public),
    }
}

// --- Handlers ---

async fn create_post(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreatePostRequest>,
) -> AppResult<(StatusCode, Json<Post>)> {
    let content = req.content.trim().to_string();
    let images: Vec<String> = req
        .images
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if content.is_empty() && images.is_empty() {
        return Err(AppError::BadRequest("Content is required".into()));
    }
    let privacy = effective_privacy(req.privacy, req.group_id)?;
    let selected: BTreeSet<i64> = req.selected_users.into_iter().collect();

    let mut conn = state.db.get()?;
    if let Some(group_id) = req.group_id {
        require_group_member(&conn, group_id, Viewer::User(user.id))?;
    }
    for token in &images {
        if !file_exists(&conn, token)? {
            return Err(AppError::BadRequest(format!("Unknown image {}", token)));
        }
    }
    if privacy == PostPrivacy::AlmostPrivate {
        if selected.is_empty() {
            return Err(AppError::BadRequest(
                "Almost-private posts need at least one selected user".into(),
            ));
        }
        for id in &selected {
            if !user_exists(&conn, *id)? {
                return Err(AppError::BadRequest(format!("Unknown user {}", id)));
            }
        }
    }

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO posts (author_id, group_id, privacy, content, images, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user.id,
            req.group_id,
            privacy,
            content,
            images.join(","),
            timestamp(Utc::now())
        ],
    )?;
    let post_id = tx.last_insert_rowid();
    if privacy == PostPrivacy::AlmostPrivate {
        for id in &selected {
            tx.execute(
                "INSERT INTO selected_users (post_id, user_id) VALUES (?1, ?2)",
                params![post_id, id],
            )?;
        }
    }
    tx.commit()?;

    tracing::info!(post_id, author = user.id, %privacy, "Post created");
    let post = require_post(&conn, Viewer::User(user.id), post_id)?;
    Ok((StatusCode::CREATED, Json(post)))
}

async fn get_post(
    State(state): State<AppState>,
    maybe: MaybeUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Post>> {
    let conn = state.db.get()?;
    Ok(Json(require_post(&conn, maybe.viewer(), id)?))
}

/// Soft delete, author only.
async fn delete_post(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    let conn = state.db.get()?;
    let post = require_post(&conn, Viewer::User(user.id), id)?;
    if post.author_id != user.id {
        return Err(AppError::Forbidden);
    }
    conn.execute(
        "UPDATE posts SET deleted_at = ?2 WHERE id = ?1",
        params![id, timestamp(Utc::now())],
    )?;
    Ok(StatusCode::NO_CONTENT)
}

async fn feed(
    State(state): State<AppState>,
    maybe: MaybeUser,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<Post>>> {
    let conn = state.db.get()?;
    Ok(Json(listed_posts(
        &conn,
        maybe.viewer(),
        Feed::All,
        page.before_id,
    )?))
}

async fn following_feed(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<Post>>> {
    let conn = state.db.get()?;
    Ok(Json(listed_posts(
        &conn,
        Viewer::User(user.id),
        Feed::Following,
        page.before_id,
    )?))
}

async fn group_feed(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<Post>>> {
    let conn = state.db.get()?;
    Ok(Json(member_group_posts(
        &conn,
        Viewer::User(user.id),
        page.before_id,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_forces_group_privacy() {
        assert_eq!(
            effective_privacy(Some(PostPrivacy::Public), Some(3)).unwrap(),
            PostPrivacy::Group
        );
        assert_eq!(effective_privacy(None, None).unwrap(), PostPrivacy::Public);
        assert!(effective_privacy(Some(PostPrivacy::Group), None).is_err());
    }

    #[test]
    fn manual_privacy_and_allowed_users_alias() {
        let req: CreatePostRequest = serde_json::from_str(
            r#"{"content":"hi","privacy":"manual","allowed_users":[2,3,2]}"#,
        )
        .unwrap();
        assert_eq!(req.privacy, Some(PostPrivacy::AlmostPrivate));
        assert_eq!(req.selected_users, vec![2, 3, 2]);
    }
}
