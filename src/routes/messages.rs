use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::{named_params, params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::models::{Message, UserLimited, USER_LIMITED_COLUMNS};
use crate::db::{timestamp, PAGE_SIZE};
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::routes::Page;
use crate::state::AppState;
use crate::visibility::queries::require_group_member;
use crate::visibility::Viewer;

const MESSAGE_COLUMNS: &str =
    "m.id, m.sender_id, m.receiver_id, m.is_group, m.content, m.created_at";

#[derive(Debug, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub sender: UserLimited,
}

impl MessageView {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            message: Message::from_row(row)?,
            sender: UserLimited::from_row_at(row, 6)?,
        })
    }
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub receiver_id: i64,
    #[serde(default)]
    pub is_group: bool,
    pub content: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/message", post(send_message))
        .route("/messages/{user_id}", get(direct_messages))
        .route("/group/{id}/messages", get(group_messages))
}

/// A direct message needs the receiver to be public or linked to the sender
/// by an accepted follow in either direction.
fn may_message(conn: &Connection, sender: i64, receiver: i64) -> AppResult<()> {
    let private: bool = conn
        .query_row(
            "SELECT private FROM users WHERE id = ?1",
            params![receiver],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(AppError::NotFound)?;
    if !private {
        return Ok(());
    }
    let linked: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM followers WHERE status = 'accepted'
         AND ((follower_id = ?1 AND followee_id = ?2) OR (follower_id = ?2 AND followee_id = ?1))",
        params![sender, receiver],
        |row| row.get(0),
    )?;
    if linked {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

fn group_member_ids(conn: &Connection, group_id: i64) -> Result<Vec<i64>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM group_members WHERE group_id = ?1 AND status = 'accepted'",
    )?;
    let rows = stmt.query_map(params![group_id], |row| row.get(0))?;
    rows.collect()
}

async fn send_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<(StatusCode, Json<MessageView>)> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(AppError::BadRequest("Content is required".into()));
    }

    let conn = state.db.get()?;
    let targets = if req.is_group {
        require_group_member(&conn, req.receiver_id, Viewer::User(user.id))?;
        group_member_ids(&conn, req.receiver_id)?
    } else {
        if req.receiver_id == user.id {
            return Err(AppError::BadRequest("Cannot message yourself".into()));
        }
        may_message(&conn, user.id, req.receiver_id)?;
        vec![user.id, req.receiver_id]
    };

    conn.execute(
        "INSERT INTO messages (sender_id, receiver_id, is_group, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            user.id,
            req.receiver_id,
            req.is_group,
            content,
            timestamp(Utc::now())
        ],
    )?;
    let id = conn.last_insert_rowid();
    let view = conn.query_row(
        &format!(
            "SELECT {}, {} FROM messages m JOIN users u ON u.id = m.sender_id WHERE m.id = ?1",
            MESSAGE_COLUMNS, USER_LIMITED_COLUMNS
        ),
        params![id],
        MessageView::from_row,
    )?;

    let frame = json!({
        "type": "message",
        "targets": targets,
        "message": &view,
    });
    state.hub.broadcast(frame.to_string()).await;

    Ok((StatusCode::CREATED, Json(view)))
}

/// Both directions of the conversation with `user_id`.
async fn direct_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(other): Path<i64>,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<MessageView>>> {
    let conn = state.db.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {}, {} FROM messages m JOIN users u ON u.id = m.sender_id
         WHERE m.is_group = 0
           AND ((m.sender_id = :me AND m.receiver_id = :other)
             OR (m.sender_id = :other AND m.receiver_id = :me))
           AND (:before IS NULL OR m.id < :before)
         ORDER BY m.id DESC LIMIT :limit",
        MESSAGE_COLUMNS, USER_LIMITED_COLUMNS
    ))?;
    let rows = stmt.query_map(
        named_params! {
            ":me": user.id,
            ":other": other,
            ":before": page.before_id,
            ":limit": PAGE_SIZE,
        },
        MessageView::from_row,
    )?;
    Ok(Json(rows.collect::<Result<Vec<_>, _>>()?))
}

async fn group_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(group_id): Path<i64>,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<MessageView>>> {
    let conn = state.db.get()?;
    require_group_member(&conn, group_id, Viewer::User(user.id))?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {}, {} FROM messages m JOIN users u ON u.id = m.sender_id
         WHERE m.is_group = 1 AND m.receiver_id = :group
           AND (:before IS NULL OR m.id < :before)
         ORDER BY m.id DESC LIMIT :limit",
        MESSAGE_COLUMNS, USER_LIMITED_COLUMNS
    ))?;
    let rows = stmt.query_map(
        named_params! {
            ":group": group_id,
            ":before": page.before_id,
            ":limit": PAGE_SIZE,
        },
        MessageView::from_row,
    )?;
    Ok(Json(rows.collect::<Result<Vec<_>, _>>()?))
}
