use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::{named_params, params};

use crate::db::models::NotificationRecord;
use crate::db::{timestamp, PAGE_SIZE};
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::routes::Page;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route("/notification/{id}/read", post(mark_read))
}

async fn list_notifications(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<NotificationRecord>>> {
    let conn = state.db.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, kind, content, links, created_at, read_at FROM notifications
         WHERE user_id = :user AND (:before IS NULL OR id < :before)
         ORDER BY id DESC LIMIT :limit",
    )?;
    let rows = stmt.query_map(
        named_params! {
            ":user": user.id,
            ":before": page.before_id,
            ":limit": PAGE_SIZE,
        },
        NotificationRecord::from_row,
    )?;
    Ok(Json(rows.collect::<Result<Vec<_>, _>>()?))
}

/// Someone else's notification is indistinguishable from a missing one.
async fn mark_read(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    let conn = state.db.get()?;
    let updated = conn.execute(
        "UPDATE notifications SET read_at = COALESCE(read_at, ?3)
         WHERE id = ?1 AND user_id = ?2",
        params![id, user.id, timestamp(Utc::now())],
    )?;
    if updated == 0 {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}
