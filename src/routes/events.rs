use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::{named_params, params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::models::{Attendance, Event, UserLimited, EVENT_COLUMNS, USER_LIMITED_COLUMNS};
use crate::db::{parse_timestamp, timestamp, PAGE_SIZE};
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::notify::{EventRef, GroupRef, Notification, UserRef};
use crate::routes::Page;
use crate::state::AppState;
use crate::visibility::queries::require_group_member;
use crate::visibility::{attendance_open, Viewer};

// --- Views ---

#[derive(Serialize)]
pub struct EventView {
    #[serde(flatten)]
    pub event: Event,
    pub going: i64,
    pub not_going: i64,
    pub my_status: Option<Attendance>,
}

#[derive(Serialize)]
pub struct EventMembers {
    pub going: Vec<UserLimited>,
    pub not_going: Vec<UserLimited>,
}

// --- Forms ---

#[derive(Deserialize)]
pub struct CreateEventRequest {
    pub group_id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// RFC 3339.
    pub starts_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttendChoice {
    Going,
    NotGoing,
    Unset,
}

impl AttendChoice {
    fn attendance(self) -> Option<Attendance> {
        match self {
            AttendChoice::Going => Some(Attendance::Going),
            AttendChoice::NotGoing => Some(Attendance::NotGoing),
            AttendChoice::Unset => None,
        }
    }
}

#[derive(Deserialize)]
pub struct AttendRequest {
    pub status: AttendChoice,
}

// --- Router ---

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/event", post(create_event))
        .route("/event/{id}", get(get_event))
        .route("/event/{id}/attend", post(attend))
        .route("/event/{id}/members", get(event_members))
        .route("/events/my", get(my_events))
        .route("/group/{id}/events", get(group_events))
}

// --- Queries ---

fn load_event(conn: &Connection, id: i64) -> AppResult<Event> {
    conn.query_row(
        &format!("SELECT {} FROM events e WHERE e.id = ?1", EVENT_COLUMNS),
        params![id],
        Event::from_row,
    )
    .optional()?
    .ok_or(AppError::NotFound)
}

/// The event, if the viewer belongs to its group.
fn visible_event(conn: &Connection, id: i64, viewer: Viewer) -> AppResult<Event> {
    let event = load_event(conn, id)?;
    require_group_member(conn, event.group_id, viewer)?;
    Ok(event)
}

fn event_view(conn: &Connection, event: Event, viewer: Viewer) -> AppResult<EventView> {
    let (going, not_going): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(status = 'going'), 0), COALESCE(SUM(status = 'not-going'), 0)
         FROM event_participants WHERE event_id = ?1",
        params![event.id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let my_status = conn
        .query_row(
            "SELECT status FROM event_participants WHERE event_id = ?1 AND user_id = ?2",
            params![event.id, viewer.id()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(EventView {
        event,
        going,
        not_going,
        my_status,
    })
}

fn participants(
    conn: &Connection,
    event_id: i64,
    status: Attendance,
) -> Result<Vec<UserLimited>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM event_participants ep JOIN users u ON u.id = ep.user_id
         WHERE ep.event_id = ?1 AND ep.status = ?2 ORDER BY u.id",
        USER_LIMITED_COLUMNS
    ))?;
    let rows = stmt.query_map(params![event_id, status], |row| {
        UserLimited::from_row_at(row, 0)
    })?;
    rows.collect()
}

fn accepted_members(conn: &Connection, group_id: i64) -> Result<Vec<i64>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM group_members WHERE group_id = ?1 AND status = 'accepted'",
    )?;
    let rows = stmt.query_map(params![group_id], |row| row.get(0))?;
    rows.collect()
}

// --- Handlers ---

async fn create_event(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreateEventRequest>,
) -> AppResult<(StatusCode, Json<EventView>)> {
    let title = req.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::BadRequest("Title is required".into()));
    }
    let starts_at = parse_timestamp(req.starts_at.trim())
        .ok_or_else(|| AppError::BadRequest("starts_at must be an RFC 3339 timestamp".into()))?;

    let conn = state.db.get()?;
    let viewer = Viewer::User(user.id);
    require_group_member(&conn, req.group_id, viewer)?;

    conn.execute(
        "INSERT INTO events (group_id, author_id, title, description, starts_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            req.group_id,
            user.id,
            title,
            req.description.trim(),
            timestamp(starts_at),
            timestamp(Utc::now())
        ],
    )?;
    let event = load_event(&conn, conn.last_insert_rowid())?;

    let creator = conn.query_row(
        "SELECT id, first_name, last_name FROM users WHERE id = ?1",
        params![user.id],
        |row| {
            Ok(UserRef {
                id: row.get(0)?,
                name: format!("{} {}", row.get::<_, String>(1)?, row.get::<_, String>(2)?),
            })
        },
    )?;
    let group = conn.query_row(
        "SELECT id, name FROM user_groups WHERE id = ?1",
        params![req.group_id],
        |row| {
            Ok(GroupRef {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        },
    )?;
    state.notifier.dispatch(Notification::EventCreated {
        creator,
        members: accepted_members(&conn, req.group_id)?,
        group,
        event: EventRef {
            id: event.id,
            title: event.title.clone(),
        },
    });

    tracing::info!(event_id = event.id, group_id = req.group_id, "Event created");
    Ok((StatusCode::CREATED, Json(event_view(&conn, event, viewer)?)))
}

async fn get_event(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Json<EventView>> {
    let conn = state.db.get()?;
    let viewer = Viewer::User(user.id);
    let event = visible_event(&conn, id, viewer)?;
    Ok(Json(event_view(&conn, event, viewer)?))
}

async fn attend(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<AttendRequest>,
) -> AppResult<Json<EventView>> {
    let conn = state.db.get()?;
    let viewer = Viewer::User(user.id);
    let event = visible_event(&conn, id, viewer)?;

    let starts_at = parse_timestamp(&event.starts_at)
        .ok_or_else(|| AppError::Internal(format!("bad starts_at on event {}", id)))?;
    if !attendance_open(starts_at, Utc::now()) {
        return Err(AppError::BadRequest("Event has already started".into()));
    }

    match req.status.attendance() {
        Some(status) => {
            conn.execute(
                "INSERT INTO event_participants (event_id, user_id, status) VALUES (?1, ?2, ?3)
                 ON CONFLICT (event_id, user_id) DO UPDATE SET status = excluded.status",
                params![id, user.id, status],
            )?;
        }
        None => {
            conn.execute(
                "DELETE FROM event_participants WHERE event_id = ?1 AND user_id = ?2",
                params![id, user.id],
            )?;
        }
    }

    Ok(Json(event_view(&conn, event, viewer)?))
}

async fn event_members(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Json<EventMembers>> {
    let conn = state.db.get()?;
    visible_event(&conn, id, Viewer::User(user.id))?;
    Ok(Json(EventMembers {
        going: participants(&conn, id, Attendance::Going)?,
        not_going: participants(&conn, id, Attendance::NotGoing)?,
    }))
}

/// Events across every group the viewer belongs to.
async fn my_events(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<Event>>> {
    let conn = state.db.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM events e
         JOIN group_members m ON m.group_id = e.group_id
         WHERE m.user_id = :viewer AND m.status = 'accepted'
           AND (:before IS NULL OR e.id < :before)
         ORDER BY e.id DESC LIMIT :limit",
        EVENT_COLUMNS
    ))?;
    let rows = stmt.query_map(
        named_params! {
            ":viewer": user.id,
            ":before": page.before_id,
            ":limit": PAGE_SIZE,
        },
        Event::from_row,
    )?;
    Ok(Json(rows.collect::<Result<Vec<_>, _>>()?))
}

async fn group_events(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(group_id): Path<i64>,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<Event>>> {
    let conn = state.db.get()?;
    require_group_member(&conn, group_id, Viewer::User(user.id))?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM events e
         WHERE e.group_id = :group AND (:before IS NULL OR e.id < :before)
         ORDER BY e.id DESC LIMIT :limit",
        EVENT_COLUMNS
    ))?;
    let rows = stmt.query_map(
        named_params! {
            ":group": group_id,
            ":before": page.before_id,
            ":limit": PAGE_SIZE,
        },
        Event::from_row,
    )?;
    Ok(Json(rows.collect::<Result<Vec<_>, _>>()?))
}
