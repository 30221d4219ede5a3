use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::{named_params, params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::models::{
    Group, GroupMember, Post, UserLimited, GROUP_COLUMNS, USER_LIMITED_COLUMNS,
};
use crate::db::{timestamp, PAGE_SIZE};
use crate::error::{AppError, AppResult};
use crate::extractors::{CurrentUser, MaybeUser};
use crate::membership::{GroupAccess, GroupRole, MembershipStatus};
use crate::routes::Page;
use crate::state::AppState;
use crate::visibility::queries::{group_posts, require_group_member};
use crate::visibility::Viewer;

// --- Views ---

#[derive(Serialize)]
pub struct GroupSummary {
    #[serde(flatten)]
    pub group: Group,
    pub member_count: i64,
    pub includes_me: bool,
}

#[derive(Serialize)]
pub struct GroupDetails {
    #[serde(flatten)]
    pub group: Group,
    pub owner: UserLimited,
    pub member_count: i64,
    pub my_status: Option<MembershipStatus>,
    pub my_role: Option<GroupRole>,
}

#[derive(Serialize)]
pub struct PendingMembers {
    pub requested: Vec<UserLimited>,
    pub invited: Vec<UserLimited>,
}

// --- Forms ---

#[derive(Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub access: GroupAccess,
}

// --- Router ---

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/group", post(create_group))
        .route("/groups", get(list_groups))
        .route("/groups/my", get(my_groups))
        .route("/group/{id}", get(group_details))
        .route("/group/{id}/join", post(join))
        .route("/group/{id}/leave", post(leave))
        .route("/group/{id}/decline", post(decline))
        .route("/group/{id}/invite/{user}", post(invite))
        .route("/group/{id}/reject/{user}", post(reject))
        .route("/group/{id}/kick/{user}", post(kick))
        .route("/group/{id}/transfer/{user}", post(transfer))
        .route("/group/{id}/members", get(members))
        .route("/group/{id}/pending", get(pending))
        .route("/group/{id}/posts", get(posts))
}

const SUMMARY_SELECT: &str = "SELECT g.id, g.name, g.description, g.access, g.created_at,
        (SELECT COUNT(*) FROM group_members m
          WHERE m.group_id = g.id AND m.status = 'accepted'),
        EXISTS (SELECT 1 FROM group_members m
          WHERE m.group_id = g.id AND m.user_id = :viewer AND m.status = 'accepted')
     FROM user_groups g";

fn summaries(
    conn: &Connection,
    viewer: Viewer,
    only_mine: bool,
    before_id: Option<i64>,
) -> Result<Vec<GroupSummary>, rusqlite::Error> {
    let mine = if only_mine {
        "AND EXISTS (SELECT 1 FROM group_members m
              WHERE m.group_id = g.id AND m.user_id = :viewer AND m.status = 'accepted')"
    } else {
        ""
    };
    let mut stmt = conn.prepare(&format!(
        "{} WHERE (:before IS NULL OR g.id < :before) {} ORDER BY g.id DESC LIMIT :limit",
        SUMMARY_SELECT, mine
    ))?;
    let rows = stmt.query_map(
        named_params! {
            ":viewer": viewer.id(),
            ":before": before_id,
            ":limit": PAGE_SIZE,
        },
        |row| {
            Ok(GroupSummary {
                group: Group::from_row(row)?,
                member_count: row.get(5)?,
                includes_me: row.get(6)?,
            })
        },
    )?;
    rows.collect()
}

fn load_group(conn: &Connection, id: i64) -> AppResult<Group> {
    conn.query_row(
        &format!("SELECT {} FROM user_groups g WHERE g.id = ?1", GROUP_COLUMNS),
        params![id],
        Group::from_row,
    )
    .optional()?
    .ok_or(AppError::NotFound)
}

fn users_with_status(
    conn: &Connection,
    group_id: i64,
    status: MembershipStatus,
) -> Result<Vec<UserLimited>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM group_members m JOIN users u ON u.id = m.user_id
         WHERE m.group_id = ?1 AND m.status = ?2 ORDER BY m.updated_at DESC",
        USER_LIMITED_COLUMNS
    ))?;
    let rows = stmt.query_map(params![group_id, status], |row| {
        UserLimited::from_row_at(row, 0)
    })?;
    rows.collect()
}

// --- Handlers ---

async fn create_group(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreateGroupRequest>,
) -> AppResult<(StatusCode, Json<Group>)> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest("Group name is required".into()));
    }

    let mut conn = state.db.get()?;
    let tx = conn.transaction()?;
    let now = timestamp(Utc::now());
    tx.execute(
        "INSERT INTO user_groups (name, description, access, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![name, req.description.trim(), req.access, now],
    )
    .map_err(|e| AppError::from_insert(e, "Group name already taken"))?;
    let id = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO group_members (group_id, user_id, status, role, created_at, updated_at)
         VALUES (?1, ?2, 'accepted', 'owner', ?3, ?3)",
        params![id, user.id, now],
    )?;
    tx.commit()?;

    tracing::info!(group_id = id, owner = user.id, "Group created");
    Ok((StatusCode::CREATED, Json(load_group(&conn, id)?)))
}

async fn list_groups(
    State(state): State<AppState>,
    maybe: MaybeUser,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<GroupSummary>>> {
    let conn = state.db.get()?;
    Ok(Json(summaries(
        &conn,
        maybe.viewer(),
        false,
        page.before_id,
    )?))
}

async fn my_groups(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<GroupSummary>>> {
    let conn = state.db.get()?;
    Ok(Json(summaries(
        &conn,
        Viewer::User(user.id),
        true,
        page.before_id,
    )?))
}

async fn group_details(
    State(state): State<AppState>,
    maybe: MaybeUser,
    Path(id): Path<i64>,
) -> AppResult<Json<GroupDetails>> {
    let conn = state.db.get()?;
    let group = load_group(&conn, id)?;
    let owner = conn.query_row(
        &format!(
            "SELECT {} FROM group_members m JOIN users u ON u.id = m.user_id
             WHERE m.group_id = ?1 AND m.role = 'owner'",
            USER_LIMITED_COLUMNS
        ),
        params![id],
        |row| UserLimited::from_row_at(row, 0),
    )?;
    let member_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND status = 'accepted'",
        params![id],
        |row| row.get(0),
    )?;
    let mine = conn
        .query_row(
            "SELECT status, role FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![id, maybe.viewer().id()],
            |row| {
                Ok((
                    row.get::<_, MembershipStatus>(0)?,
                    row.get::<_, GroupRole>(1)?,
                ))
            },
        )
        .optional()?;

    Ok(Json(GroupDetails {
        group,
        owner,
        member_count,
        my_status: mine.map(|(status, _)| status),
        my_role: mine.map(|(_, role)| role),
    }))
}

async fn join(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    let outcome = state.memberships.join(id, user.id).await?;
    Ok(Json(json!(outcome)))
}

async fn leave(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    state.memberships.leave(id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn decline(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    state.memberships.decline_invite(id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn invite(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((id, invitee)): Path<(i64, i64)>,
) -> AppResult<Json<Value>> {
    let outcome = state.memberships.invite(id, user.id, invitee).await?;
    Ok(Json(json!(outcome)))
}

async fn reject(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((id, requester)): Path<(i64, i64)>,
) -> AppResult<StatusCode> {
    state
        .memberships
        .reject_request(id, user.id, requester)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn kick(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((id, member)): Path<(i64, i64)>,
) -> AppResult<StatusCode> {
    state.memberships.remove_member(id, user.id, member).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn transfer(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((id, new_owner)): Path<(i64, i64)>,
) -> AppResult<StatusCode> {
    state
        .memberships
        .transfer_ownership(id, user.id, new_owner)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn members(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<Vec<GroupMember>>> {
    let conn = state.db.get()?;
    load_group(&conn, id)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {}, m.status, m.role FROM group_members m JOIN users u ON u.id = m.user_id
         WHERE m.group_id = ?1 AND m.status = 'accepted'
         ORDER BY m.role = 'owner' DESC, m.created_at",
        USER_LIMITED_COLUMNS
    ))?;
    let rows = stmt.query_map(params![id], |row| {
        Ok(GroupMember {
            user: UserLimited::from_row_at(row, 0)?,
            status: row.get(5)?,
            role: row.get(6)?,
        })
    })?;
    Ok(Json(rows.collect::<Result<Vec<_>, _>>()?))
}

/// Open requests and outstanding invites. Owner only.
async fn pending(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Json<PendingMembers>> {
    let mine = state.memberships.membership(id, user.id).await?;
    let conn = state.db.get()?;
    load_group(&conn, id)?;
    if !mine.is_some_and(|m| m.is_owner()) {
        return Err(AppError::Forbidden);
    }

    Ok(Json(PendingMembers {
        requested: users_with_status(&conn, id, MembershipStatus::Requested)?,
        invited: users_with_status(&conn, id, MembershipStatus::Invited)?,
    }))
}

async fn posts(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<Post>>> {
    let conn = state.db.get()?;
    require_group_member(&conn, id, Viewer::User(user.id))?;
    Ok(Json(group_posts(&conn, id, page.before_id)?))
}
