use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use rusqlite::{named_params, params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::handlers::{non_blank, validate_date_of_birth};
use crate::db::models::{Post, User, UserLimited, USER_COLUMNS, USER_LIMITED_COLUMNS};
use crate::db::{file_exists, PAGE_SIZE};
use crate::error::{AppError, AppResult};
use crate::extractors::{CurrentUser, MaybeUser};
use crate::membership::FollowStatus;
use crate::routes::Page;
use crate::state::AppState;
use crate::visibility::queries::{follow_status, listed_posts, profile_for, Feed};
use crate::visibility::{ProfileAccess, Viewer};

// --- Views ---

#[derive(Serialize)]
#[serde(untagged)]
pub enum ProfileView {
    Full(User),
    Limited(UserLimited),
}

#[derive(Serialize)]
pub struct FollowInfo {
    pub me_to_you: Option<FollowStatus>,
    pub you_to_me: Option<FollowStatus>,
}

#[derive(Serialize)]
pub struct ProfileResponse {
    pub user: ProfileView,
    pub access: bool,
    pub follow_info: FollowInfo,
}

// --- Forms ---

#[derive(Deserialize)]
pub struct UpdateProfileRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub nickname: Option<String>,
    pub about: Option<String>,
    pub avatar: Option<String>,
    pub date_of_birth: Option<String>,
    pub private: Option<bool>,
}

// --- Router ---

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/user", get(me).post(update_me))
        .route("/user/requests", get(follow_requests))
        .route("/user/{id}", get(profile))
        .route("/user/{id}/followers", get(followers))
        .route("/user/{id}/following", get(following))
        .route("/user/{id}/follow", post(follow))
        .route("/user/{id}/unfollow", post(unfollow))
        .route("/user/{id}/accept", post(accept))
        .route("/user/{id}/posts", get(user_posts))
}

// --- Handlers ---

async fn me(State(state): State<AppState>, user: CurrentUser) -> AppResult<Json<User>> {
    let conn = state.db.get()?;
    let me = conn
        .query_row(
            &format!("SELECT {} FROM users u WHERE u.id = ?1", USER_COLUMNS),
            params![user.id],
            User::from_row,
        )
        .optional()?
        .ok_or(AppError::Unauthorized)?;
    Ok(Json(me))
}

async fn update_me(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<UpdateProfileRequest>,
) -> AppResult<Json<User>> {
    let first_name = non_blank(req.first_name);
    let last_name = non_blank(req.last_name);
    let nickname = non_blank(req.nickname);
    let about = non_blank(req.about);
    let avatar = non_blank(req.avatar);
    let date_of_birth = non_blank(req.date_of_birth);
    validate_date_of_birth(&date_of_birth)?;

    let conn = state.db.get()?;
    if let Some(ref token) = avatar {
        if !file_exists(&conn, token)? {
            return Err(AppError::BadRequest("Unknown avatar file".into()));
        }
    }

    conn.execute(
        "UPDATE users SET
            first_name = COALESCE(?2, first_name),
            last_name = COALESCE(?3, last_name),
            nickname = COALESCE(?4, nickname),
            about = COALESCE(?5, about),
            avatar = COALESCE(?6, avatar),
            date_of_birth = COALESCE(?7, date_of_birth),
            private = COALESCE(?8, private)
         WHERE id = ?1",
        params![
            user.id,
            first_name,
            last_name,
            nickname,
            about,
            avatar,
            date_of_birth,
            req.private
        ],
    )
    .map_err(|e| AppError::from_insert(e, "Nickname already taken"))?;

    let updated = conn.query_row(
        &format!("SELECT {} FROM users u WHERE u.id = ?1", USER_COLUMNS),
        params![user.id],
        User::from_row,
    )?;
    Ok(Json(updated))
}

async fn profile(
    State(state): State<AppState>,
    maybe: MaybeUser,
    Path(id): Path<i64>,
) -> AppResult<Json<ProfileResponse>> {
    let viewer = maybe.viewer();
    let conn = state.db.get()?;
    let (user, access) = profile_for(&conn, viewer, id)?;

    let follow_info = FollowInfo {
        me_to_you: follow_status(&conn, viewer.id(), id)?,
        you_to_me: follow_status(&conn, id, viewer.id())?,
    };
    let (user, access) = match access {
        ProfileAccess::Full => (ProfileView::Full(user), true),
        ProfileAccess::Limited => (ProfileView::Limited(UserLimited::from(&user)), false),
    };

    Ok(Json(ProfileResponse {
        user,
        access,
        follow_info,
    }))
}

/// Accepted follow edges in one direction, as limited projections.
fn follow_list(
    state: &AppState,
    viewer: Viewer,
    user_id: i64,
    followers_of: bool,
    before_id: Option<i64>,
) -> AppResult<Vec<UserLimited>> {
    let conn = state.db.get()?;
    let (_, access) = profile_for(&conn, viewer, user_id)?;
    if access == ProfileAccess::Limited {
        return Err(AppError::Forbidden);
    }

    let (join_on, filter_on) = if followers_of {
        ("f.follower_id", "f.followee_id")
    } else {
        ("f.followee_id", "f.follower_id")
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM followers f JOIN users u ON u.id = {}
         WHERE {} = :user AND f.status = 'accepted'
           AND (:before IS NULL OR u.id < :before)
         ORDER BY u.id DESC LIMIT :limit",
        USER_LIMITED_COLUMNS, join_on, filter_on
    ))?;
    let rows = stmt.query_map(
        named_params! {
            ":user": user_id,
            ":before": before_id,
            ":limit": PAGE_SIZE,
        },
        |row| UserLimited::from_row_at(row, 0),
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

async fn followers(
    State(state): State<AppState>,
    maybe: MaybeUser,
    Path(id): Path<i64>,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<UserLimited>>> {
    Ok(Json(follow_list(
        &state,
        maybe.viewer(),
        id,
        true,
        page.before_id,
    )?))
}

async fn following(
    State(state): State<AppState>,
    maybe: MaybeUser,
    Path(id): Path<i64>,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<UserLimited>>> {
    Ok(Json(follow_list(
        &state,
        maybe.viewer(),
        id,
        false,
        page.before_id,
    )?))
}

async fn follow(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    let outcome = state.memberships.follow(user.id, id).await?;
    Ok(Json(json!(outcome)))
}

async fn unfollow(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    let removed = state.memberships.unfollow(user.id, id).await?;
    Ok(Json(json!({ "removed": removed })))
}

/// Accept a pending follow request from `id`.
async fn accept(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    state.memberships.accept_follow(user.id, id).await?;
    Ok(Json(json!({ "accepted": true })))
}

async fn follow_requests(
    State(state): State<AppState>,
    user: CurrentUser,
) -> AppResult<Json<Vec<UserLimited>>> {
    let conn = state.db.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM followers f JOIN users u ON u.id = f.follower_id
         WHERE f.followee_id = ?1 AND f.status = 'requested'
         ORDER BY f.created_at DESC",
        USER_LIMITED_COLUMNS
    ))?;
    let rows = stmt.query_map(params![user.id], |row| UserLimited::from_row_at(row, 0))?;
    Ok(Json(rows.collect::<Result<Vec<_>, _>>()?))
}

async fn user_posts(
    State(state): State<AppState>,
    maybe: MaybeUser,
    Path(id): Path<i64>,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<Post>>> {
    let conn = state.db.get()?;
    let posts = listed_posts(&conn, maybe.viewer(), Feed::Author(id), page.before_id)?;
    Ok(Json(posts))
}
