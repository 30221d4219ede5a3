use rusqlite::{named_params, params, Connection, OptionalExtension};

use crate::db::models::{Post, User, POST_COLUMNS, USER_COLUMNS};
use crate::db::PAGE_SIZE;
use crate::error::{AppError, AppResult};
use crate::membership::FollowStatus;
use crate::visibility::{post_visible, profile_access, PostFacts, ProfileAccess, Viewer};

/// Feed filter equivalent to [`crate::visibility::post_listed`], bound to `:viewer`.
const LISTED_POSTS: &str = "p.deleted_at IS NULL AND p.group_id IS NULL AND (
        p.author_id = :viewer
        OR p.privacy = 'public'
        OR (p.privacy = 'private' AND EXISTS (
            SELECT 1 FROM followers f
            WHERE f.follower_id = :viewer AND f.followee_id = p.author_id AND f.status = 'accepted'))
        OR (p.privacy = 'almost-private' AND EXISTS (
            SELECT 1 FROM selected_users s WHERE s.post_id = p.id AND s.user_id = :viewer))
    )";

#[derive(Debug)]
pub enum PostAccess {
    Missing,
    Denied,
    Granted(Post),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// Everything the viewer may see.
    All,
    /// Restricted to authors the viewer follows.
    Following,
    /// One author's posts.
    Author(i64),
}

pub fn is_group_member(
    conn: &Connection,
    group_id: i64,
    viewer: Viewer,
) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM group_members
         WHERE group_id = ?1 AND user_id = ?2 AND status = 'accepted'",
        params![group_id, viewer.id()],
        |row| row.get(0),
    )
}

pub fn group_exists(conn: &Connection, group_id: i64) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM user_groups WHERE id = ?1",
        params![group_id],
        |row| row.get(0),
    )
}

/// NotFound for a missing group, Forbidden for a non-member.
pub fn require_group_member(conn: &Connection, group_id: i64, viewer: Viewer) -> AppResult<()> {
    if !group_exists(conn, group_id)? {
        return Err(AppError::NotFound);
    }
    if !is_group_member(conn, group_id, viewer)? {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

pub fn follow_status(
    conn: &Connection,
    follower_id: i64,
    followee_id: i64,
) -> Result<Option<FollowStatus>, rusqlite::Error> {
    conn.query_row(
        "SELECT status FROM followers WHERE follower_id = ?1 AND followee_id = ?2",
        params![follower_id, followee_id],
        |row| row.get(0),
    )
    .optional()
}

pub fn post_access(
    conn: &Connection,
    viewer: Viewer,
    post_id: i64,
) -> Result<PostAccess, rusqlite::Error> {
    let post = conn
        .query_row(
            &format!(
                "SELECT {} FROM posts p JOIN users u ON u.id = p.author_id
                 WHERE p.id = ?1 AND p.deleted_at IS NULL",
                POST_COLUMNS
            ),
            params![post_id],
            Post::from_row,
        )
        .optional()?;
    let Some(post) = post else {
        return Ok(PostAccess::Missing);
    };

    let viewer_in_group = match post.group_id {
        Some(group_id) => is_group_member(conn, group_id, viewer)?,
        None => false,
    };
    let viewer_follows_author = follow_status(conn, viewer.id(), post.author_id)?
        == Some(FollowStatus::Accepted);
    let viewer_selected: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM selected_users WHERE post_id = ?1 AND user_id = ?2",
        params![post.id, viewer.id()],
        |row| row.get(0),
    )?;

    let facts = PostFacts {
        author_id: post.author_id,
        privacy: post.privacy,
        group_id: post.group_id,
        viewer_in_group,
        viewer_follows_author,
        viewer_selected,
    };

    Ok(if post_visible(viewer, &facts) {
        PostAccess::Granted(post)
    } else {
        PostAccess::Denied
    })
}

pub fn require_post(conn: &Connection, viewer: Viewer, post_id: i64) -> AppResult<Post> {
    match post_access(conn, viewer, post_id)? {
        PostAccess::Granted(post) => Ok(post),
        PostAccess::Denied => Err(AppError::Forbidden),
        PostAccess::Missing => Err(AppError::NotFound),
    }
}

/// Newest first, at most one page, strictly older than `before_id` when given.
pub fn listed_posts(
    conn: &Connection,
    viewer: Viewer,
    feed: Feed,
    before_id: Option<i64>,
) -> Result<Vec<Post>, rusqlite::Error> {
    let feed_clause = match feed {
        Feed::All => "",
        Feed::Following => {
            "AND EXISTS (SELECT 1 FROM followers fo WHERE fo.follower_id = :viewer
                 AND fo.followee_id = p.author_id AND fo.status = 'accepted')"
        }
        Feed::Author(_) => "AND p.author_id = :author",
    };
    let author = match feed {
        Feed::Author(id) => id,
        _ => Viewer::ANONYMOUS_ID,
    };

    let sql = format!(
        "SELECT {} FROM posts p JOIN users u ON u.id = p.author_id
         WHERE {} {} AND (:before IS NULL OR p.id < :before)
         ORDER BY p.id DESC LIMIT :limit",
        POST_COLUMNS, LISTED_POSTS, feed_clause
    );
    let mut stmt = conn.prepare(&sql)?;
    // Unused named parameters are an error, so bind only what the SQL mentions
    let rows = match feed {
        Feed::Author(_) => stmt.query_map(
            named_params! {
                ":viewer": viewer.id(),
                ":author": author,
                ":before": before_id,
                ":limit": PAGE_SIZE,
            },
            Post::from_row,
        )?,
        _ => stmt.query_map(
            named_params! {
                ":viewer": viewer.id(),
                ":before": before_id,
                ":limit": PAGE_SIZE,
            },
            Post::from_row,
        )?,
    };
    rows.collect()
}

/// Posts of every group the viewer belongs to.
pub fn member_group_posts(
    conn: &Connection,
    viewer: Viewer,
    before_id: Option<i64>,
) -> Result<Vec<Post>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM posts p JOIN users u ON u.id = p.author_id
         JOIN group_members m ON m.group_id = p.group_id
            AND m.user_id = :viewer AND m.status = 'accepted'
         WHERE p.deleted_at IS NULL AND (:before IS NULL OR p.id < :before)
         ORDER BY p.id DESC LIMIT :limit",
        POST_COLUMNS
    ))?;
    let rows = stmt.query_map(
        named_params! {
            ":viewer": viewer.id(),
            ":before": before_id,
            ":limit": PAGE_SIZE,
        },
        Post::from_row,
    )?;
    rows.collect()
}

/// Posts of one group. Callers check membership first.
pub fn group_posts(
    conn: &Connection,
    group_id: i64,
    before_id: Option<i64>,
) -> Result<Vec<Post>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM posts p JOIN users u ON u.id = p.author_id
         WHERE p.group_id = :group AND p.deleted_at IS NULL
           AND (:before IS NULL OR p.id < :before)
         ORDER BY p.id DESC LIMIT :limit",
        POST_COLUMNS
    ))?;
    let rows = stmt.query_map(
        named_params! {
            ":group": group_id,
            ":before": before_id,
            ":limit": PAGE_SIZE,
        },
        Post::from_row,
    )?;
    rows.collect()
}

/// Loads a user and decides how much of the profile `viewer` gets.
pub fn profile_for(
    conn: &Connection,
    viewer: Viewer,
    user_id: i64,
) -> AppResult<(User, ProfileAccess)> {
    let user = conn
        .query_row(
            &format!("SELECT {} FROM users u WHERE u.id = ?1", USER_COLUMNS),
            params![user_id],
            User::from_row,
        )
        .optional()?
        .ok_or(AppError::NotFound)?;
    let follows = follow_status(conn, viewer.id(), user_id)? == Some(FollowStatus::Accepted);
    let access = profile_access(viewer, user.id, user.private, follows);
    Ok((user, access))
}
