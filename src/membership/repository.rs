// Repository pattern - isolates all database side effects
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::db::{timestamp, RepositoryError};
use crate::membership::domain::*;
use crate::notify::{GroupRef, UserRef};
use crate::state::DbPool;

/// Group facts every transition reports back for notification fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub id: i64,
    pub name: String,
    pub access: GroupAccess,
    pub owner_id: i64,
}

impl GroupInfo {
    pub fn group_ref(&self) -> GroupRef {
        GroupRef {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<O> {
    pub outcome: O,
    pub group: GroupInfo,
}

/// Every method is one immediate transaction: read the rows, decide, write.
#[async_trait]
pub trait MembershipRepository: Send + Sync {
    async fn join(
        &self,
        group_id: i64,
        user_id: i64,
    ) -> Result<Transition<JoinOutcome>, RepositoryError>;

    async fn invite(
        &self,
        group_id: i64,
        inviter_id: i64,
        invitee_id: i64,
    ) -> Result<Transition<InviteOutcome>, RepositoryError>;

    /// Returns the inviter, when still known.
    async fn decline_invite(
        &self,
        group_id: i64,
        user_id: i64,
    ) -> Result<Transition<Option<i64>>, RepositoryError>;

    async fn reject_request(
        &self,
        group_id: i64,
        owner_id: i64,
        user_id: i64,
    ) -> Result<Transition<()>, RepositoryError>;

    async fn leave(&self, group_id: i64, user_id: i64) -> Result<Transition<()>, RepositoryError>;

    async fn remove_member(
        &self,
        group_id: i64,
        owner_id: i64,
        user_id: i64,
    ) -> Result<Transition<()>, RepositoryError>;

    /// Demote and promote in one transaction, so no reader sees zero or two owners.
    async fn transfer_ownership(
        &self,
        group_id: i64,
        requester_id: i64,
        new_owner_id: i64,
    ) -> Result<Transition<()>, RepositoryError>;

    async fn membership(
        &self,
        group_id: i64,
        user_id: i64,
    ) -> Result<Option<Membership>, RepositoryError>;

    async fn follow(&self, follower_id: i64, target_id: i64)
        -> Result<FollowOutcome, RepositoryError>;

    async fn accept_follow(&self, target_id: i64, follower_id: i64)
        -> Result<(), RepositoryError>;

    /// Removes an accepted follow or a pending request, returning the status
    /// the row had. `None` if there was none.
    async fn unfollow(
        &self,
        follower_id: i64,
        target_id: i64,
    ) -> Result<Option<FollowStatus>, RepositoryError>;

    async fn user_ref(&self, user_id: i64) -> Result<UserRef, RepositoryError>;
}

/// SQLite implementation
pub struct SqliteMembershipRepository {
    pool: DbPool,
}

impl SqliteMembershipRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Runs `f` inside `BEGIN IMMEDIATE`, committing only on success.
    fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, RepositoryError>,
    ) -> Result<T, RepositoryError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

fn load_group(conn: &Connection, group_id: i64) -> Result<GroupInfo, RepositoryError> {
    conn.query_row(
        "SELECT g.id, g.name, g.access, m.user_id
         FROM user_groups g
         JOIN group_members m ON m.group_id = g.id AND m.role = 'owner'
         WHERE g.id = ?1",
        params![group_id],
        |row| {
            Ok(GroupInfo {
                id: row.get(0)?,
                name: row.get(1)?,
                access: row.get(2)?,
                owner_id: row.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| RepositoryError::NotFound(format!("group {}", group_id)))
}

pub(crate) fn load_membership(
    conn: &Connection,
    group_id: i64,
    user_id: i64,
) -> Result<Option<Membership>, rusqlite::Error> {
    conn.query_row(
        "SELECT status, role, inviter_id FROM group_members WHERE group_id = ?1 AND user_id = ?2",
        params![group_id, user_id],
        |row| {
            Ok(Membership {
                status: row.get(0)?,
                role: row.get(1)?,
                inviter_id: row.get(2)?,
            })
        },
    )
    .optional()
}

/// Returns the user's `private` flag, or NotFound.
fn load_user_privacy(conn: &Connection, user_id: i64) -> Result<bool, RepositoryError> {
    conn.query_row(
        "SELECT private FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| RepositoryError::NotFound(format!("user {}", user_id)))
}

fn write_status(
    conn: &Connection,
    group_id: i64,
    user_id: i64,
    status: MembershipStatus,
    inviter_id: Option<i64>,
) -> Result<(), rusqlite::Error> {
    let now = timestamp(Utc::now());
    conn.execute(
        "INSERT INTO group_members (group_id, user_id, status, role, inviter_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'member', ?4, ?5, ?5)
         ON CONFLICT(group_id, user_id) DO UPDATE SET
           status = excluded.status,
           inviter_id = excluded.inviter_id,
           updated_at = excluded.updated_at",
        params![group_id, user_id, status, inviter_id, now],
    )?;
    Ok(())
}

fn delete_membership(conn: &Connection, group_id: i64, user_id: i64) -> Result<(), rusqlite::Error> {
    conn.execute(
        "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
        params![group_id, user_id],
    )?;
    Ok(())
}

fn load_follow(
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

#[async_trait]
impl MembershipRepository for SqliteMembershipRepository {
    async fn join(
        &self,
        group_id: i64,
        user_id: i64,
    ) -> Result<Transition<JoinOutcome>, RepositoryError> {
        self.in_transaction(|conn| {
            let group = load_group(conn, group_id)?;
            let current = load_membership(conn, group_id, user_id)?;
            let outcome = decide_join(group.access, current.as_ref());

            match outcome {
                JoinOutcome::Joined => {
                    write_status(conn, group_id, user_id, MembershipStatus::Accepted, None)?
                }
                JoinOutcome::AcceptedInvite { inviter_id } => write_status(
                    conn,
                    group_id,
                    user_id,
                    MembershipStatus::Accepted,
                    inviter_id,
                )?,
                JoinOutcome::Requested => {
                    write_status(conn, group_id, user_id, MembershipStatus::Requested, None)?
                }
                JoinOutcome::AlreadyMember | JoinOutcome::AlreadyRequested => {}
            }

            Ok(Transition { outcome, group })
        })
    }

    async fn invite(
        &self,
        group_id: i64,
        inviter_id: i64,
        invitee_id: i64,
    ) -> Result<Transition<InviteOutcome>, RepositoryError> {
        self.in_transaction(|conn| {
            let group = load_group(conn, group_id)?;
            load_user_privacy(conn, invitee_id)?;
            let inviter = load_membership(conn, group_id, inviter_id)?;
            let invitee = load_membership(conn, group_id, invitee_id)?;
            let outcome = decide_invite(inviter_id, invitee_id, inviter.as_ref(), invitee.as_ref())?;

            match outcome {
                InviteOutcome::Invited => write_status(
                    conn,
                    group_id,
                    invitee_id,
                    MembershipStatus::Invited,
                    Some(inviter_id),
                )?,
                InviteOutcome::AcceptedRequest => write_status(
                    conn,
                    group_id,
                    invitee_id,
                    MembershipStatus::Accepted,
                    Some(inviter_id),
                )?,
                InviteOutcome::AlreadyMember | InviteOutcome::AlreadyInvited => {}
            }

            Ok(Transition { outcome, group })
        })
    }

    async fn decline_invite(
        &self,
        group_id: i64,
        user_id: i64,
    ) -> Result<Transition<Option<i64>>, RepositoryError> {
        self.in_transaction(|conn| {
            let group = load_group(conn, group_id)?;
            let current = load_membership(conn, group_id, user_id)?;
            let inviter_id = decide_decline(current.as_ref())?;
            write_status(
                conn,
                group_id,
                user_id,
                MembershipStatus::Declined,
                inviter_id,
            )?;
            Ok(Transition {
                outcome: inviter_id,
                group,
            })
        })
    }

    async fn reject_request(
        &self,
        group_id: i64,
        owner_id: i64,
        user_id: i64,
    ) -> Result<Transition<()>, RepositoryError> {
        self.in_transaction(|conn| {
            let group = load_group(conn, group_id)?;
            let actor = load_membership(conn, group_id, owner_id)?;
            let target = load_membership(conn, group_id, user_id)?;
            decide_reject(actor.as_ref(), target.as_ref())?;
            write_status(conn, group_id, user_id, MembershipStatus::Declined, None)?;
            Ok(Transition { outcome: (), group })
        })
    }

    async fn leave(&self, group_id: i64, user_id: i64) -> Result<Transition<()>, RepositoryError> {
        self.in_transaction(|conn| {
            let group = load_group(conn, group_id)?;
            let current = load_membership(conn, group_id, user_id)?;
            decide_leave(current.as_ref())?;
            delete_membership(conn, group_id, user_id)?;
            Ok(Transition { outcome: (), group })
        })
    }

    async fn remove_member(
        &self,
        group_id: i64,
        owner_id: i64,
        user_id: i64,
    ) -> Result<Transition<()>, RepositoryError> {
        self.in_transaction(|conn| {
            let group = load_group(conn, group_id)?;
            let actor = load_membership(conn, group_id, owner_id)?;
            let target = load_membership(conn, group_id, user_id)?;
            decide_remove(owner_id, user_id, actor.as_ref(), target.as_ref())?;
            delete_membership(conn, group_id, user_id)?;
            Ok(Transition { outcome: (), group })
        })
    }

    async fn transfer_ownership(
        &self,
        group_id: i64,
        requester_id: i64,
        new_owner_id: i64,
    ) -> Result<Transition<()>, RepositoryError> {
        self.in_transaction(|conn| {
            let group = load_group(conn, group_id)?;
            let requester = load_membership(conn, group_id, requester_id)?;
            let new_owner = load_membership(conn, group_id, new_owner_id)?;
            decide_transfer(
                requester_id,
                new_owner_id,
                requester.as_ref(),
                new_owner.as_ref(),
            )?;

            let now = timestamp(Utc::now());
            conn.execute(
                "UPDATE group_members SET role = 'member', updated_at = ?3
                 WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, requester_id, now],
            )?;
            conn.execute(
                "UPDATE group_members SET role = 'owner', updated_at = ?3
                 WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, new_owner_id, now],
            )?;

            Ok(Transition {
                outcome: (),
                group: GroupInfo {
                    owner_id: new_owner_id,
                    ..group
                },
            })
        })
    }

    async fn membership(
        &self,
        group_id: i64,
        user_id: i64,
    ) -> Result<Option<Membership>, RepositoryError> {
        let conn = self.pool.get()?;
        Ok(load_membership(&conn, group_id, user_id)?)
    }

    async fn follow(
        &self,
        follower_id: i64,
        target_id: i64,
    ) -> Result<FollowOutcome, RepositoryError> {
        self.in_transaction(|conn| {
            let target_private = load_user_privacy(conn, target_id)?;
            let current = load_follow(conn, follower_id, target_id)?;
            let outcome = decide_follow(follower_id, target_id, target_private, current)?;

            let status = match outcome {
                FollowOutcome::Followed => FollowStatus::Accepted,
                FollowOutcome::Requested => FollowStatus::Requested,
                FollowOutcome::AlreadyFollowing | FollowOutcome::AlreadyRequested => {
                    return Ok(outcome)
                }
            };
            let now = timestamp(Utc::now());
            conn.execute(
                "INSERT INTO followers (follower_id, followee_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![follower_id, target_id, status, now],
            )?;
            Ok(outcome)
        })
    }

    async fn accept_follow(
        &self,
        target_id: i64,
        follower_id: i64,
    ) -> Result<(), RepositoryError> {
        self.in_transaction(|conn| {
            let current = load_follow(conn, follower_id, target_id)?;
            decide_accept_follow(current)?;
            conn.execute(
                "UPDATE followers SET status = 'accepted', updated_at = ?3
                 WHERE follower_id = ?1 AND followee_id = ?2",
                params![follower_id, target_id, timestamp(Utc::now())],
            )?;
            Ok(())
        })
    }

    async fn unfollow(
        &self,
        follower_id: i64,
        target_id: i64,
    ) -> Result<Option<FollowStatus>, RepositoryError> {
        self.in_transaction(|conn| {
            let previous = load_follow(conn, follower_id, target_id)?;
            if previous.is_some() {
                conn.execute(
                    "DELETE FROM followers WHERE follower_id = ?1 AND followee_id = ?2",
                    params![follower_id, target_id],
                )?;
            }
            Ok(previous)
        })
    }

    async fn user_ref(&self, user_id: i64) -> Result<UserRef, RepositoryError> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT id, first_name, last_name FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(UserRef {
                    id: row.get(0)?,
                    name: format!("{} {}", row.get::<_, String>(1)?, row.get::<_, String>(2)?),
                })
            },
        )
        .optional()?
        .ok_or_else(|| RepositoryError::NotFound(format!("user {}", user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{insert_group, insert_user, test_pool};

    fn owner_count(pool: &DbPool, group_id: i64) -> i64 {
        pool.get()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND role = 'owner'",
                params![group_id],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn restricted_join_then_invite_accepts() {
        let (_tmp, pool) = test_pool();
        let owner = insert_user(&pool, "owner", false);
        let bob = insert_user(&pool, "bob", false);
        let group = insert_group(&pool, "club", owner, "restricted");
        let repo = SqliteMembershipRepository::new(pool.clone());

        let t = repo.join(group, bob).await.unwrap();
        assert_eq!(t.outcome, JoinOutcome::Requested);
        assert_eq!(t.group.owner_id, owner);

        let t = repo.invite(group, owner, bob).await.unwrap();
        assert_eq!(t.outcome, InviteOutcome::AcceptedRequest);

        let row = repo.membership(group, bob).await.unwrap().unwrap();
        assert!(row.is_member());
    }

    #[tokio::test]
    async fn repeated_invite_writes_one_row() {
        let (_tmp, pool) = test_pool();
        let owner = insert_user(&pool, "owner", false);
        let bob = insert_user(&pool, "bob", false);
        let group = insert_group(&pool, "club", owner, "open");
        let repo = SqliteMembershipRepository::new(pool.clone());

        assert_eq!(
            repo.invite(group, owner, bob).await.unwrap().outcome,
            InviteOutcome::Invited
        );
        assert_eq!(
            repo.invite(group, owner, bob).await.unwrap().outcome,
            InviteOutcome::AlreadyInvited
        );

        let rows: i64 = pool
            .get()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group, bob],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn invite_unknown_user_is_not_found() {
        let (_tmp, pool) = test_pool();
        let owner = insert_user(&pool, "owner", false);
        let group = insert_group(&pool, "club", owner, "open");
        let repo = SqliteMembershipRepository::new(pool);

        assert!(matches!(
            repo.invite(group, owner, 999).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn decline_then_rejoin_request() {
        let (_tmp, pool) = test_pool();
        let owner = insert_user(&pool, "owner", false);
        let bob = insert_user(&pool, "bob", false);
        let group = insert_group(&pool, "club", owner, "restricted");
        let repo = SqliteMembershipRepository::new(pool);

        repo.invite(group, owner, bob).await.unwrap();
        let t = repo.decline_invite(group, bob).await.unwrap();
        assert_eq!(t.outcome, Some(owner));

        assert_eq!(
            repo.join(group, bob).await.unwrap().outcome,
            JoinOutcome::Requested
        );
    }

    #[tokio::test]
    async fn sole_owner_cannot_leave_but_member_can() {
        let (_tmp, pool) = test_pool();
        let owner = insert_user(&pool, "owner", false);
        let bob = insert_user(&pool, "bob", false);
        let group = insert_group(&pool, "club", owner, "open");
        let repo = SqliteMembershipRepository::new(pool.clone());

        repo.join(group, bob).await.unwrap();
        assert!(matches!(
            repo.leave(group, owner).await,
            Err(RepositoryError::Membership(MembershipError::SoleOwner))
        ));
        repo.leave(group, bob).await.unwrap();
        assert!(repo.membership(group, bob).await.unwrap().is_none());
        assert_eq!(owner_count(&pool, group), 1);
    }

    #[tokio::test]
    async fn transfer_swaps_owner_atomically() {
        let (_tmp, pool) = test_pool();
        let owner = insert_user(&pool, "owner", false);
        let bob = insert_user(&pool, "bob", false);
        let carol = insert_user(&pool, "carol", false);
        let group = insert_group(&pool, "club", owner, "open");
        let repo = SqliteMembershipRepository::new(pool.clone());

        repo.join(group, bob).await.unwrap();

        assert!(matches!(
            repo.transfer_ownership(group, owner, carol).await,
            Err(RepositoryError::Membership(MembershipError::InvalidTarget(_)))
        ));
        assert!(matches!(
            repo.transfer_ownership(group, bob, owner).await,
            Err(RepositoryError::Membership(MembershipError::NotOwner))
        ));

        let t = repo.transfer_ownership(group, owner, bob).await.unwrap();
        assert_eq!(t.group.owner_id, bob);
        assert_eq!(owner_count(&pool, group), 1);
        assert!(repo.membership(group, bob).await.unwrap().unwrap().is_owner());
        assert!(repo.membership(group, owner).await.unwrap().unwrap().is_member());
    }

    #[tokio::test]
    async fn follow_private_user_needs_acceptance() {
        let (_tmp, pool) = test_pool();
        let alice = insert_user(&pool, "alice", true);
        let bob = insert_user(&pool, "bob", false);
        let repo = SqliteMembershipRepository::new(pool);

        assert_eq!(
            repo.follow(bob, alice).await.unwrap(),
            FollowOutcome::Requested
        );
        assert_eq!(
            repo.follow(bob, alice).await.unwrap(),
            FollowOutcome::AlreadyRequested
        );
        repo.accept_follow(alice, bob).await.unwrap();
        assert_eq!(
            repo.follow(bob, alice).await.unwrap(),
            FollowOutcome::AlreadyFollowing
        );
        assert_eq!(
            repo.unfollow(bob, alice).await.unwrap(),
            Some(FollowStatus::Accepted)
        );
        assert_eq!(repo.unfollow(bob, alice).await.unwrap(), None);

        repo.follow(bob, alice).await.unwrap();
        assert_eq!(
            repo.unfollow(bob, alice).await.unwrap(),
            Some(FollowStatus::Requested)
        );
    }

    #[tokio::test]
    async fn user_ref_joins_names() {
        let (_tmp, pool) = test_pool();
        let alice = insert_user(&pool, "alice", false);
        let repo = SqliteMembershipRepository::new(pool);
        let user = repo.user_ref(alice).await.unwrap();
        assert_eq!(user.name, "alice Test");
    }
}
