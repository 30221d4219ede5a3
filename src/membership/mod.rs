// Group membership and follow relationships.
//
// `domain` decides, `repository` applies the decision atomically, and
// `Memberships` tells the counterpart about every change that happened.
pub mod domain;
pub mod repository;

use std::sync::Arc;

pub use domain::{
    FollowOutcome, FollowStatus, GroupAccess, GroupRole, InviteOutcome, JoinOutcome, Membership,
    MembershipError, MembershipStatus,
};
pub use repository::{MembershipRepository, SqliteMembershipRepository, Transition};

use crate::error::{AppError, AppResult};
use crate::notify::{Notification, Notifier};
use crate::state::DbPool;

impl From<MembershipError> for AppError {
    fn from(err: MembershipError) -> Self {
        match err {
            MembershipError::NotMember | MembershipError::NotOwner => AppError::Forbidden,
            MembershipError::InvalidTarget(_) | MembershipError::SelfTarget => {
                AppError::BadRequest(err.to_string())
            }
            MembershipError::SoleOwner => AppError::Conflict(err.to_string()),
            MembershipError::NoPendingRequest | MembershipError::NoPendingInvite => {
                AppError::NotFound
            }
        }
    }
}

/// Membership transitions plus the one notification each state change owes.
/// No-op transitions notify nobody.
#[derive(Clone)]
pub struct Memberships {
    repo: Arc<dyn MembershipRepository>,
    notifier: Notifier,
}

impl Memberships {
    pub fn new(repo: Arc<dyn MembershipRepository>, notifier: Notifier) -> Self {
        Self { repo, notifier }
    }

    pub fn sqlite(pool: DbPool, notifier: Notifier) -> Self {
        Self::new(Arc::new(SqliteMembershipRepository::new(pool)), notifier)
    }

    pub async fn membership(&self, group_id: i64, user_id: i64) -> AppResult<Option<Membership>> {
        Ok(self.repo.membership(group_id, user_id).await?)
    }

    pub async fn join(&self, group_id: i64, user_id: i64) -> AppResult<JoinOutcome> {
        let member = self.repo.user_ref(user_id).await?;
        let t = self.repo.join(group_id, user_id).await?;
        let group = t.group.group_ref();

        let notification = match t.outcome {
            JoinOutcome::Joined => Some(Notification::GroupJoined {
                member,
                recipient: t.group.owner_id,
                group,
            }),
            JoinOutcome::AcceptedInvite { inviter_id } => Some(Notification::GroupJoined {
                member,
                recipient: inviter_id.unwrap_or(t.group.owner_id),
                group,
            }),
            JoinOutcome::Requested => Some(Notification::GroupJoinRequest {
                requester: member,
                owner: t.group.owner_id,
                group,
            }),
            JoinOutcome::AlreadyMember | JoinOutcome::AlreadyRequested => None,
        };
        if let Some(notification) = notification {
            self.notifier.dispatch(notification);
        }

        tracing::debug!(group_id, user_id, outcome = ?t.outcome, "Join");
        Ok(t.outcome)
    }

    pub async fn invite(
        &self,
        group_id: i64,
        inviter_id: i64,
        invitee_id: i64,
    ) -> AppResult<InviteOutcome> {
        let inviter = self.repo.user_ref(inviter_id).await?;
        let t = self.repo.invite(group_id, inviter_id, invitee_id).await?;
        let group = t.group.group_ref();

        match t.outcome {
            InviteOutcome::Invited => self.notifier.dispatch(Notification::GroupInvite {
                inviter,
                invitee: invitee_id,
                group,
            }),
            InviteOutcome::AcceptedRequest => {
                self.notifier.dispatch(Notification::GroupRequestAccepted {
                    approver: inviter,
                    requester: invitee_id,
                    group,
                })
            }
            InviteOutcome::AlreadyMember | InviteOutcome::AlreadyInvited => {}
        }

        Ok(t.outcome)
    }

    pub async fn decline_invite(&self, group_id: i64, user_id: i64) -> AppResult<()> {
        let invitee = self.repo.user_ref(user_id).await?;
        let t = self.repo.decline_invite(group_id, user_id).await?;
        self.notifier.dispatch(Notification::GroupInviteDeclined {
            invitee,
            recipient: t.outcome.unwrap_or(t.group.owner_id),
            group: t.group.group_ref(),
        });
        Ok(())
    }

    pub async fn reject_request(&self, group_id: i64, owner_id: i64, user_id: i64) -> AppResult<()> {
        let owner = self.repo.user_ref(owner_id).await?;
        let t = self.repo.reject_request(group_id, owner_id, user_id).await?;
        self.notifier.dispatch(Notification::GroupRequestRejected {
            owner,
            requester: user_id,
            group: t.group.group_ref(),
        });
        Ok(())
    }

    pub async fn leave(&self, group_id: i64, user_id: i64) -> AppResult<()> {
        let member = self.repo.user_ref(user_id).await?;
        let t = self.repo.leave(group_id, user_id).await?;
        self.notifier.dispatch(Notification::GroupMemberLeft {
            member,
            owner: t.group.owner_id,
            group: t.group.group_ref(),
        });
        Ok(())
    }

    pub async fn remove_member(&self, group_id: i64, owner_id: i64, user_id: i64) -> AppResult<()> {
        let owner = self.repo.user_ref(owner_id).await?;
        let t = self.repo.remove_member(group_id, owner_id, user_id).await?;
        self.notifier.dispatch(Notification::GroupMemberRemoved {
            owner,
            member: user_id,
            group: t.group.group_ref(),
        });
        Ok(())
    }

    pub async fn transfer_ownership(
        &self,
        group_id: i64,
        requester_id: i64,
        new_owner_id: i64,
    ) -> AppResult<()> {
        let previous_owner = self.repo.user_ref(requester_id).await?;
        let t = self
            .repo
            .transfer_ownership(group_id, requester_id, new_owner_id)
            .await?;
        tracing::info!(
            group_id,
            from = requester_id,
            to = new_owner_id,
            "Group ownership transferred"
        );
        self.notifier.dispatch(Notification::OwnershipTransferred {
            previous_owner,
            new_owner: new_owner_id,
            group: t.group.group_ref(),
        });
        Ok(())
    }

    pub async fn follow(&self, follower_id: i64, target_id: i64) -> AppResult<FollowOutcome> {
        let follower = self.repo.user_ref(follower_id).await?;
        let outcome = self.repo.follow(follower_id, target_id).await?;

        match outcome {
            FollowOutcome::Followed => self.notifier.dispatch(Notification::Follow {
                follower,
                target: target_id,
            }),
            FollowOutcome::Requested => self.notifier.dispatch(Notification::FollowRequest {
                follower,
                target: target_id,
            }),
            FollowOutcome::AlreadyFollowing | FollowOutcome::AlreadyRequested => {}
        }
        Ok(outcome)
    }

    pub async fn accept_follow(&self, target_id: i64, follower_id: i64) -> AppResult<()> {
        let followee = self.repo.user_ref(target_id).await?;
        self.repo.accept_follow(target_id, follower_id).await?;
        self.notifier.dispatch(Notification::FollowAccepted {
            followee,
            follower: follower_id,
        });
        Ok(())
    }

    /// Returns whether a follow (or pending request) existed. Withdrawing a
    /// request the target never accepted is silent.
    pub async fn unfollow(&self, follower_id: i64, target_id: i64) -> AppResult<bool> {
        let follower = self.repo.user_ref(follower_id).await?;
        let previous = self.repo.unfollow(follower_id, target_id).await?;
        if previous == Some(FollowStatus::Accepted) {
            self.notifier.dispatch(Notification::Unfollow {
                follower,
                target: target_id,
            });
        }
        Ok(previous.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{insert_group, insert_user, test_pool};
    use tokio::sync::mpsc;

    fn service(pool: &DbPool) -> (Memberships, mpsc::Receiver<Notification>) {
        let (notifier, rx) = Notifier::channel(16);
        (Memberships::sqlite(pool.clone(), notifier), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn restricted_join_notifies_owner_once() {
        let (_tmp, pool) = test_pool();
        let owner = insert_user(&pool, "owner", false);
        let bob = insert_user(&pool, "bob", false);
        let group = insert_group(&pool, "club", owner, "restricted");
        let (memberships, mut rx) = service(&pool);

        memberships.join(group, bob).await.unwrap();
        memberships.join(group, bob).await.unwrap();

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Notification::GroupJoinRequest { .. }));
        assert_eq!(sent[0].targets(), vec![owner]);
    }

    #[tokio::test]
    async fn duplicate_invite_notifies_once() {
        let (_tmp, pool) = test_pool();
        let owner = insert_user(&pool, "owner", false);
        let bob = insert_user(&pool, "bob", false);
        let group = insert_group(&pool, "club", owner, "open");
        let (memberships, mut rx) = service(&pool);

        memberships.invite(group, owner, bob).await.unwrap();
        memberships.invite(group, owner, bob).await.unwrap();

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].targets(), vec![bob]);
    }

    #[tokio::test]
    async fn rejected_transition_notifies_nobody() {
        let (_tmp, pool) = test_pool();
        let owner = insert_user(&pool, "owner", false);
        let group = insert_group(&pool, "club", owner, "open");
        let (memberships, mut rx) = service(&pool);

        let err = memberships.leave(group, owner).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn follow_public_user_notifies_target() {
        let (_tmp, pool) = test_pool();
        let alice = insert_user(&pool, "alice", false);
        let bob = insert_user(&pool, "bob", false);
        let (memberships, mut rx) = service(&pool);

        assert_eq!(
            memberships.follow(bob, alice).await.unwrap(),
            FollowOutcome::Followed
        );
        let sent = drain(&mut rx);
        assert!(matches!(sent[0], Notification::Follow { target, .. } if target == alice));
    }

    #[tokio::test]
    async fn withdrawn_follow_request_is_silent() {
        let (_tmp, pool) = test_pool();
        let alice = insert_user(&pool, "alice", true);
        let bob = insert_user(&pool, "bob", false);
        let (memberships, mut rx) = service(&pool);

        memberships.follow(bob, alice).await.unwrap();
        drain(&mut rx);
        assert!(memberships.unfollow(bob, alice).await.unwrap());
        assert!(drain(&mut rx).is_empty());

        memberships.follow(bob, alice).await.unwrap();
        memberships.accept_follow(alice, bob).await.unwrap();
        drain(&mut rx);
        assert!(memberships.unfollow(bob, alice).await.unwrap());
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Notification::Unfollow { target, .. } if target == alice));
        assert!(!memberships.unfollow(bob, alice).await.unwrap());
    }

    #[test]
    fn membership_errors_map_to_http() {
        assert!(matches!(
            AppError::from(MembershipError::NotOwner),
            AppError::Forbidden
        ));
        assert!(matches!(
            AppError::from(MembershipError::InvalidTarget("x")),
            AppError::BadRequest(_)
        ));
        assert!(matches!(
            AppError::from(MembershipError::NoPendingInvite),
            AppError::NotFound
        ));
    }
}
