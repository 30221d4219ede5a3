// Membership rules - pure decisions over the current row, no I/O
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::sql_text_enum;

sql_text_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum MembershipStatus {
        Requested => "requested",
        Invited => "invited",
        Accepted => "accepted",
        Declined => "declined",
    }
}

sql_text_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum GroupRole {
        Member => "member",
        Owner => "owner",
    }
}

sql_text_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum GroupAccess {
        Open => "open",
        Restricted => "restricted",
    }
}

impl Default for GroupAccess {
    fn default() -> Self {
        GroupAccess::Open
    }
}

sql_text_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum FollowStatus {
        Requested => "requested",
        Accepted => "accepted",
    }
}

/// One `(group, user)` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub status: MembershipStatus,
    pub role: GroupRole,
    pub inviter_id: Option<i64>,
}

impl Membership {
    pub fn is_member(&self) -> bool {
        self.status == MembershipStatus::Accepted
    }

    pub fn is_owner(&self) -> bool {
        self.is_member() && self.role == GroupRole::Owner
    }
}

/// A declined row carries no rights and blocks nothing, so it reads as absent.
fn live(row: Option<&Membership>) -> Option<&Membership> {
    row.filter(|m| m.status != MembershipStatus::Declined)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("Not a member of this group")]
    NotMember,

    #[error("Only the group owner can do that")]
    NotOwner,

    #[error("{0}")]
    InvalidTarget(&'static str),

    #[error("The owner cannot leave the group; transfer ownership first")]
    SoleOwner,

    #[error("No pending request")]
    NoPendingRequest,

    #[error("No pending invite")]
    NoPendingInvite,

    #[error("Cannot target yourself")]
    SelfTarget,
}

// -- Group transitions --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum JoinOutcome {
    AlreadyMember,
    Joined,
    AcceptedInvite { inviter_id: Option<i64> },
    Requested,
    AlreadyRequested,
}

impl JoinOutcome {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            JoinOutcome::Joined | JoinOutcome::AcceptedInvite { .. } | JoinOutcome::Requested
        )
    }
}

pub fn decide_join(access: GroupAccess, current: Option<&Membership>) -> JoinOutcome {
    match live(current).map(|m| m.status) {
        Some(MembershipStatus::Accepted) => JoinOutcome::AlreadyMember,
        Some(MembershipStatus::Invited) => JoinOutcome::AcceptedInvite {
            inviter_id: current.and_then(|m| m.inviter_id),
        },
        Some(MembershipStatus::Requested) => match access {
            // The group was opened after the request was filed
            GroupAccess::Open => JoinOutcome::Joined,
            GroupAccess::Restricted => JoinOutcome::AlreadyRequested,
        },
        Some(MembershipStatus::Declined) | None => match access {
            GroupAccess::Open => JoinOutcome::Joined,
            GroupAccess::Restricted => JoinOutcome::Requested,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum InviteOutcome {
    AlreadyMember,
    AlreadyInvited,
    AcceptedRequest,
    Invited,
}

impl InviteOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, InviteOutcome::AcceptedRequest | InviteOutcome::Invited)
    }
}

pub fn decide_invite(
    inviter_id: i64,
    invitee_id: i64,
    inviter: Option<&Membership>,
    invitee: Option<&Membership>,
) -> Result<InviteOutcome, MembershipError> {
    if !inviter.is_some_and(Membership::is_member) {
        return Err(MembershipError::NotMember);
    }
    if inviter_id == invitee_id {
        return Err(MembershipError::SelfTarget);
    }

    Ok(match live(invitee).map(|m| m.status) {
        Some(MembershipStatus::Accepted) => InviteOutcome::AlreadyMember,
        Some(MembershipStatus::Invited) => InviteOutcome::AlreadyInvited,
        Some(MembershipStatus::Requested) => InviteOutcome::AcceptedRequest,
        Some(MembershipStatus::Declined) | None => InviteOutcome::Invited,
    })
}

/// `invited -> declined`. Returns who sent the invite.
pub fn decide_decline(current: Option<&Membership>) -> Result<Option<i64>, MembershipError> {
    match live(current) {
        Some(m) if m.status == MembershipStatus::Invited => Ok(m.inviter_id),
        _ => Err(MembershipError::NoPendingInvite),
    }
}

/// `requested -> declined`, owner only.
pub fn decide_reject(
    actor: Option<&Membership>,
    target: Option<&Membership>,
) -> Result<(), MembershipError> {
    if !actor.is_some_and(Membership::is_owner) {
        return Err(MembershipError::NotOwner);
    }
    match live(target) {
        Some(m) if m.status == MembershipStatus::Requested => Ok(()),
        _ => Err(MembershipError::NoPendingRequest),
    }
}

/// `accepted -> none`. The owner has to hand the group over first.
pub fn decide_leave(current: Option<&Membership>) -> Result<(), MembershipError> {
    match current {
        Some(m) if m.is_owner() => Err(MembershipError::SoleOwner),
        Some(m) if m.is_member() => Ok(()),
        _ => Err(MembershipError::NotMember),
    }
}

/// Owner removes an accepted member.
pub fn decide_remove(
    actor_id: i64,
    target_id: i64,
    actor: Option<&Membership>,
    target: Option<&Membership>,
) -> Result<(), MembershipError> {
    if !actor.is_some_and(Membership::is_owner) {
        return Err(MembershipError::NotOwner);
    }
    if actor_id == target_id {
        return Err(MembershipError::SelfTarget);
    }
    if !target.is_some_and(Membership::is_member) {
        return Err(MembershipError::InvalidTarget("User is not a member"));
    }
    Ok(())
}

pub fn decide_transfer(
    requester_id: i64,
    new_owner_id: i64,
    requester: Option<&Membership>,
    new_owner: Option<&Membership>,
) -> Result<(), MembershipError> {
    if !requester.is_some_and(Membership::is_owner) {
        return Err(MembershipError::NotOwner);
    }
    if requester_id == new_owner_id {
        return Err(MembershipError::InvalidTarget("Already the owner"));
    }
    if !new_owner.is_some_and(Membership::is_member) {
        return Err(MembershipError::InvalidTarget(
            "New owner must be a member of the group",
        ));
    }
    Ok(())
}

// -- Follow transitions --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FollowOutcome {
    AlreadyFollowing,
    AlreadyRequested,
    Followed,
    Requested,
}

impl FollowOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, FollowOutcome::Followed | FollowOutcome::Requested)
    }
}

pub fn decide_follow(
    follower_id: i64,
    target_id: i64,
    target_private: bool,
    current: Option<FollowStatus>,
) -> Result<FollowOutcome, MembershipError> {
    if follower_id == target_id {
        return Err(MembershipError::SelfTarget);
    }
    Ok(match current {
        Some(FollowStatus::Accepted) => FollowOutcome::AlreadyFollowing,
        Some(FollowStatus::Requested) => FollowOutcome::AlreadyRequested,
        None if target_private => FollowOutcome::Requested,
        None => FollowOutcome::Followed,
    })
}

pub fn decide_accept_follow(current: Option<FollowStatus>) -> Result<(), MembershipError> {
    match current {
        Some(FollowStatus::Requested) => Ok(()),
        _ => Err(MembershipError::NoPendingRequest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: MembershipStatus) -> Membership {
        Membership {
            status,
            role: GroupRole::Member,
            inviter_id: None,
        }
    }

    fn owner() -> Membership {
        Membership {
            status: MembershipStatus::Accepted,
            role: GroupRole::Owner,
            inviter_id: None,
        }
    }

    #[test]
    fn open_group_join_is_immediate() {
        assert_eq!(decide_join(GroupAccess::Open, None), JoinOutcome::Joined);
    }

    #[test]
    fn restricted_group_join_files_a_request_once() {
        assert_eq!(
            decide_join(GroupAccess::Restricted, None),
            JoinOutcome::Requested
        );
        let pending = row(MembershipStatus::Requested);
        let again = decide_join(GroupAccess::Restricted, Some(&pending));
        assert_eq!(again, JoinOutcome::AlreadyRequested);
        assert!(!again.changed());
    }

    #[test]
    fn join_accepts_pending_invite() {
        let invited = Membership {
            inviter_id: Some(7),
            ..row(MembershipStatus::Invited)
        };
        assert_eq!(
            decide_join(GroupAccess::Restricted, Some(&invited)),
            JoinOutcome::AcceptedInvite {
                inviter_id: Some(7)
            }
        );
    }

    #[test]
    fn declined_row_reads_as_absent() {
        let declined = row(MembershipStatus::Declined);
        assert_eq!(
            decide_join(GroupAccess::Restricted, Some(&declined)),
            JoinOutcome::Requested
        );
        assert_eq!(
            decide_invite(1, 2, Some(&owner()), Some(&declined)),
            Ok(InviteOutcome::Invited)
        );
    }

    #[test]
    fn join_by_member_is_a_noop() {
        let member = row(MembershipStatus::Accepted);
        let outcome = decide_join(GroupAccess::Open, Some(&member));
        assert_eq!(outcome, JoinOutcome::AlreadyMember);
        assert!(!outcome.changed());
    }

    #[test]
    fn invite_requires_member_inviter() {
        assert_eq!(
            decide_invite(1, 2, None, None),
            Err(MembershipError::NotMember)
        );
        let invited = row(MembershipStatus::Invited);
        assert_eq!(
            decide_invite(1, 2, Some(&invited), None),
            Err(MembershipError::NotMember)
        );
    }

    #[test]
    fn invite_is_idempotent() {
        let invited = row(MembershipStatus::Invited);
        let outcome = decide_invite(1, 2, Some(&owner()), Some(&invited)).unwrap();
        assert_eq!(outcome, InviteOutcome::AlreadyInvited);
        assert!(!outcome.changed());
    }

    #[test]
    fn invite_approves_pending_request() {
        let requested = row(MembershipStatus::Requested);
        assert_eq!(
            decide_invite(1, 2, Some(&owner()), Some(&requested)),
            Ok(InviteOutcome::AcceptedRequest)
        );
    }

    #[test]
    fn decline_needs_an_invite() {
        let invited = Membership {
            inviter_id: Some(3),
            ..row(MembershipStatus::Invited)
        };
        assert_eq!(decide_decline(Some(&invited)), Ok(Some(3)));
        assert_eq!(
            decide_decline(Some(&row(MembershipStatus::Requested))),
            Err(MembershipError::NoPendingInvite)
        );
    }

    #[test]
    fn reject_is_owner_only() {
        let requested = row(MembershipStatus::Requested);
        let member = row(MembershipStatus::Accepted);
        assert_eq!(
            decide_reject(Some(&member), Some(&requested)),
            Err(MembershipError::NotOwner)
        );
        assert_eq!(decide_reject(Some(&owner()), Some(&requested)), Ok(()));
        assert_eq!(
            decide_reject(Some(&owner()), None),
            Err(MembershipError::NoPendingRequest)
        );
    }

    #[test]
    fn owner_cannot_leave() {
        assert_eq!(decide_leave(Some(&owner())), Err(MembershipError::SoleOwner));
        assert_eq!(
            decide_leave(Some(&row(MembershipStatus::Accepted))),
            Ok(())
        );
        assert_eq!(decide_leave(None), Err(MembershipError::NotMember));
    }

    #[test]
    fn remove_rules() {
        let member = row(MembershipStatus::Accepted);
        assert_eq!(decide_remove(1, 2, Some(&owner()), Some(&member)), Ok(()));
        assert_eq!(
            decide_remove(1, 1, Some(&owner()), Some(&owner())),
            Err(MembershipError::SelfTarget)
        );
        assert_eq!(
            decide_remove(2, 3, Some(&member), Some(&member)),
            Err(MembershipError::NotOwner)
        );
        assert!(matches!(
            decide_remove(1, 2, Some(&owner()), Some(&row(MembershipStatus::Invited))),
            Err(MembershipError::InvalidTarget(_))
        ));
    }

    #[test]
    fn transfer_requires_owner_and_member_target() {
        let member = row(MembershipStatus::Accepted);
        assert_eq!(
            decide_transfer(2, 1, Some(&member), Some(&owner())),
            Err(MembershipError::NotOwner)
        );
        assert!(matches!(
            decide_transfer(1, 2, Some(&owner()), Some(&row(MembershipStatus::Requested))),
            Err(MembershipError::InvalidTarget(_))
        ));
        assert!(matches!(
            decide_transfer(1, 1, Some(&owner()), Some(&owner())),
            Err(MembershipError::InvalidTarget(_))
        ));
        assert_eq!(decide_transfer(1, 2, Some(&owner()), Some(&member)), Ok(()));
    }

    #[test]
    fn follow_depends_on_privacy() {
        assert_eq!(decide_follow(1, 2, false, None), Ok(FollowOutcome::Followed));
        assert_eq!(decide_follow(1, 2, true, None), Ok(FollowOutcome::Requested));
        assert_eq!(
            decide_follow(1, 2, true, Some(FollowStatus::Requested)),
            Ok(FollowOutcome::AlreadyRequested)
        );
        assert_eq!(
            decide_follow(1, 1, false, None),
            Err(MembershipError::SelfTarget)
        );
    }

    #[test]
    fn accept_follow_needs_pending_request() {
        assert_eq!(decide_accept_follow(Some(FollowStatus::Requested)), Ok(()));
        assert_eq!(
            decide_accept_follow(Some(FollowStatus::Accepted)),
            Err(MembershipError::NoPendingRequest)
        );
    }
}
