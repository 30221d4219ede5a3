use askama::Template;
use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::db::timestamp;
use crate::realtime::Hub;
use crate::state::DbPool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRef {
    pub id: i64,
    pub title: String,
}

/// An action button attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub name: String,
    pub url: String,
    pub method: String,
}

impl Link {
    fn post(name: &str, url: String) -> Self {
        Self {
            name: name.to_string(),
            url,
            method: "post".to_string(),
        }
    }

    fn get(name: &str, url: String) -> Self {
        Self {
            name: name.to_string(),
            url,
            method: "get".to_string(),
        }
    }
}

/// Every domain event that produces a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Follow {
        follower: UserRef,
        target: i64,
    },
    FollowRequest {
        follower: UserRef,
        target: i64,
    },
    FollowAccepted {
        followee: UserRef,
        follower: i64,
    },
    Unfollow {
        follower: UserRef,
        target: i64,
    },
    GroupInvite {
        inviter: UserRef,
        invitee: i64,
        group: GroupRef,
    },
    GroupJoinRequest {
        requester: UserRef,
        owner: i64,
        group: GroupRef,
    },
    GroupJoined {
        member: UserRef,
        recipient: i64,
        group: GroupRef,
    },
    GroupRequestAccepted {
        approver: UserRef,
        requester: i64,
        group: GroupRef,
    },
    GroupInviteDeclined {
        invitee: UserRef,
        recipient: i64,
        group: GroupRef,
    },
    GroupRequestRejected {
        owner: UserRef,
        requester: i64,
        group: GroupRef,
    },
    GroupMemberLeft {
        member: UserRef,
        owner: i64,
        group: GroupRef,
    },
    GroupMemberRemoved {
        owner: UserRef,
        member: i64,
        group: GroupRef,
    },
    OwnershipTransferred {
        previous_owner: UserRef,
        new_owner: i64,
        group: GroupRef,
    },
    EventCreated {
        creator: UserRef,
        members: Vec<i64>,
        group: GroupRef,
        event: EventRef,
    },
}

#[derive(Template)]
#[template(
    source = "<strong>{{ actor }}</strong> {{ action }}{% if let Some(object) = object %} <strong>{{ object }}</strong>{% endif %}",
    ext = "html"
)]
struct MessageTemplate<'a> {
    actor: &'a str,
    action: &'a str,
    object: Option<&'a str>,
}

#[derive(Template)]
#[template(
    source = "<span>{{ message|safe }}</span>{% if !links.is_empty() %}<form>{% for link in links %}<button formmethod=\"{{ link.method }}\" formaction=\"{{ link.url }}\">{{ link.name }}</button>{% endfor %}</form>{% endif %}",
    ext = "html"
)]
struct ContentTemplate<'a> {
    message: &'a str,
    links: &'a [Link],
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Follow { .. } => "follow",
            Notification::FollowRequest { .. } => "follow_request",
            Notification::FollowAccepted { .. } => "follow_accepted",
            Notification::Unfollow { .. } => "unfollow",
            Notification::GroupInvite { .. } => "group_invite",
            Notification::GroupJoinRequest { .. } => "group_join_request",
            Notification::GroupJoined { .. } => "group_joined",
            Notification::GroupRequestAccepted { .. } => "group_request_accepted",
            Notification::GroupInviteDeclined { .. } => "group_invite_declined",
            Notification::GroupRequestRejected { .. } => "group_request_rejected",
            Notification::GroupMemberLeft { .. } => "group_member_left",
            Notification::GroupMemberRemoved { .. } => "group_member_removed",
            Notification::OwnershipTransferred { .. } => "ownership_transferred",
            Notification::EventCreated { .. } => "event_created",
        }
    }

    pub fn targets(&self) -> Vec<i64> {
        match self {
            Notification::Follow { target, .. }
            | Notification::FollowRequest { target, .. }
            | Notification::Unfollow { target, .. } => vec![*target],
            Notification::FollowAccepted { follower, .. } => vec![*follower],
            Notification::GroupInvite { invitee, .. } => vec![*invitee],
            Notification::GroupJoinRequest { owner, .. }
            | Notification::GroupMemberLeft { owner, .. } => vec![*owner],
            Notification::GroupJoined { recipient, .. }
            | Notification::GroupInviteDeclined { recipient, .. } => vec![*recipient],
            Notification::GroupRequestAccepted { requester, .. }
            | Notification::GroupRequestRejected { requester, .. } => vec![*requester],
            Notification::GroupMemberRemoved { member, .. } => vec![*member],
            Notification::OwnershipTransferred { new_owner, .. } => vec![*new_owner],
            Notification::EventCreated {
                creator, members, ..
            } => members
                .iter()
                .copied()
                .filter(|id| *id != creator.id)
                .collect(),
        }
    }

    fn parts(&self) -> (&str, &'static str, Option<&str>) {
        match self {
            Notification::Follow { follower, .. } => (follower.name.as_str(), "started following you", None),
            Notification::FollowRequest { follower, .. } => {
                (follower.name.as_str(), "wants to follow you", None)
            }
            Notification::FollowAccepted { followee, .. } => {
                (followee.name.as_str(), "accepted your follow request", None)
            }
            Notification::Unfollow { follower, .. } => (follower.name.as_str(), "stopped following you", None),
            Notification::GroupInvite { inviter, group, .. } => {
                (inviter.name.as_str(), "invited you to join", Some(group.name.as_str()))
            }
            Notification::GroupJoinRequest {
                requester, group, ..
            } => (requester.name.as_str(), "asked to join", Some(group.name.as_str())),
            Notification::GroupJoined { member, group, .. } => {
                (member.name.as_str(), "joined", Some(group.name.as_str()))
            }
            Notification::GroupRequestAccepted {
                approver, group, ..
            } => (
                approver.name.as_str(),
                "accepted your request to join",
                Some(group.name.as_str()),
            ),
            Notification::GroupInviteDeclined { invitee, group, .. } => (
                invitee.name.as_str(),
                "declined your invitation to",
                Some(group.name.as_str()),
            ),
            Notification::GroupRequestRejected { owner, group, .. } => (
                owner.name.as_str(),
                "declined your request to join",
                Some(group.name.as_str()),
            ),
            Notification::GroupMemberLeft { member, group, .. } => {
                (member.name.as_str(), "left", Some(group.name.as_str()))
            }
            Notification::GroupMemberRemoved { owner, group, .. } => {
                (owner.name.as_str(), "removed you from", Some(group.name.as_str()))
            }
            Notification::OwnershipTransferred {
                previous_owner,
                group,
                ..
            } => (
                previous_owner.name.as_str(),
                "made you the owner of",
                Some(group.name.as_str()),
            ),
            Notification::EventCreated { creator, event, .. } => {
                (creator.name.as_str(), "created the event", Some(event.title.as_str()))
            }
        }
    }

    /// HTML message with every user-supplied name escaped.
    pub fn message(&self) -> Result<String, askama::Error> {
        let (actor, action, object) = self.parts();
        MessageTemplate {
            actor,
            action,
            object,
        }
        .render()
    }

    pub fn links(&self) -> Vec<Link> {
        match self {
            Notification::FollowRequest { follower, .. } => vec![Link::post(
                "Accept",
                format!("/user/{}/accept", follower.id),
            )],
            Notification::GroupInvite { group, .. } => vec![
                Link::post("Join", format!("/group/{}/join", group.id)),
                Link::post("Decline", format!("/group/{}/decline", group.id)),
            ],
            Notification::GroupJoinRequest {
                requester, group, ..
            } => vec![
                Link::post(
                    "Accept",
                    format!("/group/{}/invite/{}", group.id, requester.id),
                ),
                Link::post(
                    "Reject",
                    format!("/group/{}/reject/{}", group.id, requester.id),
                ),
            ],
            Notification::EventCreated { event, .. } => {
                vec![Link::get("View", format!("/event/{}", event.id))]
            }
            _ => Vec::new(),
        }
    }

    /// Message plus action buttons, as stored in the inbox.
    pub fn render(&self) -> Result<String, askama::Error> {
        let message = self.message()?;
        let links = self.links();
        ContentTemplate {
            message: &message,
            links: &links,
        }
        .render()
    }
}

/// Request-side handle: hands notifications to the worker without waiting.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Never blocks. A full queue drops the notification.
    pub fn dispatch(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                tracing::warn!(kind = n.kind(), "Notification queue full, dropping")
            }
            Err(TrySendError::Closed(n)) => {
                tracing::warn!(kind = n.kind(), "Notification worker gone, dropping")
            }
        }
    }
}

pub fn spawn_worker(
    pool: DbPool,
    hub: Hub,
    mut rx: mpsc::Receiver<Notification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            deliver(&pool, &hub, &notification).await;
        }
        tracing::debug!("Notification worker stopped");
    })
}

/// Persists one row per target, then pushes to connected clients.
/// Returns the number of rows written.
pub async fn deliver(pool: &DbPool, hub: &Hub, notification: &Notification) -> usize {
    let kind = notification.kind();
    let targets = notification.targets();
    if targets.is_empty() {
        return 0;
    }

    let content = match notification.render() {
        Ok(content) => content,
        Err(e) => {
            tracing::error!(kind, "Failed to render notification: {}", e);
            return 0;
        }
    };
    let links = notification.links();
    let links_json = match serde_json::to_string(&links) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(kind, "Failed to encode notification links: {}", e);
            return 0;
        }
    };

    let mut persisted = 0;
    match pool.get() {
        Ok(conn) => {
            let now = timestamp(Utc::now());
            for target in &targets {
                match conn.execute(
                    "INSERT INTO notifications (user_id, kind, content, links, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![target, kind, content, links_json, now],
                ) {
                    Ok(_) => persisted += 1,
                    Err(e) => tracing::error!(
                        kind,
                        user_id = target,
                        "Failed to persist notification: {}",
                        e
                    ),
                }
            }
        }
        Err(e) => tracing::error!(kind, "No connection for notifications: {}", e),
    }

    let payload = json!({
        "type": "notification",
        "targets": targets,
        "notification": {
            "kind": kind,
            "content": content,
            "links": links,
        },
    });
    hub.broadcast(payload.to_string()).await;

    persisted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{insert_user, test_pool};

    fn user(id: i64, name: &str) -> UserRef {
        UserRef {
            id,
            name: name.to_string(),
        }
    }

    fn group() -> GroupRef {
        GroupRef {
            id: 9,
            name: "Rustaceans".to_string(),
        }
    }

    #[test]
    fn names_are_escaped() {
        let n = Notification::Follow {
            follower: user(1, "<script>alert(1)</script>"),
            target: 2,
        };
        let message = n.message().unwrap();
        assert!(!message.contains("<script>"));
        assert!(message.contains("&lt;script&gt;"));
        assert!(message.starts_with("<strong>"));
    }

    #[test]
    fn invite_message_and_links() {
        let n = Notification::GroupInvite {
            inviter: user(1, "Ada Lovelace"),
            invitee: 2,
            group: group(),
        };
        assert_eq!(
            n.message().unwrap(),
            "<strong>Ada Lovelace</strong> invited you to join <strong>Rustaceans</strong>"
        );
        let links = n.links();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].url, "/group/9/join");
        assert_eq!(links[1].url, "/group/9/decline");
        assert_eq!(n.targets(), vec![2]);
    }

    #[test]
    fn rendered_content_carries_buttons() {
        let n = Notification::FollowRequest {
            follower: user(4, "Grace Hopper"),
            target: 5,
        };
        let content = n.render().unwrap();
        assert!(content.starts_with("<span><strong>Grace Hopper</strong>"));
        assert!(content.contains("<button formmethod=\"post\""));
        assert!(content.contains(">Accept</button>"));
    }

    #[test]
    fn event_created_skips_creator() {
        let n = Notification::EventCreated {
            creator: user(1, "Ada"),
            members: vec![1, 2, 3],
            group: group(),
            event: EventRef {
                id: 5,
                title: "Meetup".into(),
            },
        };
        assert_eq!(n.targets(), vec![2, 3]);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (notifier, mut rx) = Notifier::channel(1);
        let n = Notification::Unfollow {
            follower: user(1, "Ada"),
            target: 2,
        };
        notifier.dispatch(n.clone());
        notifier.dispatch(n.clone());
        assert_eq!(rx.recv().await, Some(n));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deliver_persists_each_target_and_survives_bad_ones() {
        let (_tmp, pool) = test_pool();
        let ada = insert_user(&pool, "ada", false);
        let bob = insert_user(&pool, "bob", false);
        let hub = Hub::default();

        let n = Notification::EventCreated {
            creator: user(ada, "Ada"),
            members: vec![ada, bob, 4040],
            group: group(),
            event: EventRef {
                id: 1,
                title: "Meetup".into(),
            },
        };
        // 4040 is not a user, the foreign key rejects it
        assert_eq!(deliver(&pool, &hub, &n).await, 1);

        let stored: (i64, String) = pool
            .get()
            .unwrap()
            .query_row(
                "SELECT user_id, kind FROM notifications",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(stored, (bob, "event_created".to_string()));
    }

    #[tokio::test]
    async fn deliver_pushes_to_hub() {
        let (_tmp, pool) = test_pool();
        let ada = insert_user(&pool, "ada", false);
        let hub = Hub::default();
        let (_id, mut rx) = hub.register().await;

        let n = Notification::Follow {
            follower: user(99, "Someone"),
            target: ada,
        };
        deliver(&pool, &hub, &n).await;

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "notification");
        assert_eq!(frame["targets"], json!([ada]));
        assert_eq!(frame["notification"]["kind"], "follow");
    }
}
