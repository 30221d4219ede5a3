// Who may see what. The functions here are pure; `queries` gathers the facts.
pub mod queries;

use serde::{Deserialize, Serialize};

use crate::db::sql_text_enum;

/// Whoever is asking. Anonymous viewers carry the sentinel id `-1` into SQL,
/// which matches no user row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewer {
    Anonymous,
    User(i64),
}

impl Viewer {
    pub const ANONYMOUS_ID: i64 = -1;

    pub fn id(&self) -> i64 {
        match self {
            Viewer::Anonymous => Self::ANONYMOUS_ID,
            Viewer::User(id) => *id,
        }
    }

    pub fn is(&self, user_id: i64) -> bool {
        matches!(self, Viewer::User(id) if *id == user_id)
    }
}

sql_text_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum PostPrivacy {
        Public => "public",
        Private => "private",
        #[serde(alias = "manual")]
        AlmostPrivate => "almost-private",
        Group => "group",
        Unlisted => "unlisted",
    }
}

/// Everything needed to decide whether one post is visible to one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostFacts {
    pub author_id: i64,
    pub privacy: PostPrivacy,
    pub group_id: Option<i64>,
    pub viewer_in_group: bool,
    pub viewer_follows_author: bool,
    pub viewer_selected: bool,
}

/// Direct lookup by id. First matching rule wins.
pub fn post_visible(viewer: Viewer, facts: &PostFacts) -> bool {
    if facts.group_id.is_some() {
        return facts.viewer_in_group;
    }
    if viewer.is(facts.author_id) {
        return true;
    }
    match facts.privacy {
        PostPrivacy::Public | PostPrivacy::Unlisted => true,
        PostPrivacy::Private => facts.viewer_follows_author,
        PostPrivacy::AlmostPrivate => facts.viewer_selected,
        // Group privacy without a group cannot be created
        PostPrivacy::Group => false,
    }
}

/// Whether the post shows up in feeds. Unlisted posts only appear in their
/// author's own listings; group posts have their own feeds.
pub fn post_listed(viewer: Viewer, facts: &PostFacts) -> bool {
    if facts.group_id.is_some() {
        return false;
    }
    if facts.privacy == PostPrivacy::Unlisted {
        return viewer.is(facts.author_id);
    }
    post_visible(viewer, facts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileAccess {
    Full,
    Limited,
}

pub fn profile_access(
    viewer: Viewer,
    user_id: i64,
    user_private: bool,
    viewer_follows: bool,
) -> ProfileAccess {
    if viewer.is(user_id) || !user_private || viewer_follows {
        ProfileAccess::Full
    } else {
        ProfileAccess::Limited
    }
}

/// Attendance may change only before the event starts.
pub fn attendance_open(
    starts_at: chrono::DateTime<chrono::Utc>,
    now: chrono::DateTime<chrono::Utc>,
) -> bool {
    starts_at > now
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(privacy: PostPrivacy) -> PostFacts {
        PostFacts {
            author_id: 1,
            privacy,
            group_id: None,
            viewer_in_group: false,
            viewer_follows_author: false,
            viewer_selected: false,
        }
    }

    #[test]
    fn anonymous_id_is_sentinel() {
        assert_eq!(Viewer::Anonymous.id(), -1);
        assert!(!Viewer::Anonymous.is(-1));
        assert_eq!(Viewer::User(5).id(), 5);
    }

    #[test]
    fn public_is_visible_to_everyone() {
        let f = facts(PostPrivacy::Public);
        assert!(post_visible(Viewer::Anonymous, &f));
        assert!(post_visible(Viewer::User(2), &f));
    }

    #[test]
    fn private_needs_accepted_follow() {
        let f = facts(PostPrivacy::Private);
        assert!(!post_visible(Viewer::User(2), &f));
        assert!(post_visible(Viewer::User(1), &f));
        let followed = PostFacts {
            viewer_follows_author: true,
            ..f
        };
        assert!(post_visible(Viewer::User(2), &followed));
    }

    #[test]
    fn almost_private_needs_selection() {
        let f = facts(PostPrivacy::AlmostPrivate);
        assert!(!post_visible(Viewer::User(2), &f));
        let selected = PostFacts {
            viewer_selected: true,
            ..f
        };
        assert!(post_visible(Viewer::User(2), &selected));
    }

    #[test]
    fn group_posts_need_membership_even_for_author() {
        let f = PostFacts {
            group_id: Some(3),
            ..facts(PostPrivacy::Group)
        };
        assert!(!post_visible(Viewer::User(1), &f));
        let member = PostFacts {
            viewer_in_group: true,
            ..f
        };
        assert!(post_visible(Viewer::User(2), &member));
        assert!(!post_listed(Viewer::User(2), &member));
    }

    #[test]
    fn unlisted_is_direct_only() {
        let f = facts(PostPrivacy::Unlisted);
        assert!(post_visible(Viewer::Anonymous, &f));
        assert!(!post_listed(Viewer::Anonymous, &f));
        assert!(!post_listed(Viewer::User(2), &f));
        assert!(post_listed(Viewer::User(1), &f));
    }

    #[test]
    fn manual_is_an_alias() {
        let privacy: PostPrivacy = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(privacy, PostPrivacy::AlmostPrivate);
        assert_eq!(
            serde_json::to_string(&privacy).unwrap(),
            "\"almost-private\""
        );
    }

    #[test]
    fn private_profile_is_limited_to_strangers() {
        assert_eq!(
            profile_access(Viewer::User(2), 1, true, false),
            ProfileAccess::Limited
        );
        assert_eq!(
            profile_access(Viewer::Anonymous, 1, true, false),
            ProfileAccess::Limited
        );
        assert_eq!(
            profile_access(Viewer::User(2), 1, true, true),
            ProfileAccess::Full
        );
        assert_eq!(
            profile_access(Viewer::User(1), 1, true, false),
            ProfileAccess::Full
        );
        assert_eq!(
            profile_access(Viewer::Anonymous, 1, false, false),
            ProfileAccess::Full
        );
    }

    #[test]
    fn attendance_closes_at_start() {
        let now = chrono::Utc::now();
        assert!(attendance_open(now + chrono::Duration::minutes(1), now));
        assert!(!attendance_open(now, now));
    }
}
