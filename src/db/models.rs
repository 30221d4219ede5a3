use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::db::sql_text_enum;
use crate::membership::{GroupAccess, GroupRole, MembershipStatus};
use crate::visibility::PostPrivacy;

pub const USER_COLUMNS: &str = "u.id, u.email, u.password_hash, u.first_name, u.last_name, \
     u.nickname, u.about, u.avatar, u.date_of_birth, u.private, u.created_at";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub nickname: Option<String>,
    pub about: Option<String>,
    pub avatar: Option<String>,
    pub date_of_birth: Option<String>,
    pub private: bool,
    pub created_at: String,
}

impl User {
    /// Reads a row selected with [`USER_COLUMNS`].
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            password_hash: row.get(2)?,
            first_name: row.get(3)?,
            last_name: row.get(4)?,
            nickname: row.get(5)?,
            about: row.get(6)?,
            avatar: row.get(7)?,
            date_of_birth: row.get(8)?,
            private: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

pub const USER_LIMITED_COLUMNS: &str = "u.id, u.first_name, u.last_name, u.nickname, u.avatar";

/// The projection shown to viewers who may not see the full profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserLimited {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
}

impl UserLimited {
    /// Reads five columns starting at `offset`, in [`USER_LIMITED_COLUMNS`] order.
    pub fn from_row_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            first_name: row.get(offset + 1)?,
            last_name: row.get(offset + 2)?,
            nickname: row.get(offset + 3)?,
            avatar: row.get(offset + 4)?,
        })
    }
}

impl From<&User> for UserLimited {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            nickname: user.nickname.clone(),
            avatar: user.avatar.clone(),
        }
    }
}

pub const GROUP_COLUMNS: &str = "g.id, g.name, g.description, g.access, g.created_at";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub access: GroupAccess,
    pub created_at: String,
}

impl Group {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            access: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupMember {
    pub user: UserLimited,
    pub status: MembershipStatus,
    pub role: GroupRole,
}

/// Post columns joined with the author's limited projection.
pub const POST_COLUMNS: &str = "p.id, p.author_id, p.group_id, p.privacy, p.content, p.images, \
     p.created_at, u.id, u.first_name, u.last_name, u.nickname, u.avatar";

#[derive(Debug, Clone, Serialize)]
pub struct Post {
    pub id: i64,
    pub author_id: i64,
    pub group_id: Option<i64>,
    pub privacy: PostPrivacy,
    pub content: String,
    pub images: Vec<String>,
    pub created_at: String,
    pub author: UserLimited,
}

impl Post {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let images: String = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            author_id: row.get(1)?,
            group_id: row.get(2)?,
            privacy: row.get(3)?,
            content: row.get(4)?,
            images: split_tokens(&images),
            created_at: row.get(6)?,
            author: UserLimited::from_row_at(row, 7)?,
        })
    }
}

pub const COMMENT_COLUMNS: &str = "c.id, c.post_id, c.content, c.image, c.created_at, \
     u.id, u.first_name, u.last_name, u.nickname, u.avatar";

#[derive(Debug, Clone, Serialize)]
pub struct Comment {
    pub id: i64,
    pub post_id: i64,
    pub content: String,
    pub image: Option<String>,
    pub created_at: String,
    pub author: UserLimited,
}

impl Comment {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            post_id: row.get(1)?,
            content: row.get(2)?,
            image: row.get(3)?,
            created_at: row.get(4)?,
            author: UserLimited::from_row_at(row, 5)?,
        })
    }
}

sql_text_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum Attendance {
        Going => "going",
        NotGoing => "not-going",
    }
}

pub const EVENT_COLUMNS: &str =
    "e.id, e.group_id, e.author_id, e.title, e.description, e.starts_at, e.created_at";

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: i64,
    pub group_id: i64,
    pub author_id: i64,
    pub title: String,
    pub description: String,
    pub starts_at: String,
    pub created_at: String,
}

impl Event {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            group_id: row.get(1)?,
            author_id: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            starts_at: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub is_group: bool,
    pub content: String,
    pub created_at: String,
}

impl Message {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            receiver_id: row.get(2)?,
            is_group: row.get(3)?,
            content: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub kind: String,
    pub content: String,
    pub links: serde_json::Value,
    pub created_at: String,
    pub read_at: Option<String>,
}

impl NotificationRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let links: String = row.get(3)?;
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            content: row.get(2)?,
            links: serde_json::from_str(&links).unwrap_or(serde_json::Value::Array(Vec::new())),
            created_at: row.get(4)?,
            read_at: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub token: String,
    pub name: String,
    pub extension: String,
    pub created_at: String,
}

/// Splits a comma separated list of file tokens, dropping blanks.
pub fn split_tokens(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_tokens_ignores_blanks() {
        assert_eq!(split_tokens(""), Vec::<String>::new());
        assert_eq!(split_tokens("a, b,,c "), vec!["a", "b", "c"]);
    }

    #[test]
    fn password_hash_is_never_serialized() {
        let user = User {
            id: 1,
            email: "a@example.com".into(),
            password_hash: "$2b$secret".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            nickname: None,
            about: None,
            avatar: None,
            date_of_birth: None,
            private: false,
            created_at: "2024-01-01T00:00:00.000Z".into(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("password_hash"));
    }

    #[test]
    fn attendance_parses_from_text() {
        assert_eq!("not-going".parse::<Attendance>().unwrap(), Attendance::NotGoing);
        assert!("maybe".parse::<Attendance>().is_err());
    }
}
