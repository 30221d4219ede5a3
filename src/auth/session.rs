use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::Rng;
use rusqlite::{params, OptionalExtension};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::db::RepositoryError;
use crate::state::DbPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Opaque token to user identity, backed by the `sessions` table with an
/// in-memory cache in front of it.
///
/// A user may hold any number of live sessions at once; logging in on one
/// device never invalidates another. [`SessionStore::delete_all_for_user`]
/// is the "log out everywhere" path.
#[derive(Clone)]
pub struct SessionStore {
    pool: DbPool,
    cache: Arc<Mutex<HashMap<String, Session>>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(pool: DbPool, ttl: Duration) -> Self {
        Self {
            pool,
            cache: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn create(&self, user_id: i64) -> Result<Session, RepositoryError> {
        self.create_at(user_id, Utc::now()).await
    }

    pub async fn create_at(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Session, RepositoryError> {
        let session = Session {
            token: generate_token(),
            user_id,
            created_at: now,
            expires_at: now + self.ttl,
        };

        let mut cache = self.cache.lock().await;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.token,
                user_id,
                now.timestamp_millis(),
                session.expires_at.timestamp_millis()
            ],
        )?;
        cache.insert(session.token.clone(), session.clone());

        Ok(session)
    }

    /// Looks a token up without extending it. Expired sessions resolve to `None`
    /// even before the sweeper has removed them.
    pub async fn resolve(&self, token: &str) -> Result<Option<Session>, RepositoryError> {
        self.resolve_at(token, Utc::now()).await
    }

    pub async fn resolve_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, RepositoryError> {
        let mut cache = self.cache.lock().await;
        self.lookup_locked(&mut cache, token, now)
    }

    /// Pushes expiry to `now + duration`. Only a live session is extended.
    pub async fn extend(&self, token: &str, duration: Duration) -> Result<bool, RepositoryError> {
        self.extend_at(token, duration, Utc::now()).await
    }

    pub async fn extend_at(
        &self,
        token: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut cache = self.cache.lock().await;
        if self.lookup_locked(&mut cache, token, now)?.is_none() {
            return Ok(false);
        }

        let expires_at = now + duration;
        let conn = self.pool.get()?;
        let rows = conn.execute(
            "UPDATE sessions SET expires_at = ?1 WHERE token = ?2 AND expires_at > ?3",
            params![
                expires_at.timestamp_millis(),
                token,
                now.timestamp_millis()
            ],
        )?;

        if rows == 0 {
            cache.remove(token);
            return Ok(false);
        }
        if let Some(session) = cache.get_mut(token) {
            session.expires_at = expires_at;
        }
        Ok(true)
    }

    pub async fn delete(&self, token: &str) -> Result<bool, RepositoryError> {
        let mut cache = self.cache.lock().await;
        cache.remove(token);
        let conn = self.pool.get()?;
        let rows = conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
        Ok(rows > 0)
    }

    pub async fn delete_all_for_user(&self, user_id: i64) -> Result<usize, RepositoryError> {
        let mut cache = self.cache.lock().await;
        cache.retain(|_, session| session.user_id != user_id);
        let conn = self.pool.get()?;
        let rows = conn.execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])?;
        Ok(rows)
    }

    pub async fn purge_expired(&self) -> Result<usize, RepositoryError> {
        self.purge_expired_at(Utc::now()).await
    }

    /// Removes expired rows from the database and the cache.
    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let mut cache = self.cache.lock().await;
        cache.retain(|_, session| session.is_live(now));
        let conn = self.pool.get()?;
        let rows = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(rows)
    }

    /// Drops expired entries from the cache only.
    pub async fn sweep_cache_at(&self, now: DateTime<Utc>) -> usize {
        let mut cache = self.cache.lock().await;
        let before = cache.len();
        cache.retain(|_, session| session.is_live(now));
        before - cache.len()
    }

    /// Starts the database sweep and the cache sweep.
    pub fn spawn_sweepers(
        &self,
        db_interval: StdDuration,
        cache_interval: StdDuration,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let store = self.clone();
        let db_sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(db_interval);
            loop {
                ticker.tick().await;
                match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!("Purged {} expired sessions", count),
                    Err(e) => tracing::error!("Session sweep failed: {}", e),
                }
            }
        });

        let store = self.clone();
        let cache_sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache_interval);
            loop {
                ticker.tick().await;
                let removed = store.sweep_cache_at(Utc::now()).await;
                if removed > 0 {
                    tracing::debug!("Evicted {} cached sessions", removed);
                }
            }
        });

        (db_sweeper, cache_sweeper)
    }

    fn lookup_locked(
        &self,
        cache: &mut HashMap<String, Session>,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, RepositoryError> {
        if let Some(session) = cache.get(token) {
            if session.is_live(now) {
                return Ok(Some(session.clone()));
            }
            cache.remove(token);
            return Ok(None);
        }

        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT user_id, created_at, expires_at FROM sessions
                 WHERE token = ?1 AND expires_at > ?2",
                params![token, now.timestamp_millis()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((user_id, created_ms, expires_ms)) = row else {
            return Ok(None);
        };
        let (Some(created_at), Some(expires_at)) = (from_millis(created_ms), from_millis(expires_ms))
        else {
            return Ok(None);
        };

        let session = Session {
            token: token.to_string(),
            user_id,
            created_at,
            expires_at,
        };
        cache.insert(session.token.clone(), session.clone());
        Ok(Some(session))
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Generate a cryptographically random 32-byte hex token.
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}
