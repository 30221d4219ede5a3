use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::auth::SessionStore;
use crate::config::Config;
use crate::db;
use crate::membership::Memberships;
use crate::notify::{self, Notifier};
use crate::realtime::Hub;

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Config,
    pub sessions: SessionStore,
    pub notifier: Notifier,
    pub hub: Hub,
    pub memberships: Memberships,
}

impl AppState {
    /// Wires the services around an already migrated pool and starts the
    /// notification worker. Must be called inside a tokio runtime.
    pub fn new(db: DbPool, config: Config) -> Self {
        let hub = Hub::default();
        let (notifier, rx) = Notifier::channel(config.notifications.queue_capacity);
        notify::spawn_worker(db.clone(), hub.clone(), rx);

        let sessions = SessionStore::new(db.clone(), config.session_ttl());
        let memberships = Memberships::sqlite(db.clone(), notifier.clone());

        Self {
            db,
            config,
            sessions,
            notifier,
            hub,
            memberships,
        }
    }

    /// Opens and migrates the database named by `config`, then builds the state.
    pub fn initialize(config: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(config.uploads_path())?;
        let pool = db::create_pool(&config.db_path())?;
        db::run_migrations(&pool)?;
        Ok(Self::new(pool, config))
    }
}
