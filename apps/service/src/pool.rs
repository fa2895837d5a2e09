use std::path::Path;

use deadpool::managed::{self, Pool, RecycleError, RecycleResult};
use libsql::{Connection, Database, Error as LibsqlError};

/// Milliseconds a connection waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Hands out connections to the local schedule database.
pub struct LibsqlManager {
    database: Database,
}

impl LibsqlManager {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

impl managed::Manager for LibsqlManager {
    type Type = Connection;
    type Error = LibsqlError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let conn = self.database.connect()?;
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ()).await?;
        Ok(conn)
    }

    async fn recycle(&self, conn: &mut Self::Type, _: &managed::Metrics) -> RecycleResult<Self::Error> {
        match conn.query("SELECT 1", ()).await?.next().await? {
            Some(_) => Ok(()),
            None => Err(RecycleError::Message("liveness query returned nothing".into())),
        }
    }
}

pub type LibsqlPool = Pool<LibsqlManager>;

/// Open `path`, creating it if needed, with write-ahead logging on.
pub async fn open_local(path: &Path, max_size: usize) -> anyhow::Result<LibsqlPool> {
    let database = libsql::Builder::new_local(path).build().await?;
    let pool: LibsqlPool = Pool::builder(LibsqlManager::new(database)).max_size(max_size).build()?;

    let conn = pool.get().await?;
    conn.query("PRAGMA journal_mode = WAL", ()).await?;
    Ok(pool)
}
