use anyhow::Result;
use libsql::Connection;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 3;

/// Run store migrations
///
/// This is the single source of truth for the store schema.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::debug!("Store schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Schedule and DNS cache").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Module queue for helper tests").await?;
    }

    if current_version < 3 {
        run_migration_v3(conn).await?;
        record_migration(conn, 3, "Failure counters").await?;
    }

    tracing::info!("Store migrations completed (now at version {})", SCHEMA_VERSION);
    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now, description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: schedule keyed by (host, testspec, destination) and the
/// per-family DNS cache
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedule (
            host TEXT NOT NULL,
            testspec TEXT NOT NULL,
            destination TEXT NOT NULL,
            location TEXT,
            testtype TEXT NOT NULL,
            sourceip TEXT,
            timeout_secs INTEGER NOT NULL,
            interval_secs INTEGER NOT NULL,
            due INTEGER NOT NULL DEFAULT 0,
            valid INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (host, testspec, destination)
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dnscache (
            hostname TEXT PRIMARY KEY,
            ip4 TEXT,
            upd4 INTEGER,
            ip6 TEXT,
            upd6 INTEGER
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_schedule_location ON schedule(location)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_schedule_host ON schedule(host)", ()).await?;

    Ok(())
}

/// Migration v2: queue of helper tests waiting for a worker process
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS module_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            module TEXT NOT NULL,
            host TEXT NOT NULL,
            testspec TEXT NOT NULL,
            destination TEXT NOT NULL,
            location TEXT,
            queued_at INTEGER NOT NULL,
            UNIQUE (module, host, testspec, destination)
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_module_queue_module ON module_queue(module, id)", ()).await?;

    Ok(())
}

/// Migration v3: consecutive-failure counters per (host, test)
async fn run_migration_v3(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS failcount (
            host TEXT NOT NULL,
            test TEXT NOT NULL,
            downcount INTEGER NOT NULL DEFAULT 0,
            downstart INTEGER,
            PRIMARY KEY (host, test)
        )",
        (),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn migrations_are_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let db = libsql::Builder::new_local(dir.path().join("store.db")).build().await?;
        let conn = db.connect()?;

        run_migrations(&conn).await?;
        run_migrations(&conn).await?;

        assert_eq!(get_current_version(&conn).await?, SCHEMA_VERSION);
        let mut rows = conn.query("SELECT COUNT(*) FROM schema_migrations", ()).await?;
        let row = rows.next().await?.expect("count row");
        assert_eq!(row.get::<i64>(0)?, SCHEMA_VERSION as i64);
        Ok(())
    }
}
