use std::{net::IpAddr, path::Path};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, LocalBoxStream};
use libsql::params;
use tracing::warn;

use super::models::{AddressFamily, CachedLookup, ModuleQueueItem, NEGATIVE_MARKER, ScheduleEntry};
use crate::catalogue::{ModuleKind, TestId};
use crate::escalation::FailureCounter;
use crate::pool::{self, LibsqlManager, LibsqlPool};

/// Due schedule rows, read lazily from an open cursor.
pub type DueTests = LocalBoxStream<'static, Result<ScheduleEntry>>;

/// Store trait for abstracting persistence operations
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or refresh a schedule row; an existing row keeps its due time
    async fn register(&self, entry: &ScheduleEntry) -> Result<()>;

    /// Mark every schedule row invalid ahead of re-registration
    async fn begin_sweep(&self) -> Result<()>;

    /// Delete rows that were not re-registered since `begin_sweep`
    async fn finish_sweep(&self) -> Result<u64>;

    /// Rows whose interval has elapsed, restricted to `location` when given
    async fn due_tests(&self, location: Option<&str>, now: i64) -> Result<DueTests>;

    /// Record that a test ran at `now`
    async fn mark_done(&self, id: &TestId, now: i64) -> Result<()>;

    /// Make every test of `host` due immediately
    async fn force_test(&self, host: &str) -> Result<u64>;

    /// Seconds until the next row falls due; `None` when the schedule is empty
    async fn seconds_to_next_test(&self, location: Option<&str>, now: i64) -> Result<Option<i64>>;

    async fn dns_lookup(&self, hostname: &str, family: AddressFamily) -> Result<Option<CachedLookup>>;

    /// Store a lookup result; `None` records a failed lookup
    async fn dns_update(&self, hostname: &str, family: AddressFamily, address: Option<IpAddr>, now: i64) -> Result<()>;

    async fn enqueue_module(&self, item: &ModuleQueueItem) -> Result<()>;

    /// Remove and return up to `limit` queued tests for `module`, oldest first
    async fn take_module_batch(&self, module: ModuleKind, limit: usize) -> Result<Vec<ModuleQueueItem>>;

    async fn load_counter(&self, host: &str, test: &str) -> Result<FailureCounter>;

    async fn save_counter(&self, host: &str, test: &str, counter: FailureCounter) -> Result<()>;
}

/// LibSQL store implementation
pub struct LibsqlStore {
    pool: LibsqlPool,
}

impl LibsqlStore {
    /// Open (or create) the store file and bring its schema up to date
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = pool::open_local(path, 4).await?;
        let conn = pool.get().await?;
        super::initialize_store(&conn).await?;
        drop(conn);

        Ok(Self { pool })
    }

    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }
}

fn dns_columns(family: AddressFamily) -> (&'static str, &'static str) {
    match family {
        AddressFamily::V4 => ("ip4", "upd4"),
        AddressFamily::V6 => ("ip6", "upd6"),
    }
}

fn entry_from_row(row: &libsql::Row) -> Result<ScheduleEntry> {
    Ok(ScheduleEntry {
        id: TestId { host: row.get(0)?, testspec: row.get(1)?, destination: row.get(2)? },
        location: row.get(3)?,
        test_type: row.get(4)?,
        source_ip: row.get(5)?,
        timeout_secs: row.get(6)?,
        interval_secs: row.get(7)?,
        due: row.get(8)?,
    })
}

#[async_trait]
impl Store for LibsqlStore {
    async fn register(&self, entry: &ScheduleEntry) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO schedule (host, testspec, destination, location, testtype, sourceip, timeout_secs, interval_secs, due, valid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 1)
             ON CONFLICT (host, testspec, destination) DO UPDATE SET
                location = excluded.location,
                testtype = excluded.testtype,
                sourceip = excluded.sourceip,
                timeout_secs = excluded.timeout_secs,
                interval_secs = excluded.interval_secs,
                valid = 1",
            params![
                entry.id.host.clone(),
                entry.id.testspec.clone(),
                entry.id.destination.clone(),
                entry.location.clone(),
                entry.test_type.clone(),
                entry.source_ip.clone(),
                entry.timeout_secs,
                entry.interval_secs
            ],
        )
        .await?;
        Ok(())
    }

    async fn begin_sweep(&self) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute("UPDATE schedule SET valid = 0", ()).await?;
        Ok(())
    }

    async fn finish_sweep(&self) -> Result<u64> {
        let conn = self.get_conn().await?;
        Ok(conn.execute("DELETE FROM schedule WHERE valid = 0", ()).await?)
    }

    async fn due_tests(&self, location: Option<&str>, now: i64) -> Result<DueTests> {
        let conn = self.get_conn().await?;
        let rows = conn
            .query(
                "SELECT host, testspec, destination, location, testtype, sourceip, timeout_secs, interval_secs, due
                 FROM schedule
                 WHERE valid = 1 AND due + interval_secs <= ?1
                   AND (?2 IS NULL OR location IS NULL OR location = ?2)
                 ORDER BY due",
                params![now, location.map(str::to_string)],
            )
            .await?;

        let cursor = stream::unfold(Some((conn, rows)), |state| async move {
            let (conn, mut rows) = state?;
            match rows.next().await {
                Ok(Some(row)) => Some((entry_from_row(&row), Some((conn, rows)))),
                Ok(None) => None,
                Err(err) => Some((Err(err.into()), None)),
            }
        });
        Ok(Box::pin(cursor))
    }

    async fn mark_done(&self, id: &TestId, now: i64) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE schedule SET due = ?1 WHERE host = ?2 AND testspec = ?3 AND destination = ?4",
            params![now, id.host.clone(), id.testspec.clone(), id.destination.clone()],
        )
        .await?;
        Ok(())
    }

    async fn force_test(&self, host: &str) -> Result<u64> {
        let conn = self.get_conn().await?;
        Ok(conn.execute("UPDATE schedule SET due = 0 WHERE host = ?1", params![host.to_string()]).await?)
    }

    async fn seconds_to_next_test(&self, location: Option<&str>, now: i64) -> Result<Option<i64>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT MIN(due + interval_secs - ?1) FROM schedule
                 WHERE valid = 1 AND (?2 IS NULL OR location IS NULL OR location = ?2)",
                params![now, location.map(str::to_string)],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get::<Option<i64>>(0)?.map(|seconds| seconds.max(0))),
            None => Ok(None),
        }
    }

    async fn dns_lookup(&self, hostname: &str, family: AddressFamily) -> Result<Option<CachedLookup>> {
        let conn = self.get_conn().await?;
        let (ip_column, updated_column) = dns_columns(family);
        let mut rows = conn
            .query(
                &format!("SELECT {ip_column}, {updated_column} FROM dnscache WHERE hostname = ?1"),
                params![hostname.to_ascii_lowercase()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let (Some(text), Some(updated)) = (row.get::<Option<String>>(0)?, row.get::<Option<i64>>(1)?) else {
            return Ok(None);
        };

        if text == NEGATIVE_MARKER {
            return Ok(Some(CachedLookup { address: None, updated }));
        }
        match text.parse::<IpAddr>() {
            Ok(address) => Ok(Some(CachedLookup { address: Some(address), updated })),
            Err(_) => {
                warn!(hostname, cached = text, "discarding unparsable DNS cache entry");
                Ok(None)
            }
        }
    }

    async fn dns_update(&self, hostname: &str, family: AddressFamily, address: Option<IpAddr>, now: i64) -> Result<()> {
        let conn = self.get_conn().await?;
        let (ip_column, updated_column) = dns_columns(family);
        let value = address.map_or_else(|| NEGATIVE_MARKER.to_string(), |address| address.to_string());

        conn.execute(
            &format!(
                "INSERT INTO dnscache (hostname, {ip_column}, {updated_column}) VALUES (?1, ?2, ?3)
                 ON CONFLICT (hostname) DO UPDATE SET {ip_column} = excluded.{ip_column}, {updated_column} = excluded.{updated_column}"
            ),
            params![hostname.to_ascii_lowercase(), value, now],
        )
        .await?;
        Ok(())
    }

    async fn enqueue_module(&self, item: &ModuleQueueItem) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT OR IGNORE INTO module_queue (module, host, testspec, destination, location, queued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.module.as_str(),
                item.test.host.clone(),
                item.test.testspec.clone(),
                item.test.destination.clone(),
                item.location.clone(),
                item.queued_at
            ],
        )
        .await?;
        Ok(())
    }

    async fn take_module_batch(&self, module: ModuleKind, limit: usize) -> Result<Vec<ModuleQueueItem>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, host, testspec, destination, location, queued_at FROM module_queue
                 WHERE module = ?1 ORDER BY id LIMIT ?2",
                params![module.as_str(), limit as i64],
            )
            .await?;

        let mut batch = Vec::new();
        while let Some(row) = rows.next().await? {
            batch.push(ModuleQueueItem {
                id: Some(row.get(0)?),
                module,
                test: TestId { host: row.get(1)?, testspec: row.get(2)?, destination: row.get(3)? },
                location: row.get(4)?,
                queued_at: row.get(5)?,
            });
        }
        drop(rows);

        if let Some(last) = batch.last().and_then(|item| item.id) {
            conn.execute(
                "DELETE FROM module_queue WHERE module = ?1 AND id <= ?2",
                params![module.as_str(), last],
            )
            .await?;
        }
        Ok(batch)
    }

    async fn load_counter(&self, host: &str, test: &str) -> Result<FailureCounter> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT downcount, downstart FROM failcount WHERE host = ?1 AND test = ?2",
                params![host.to_string(), test.to_string()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(FailureCounter { consecutive: row.get::<i64>(0)?.max(0) as u32, since: row.get(1)? }),
            None => Ok(FailureCounter::default()),
        }
    }

    async fn save_counter(&self, host: &str, test: &str, counter: FailureCounter) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO failcount (host, test, downcount, downstart) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (host, test) DO UPDATE SET downcount = excluded.downcount, downstart = excluded.downstart",
            params![host.to_string(), test.to_string(), counter.consecutive as i64, counter.since],
        )
        .await?;
        Ok(())
    }
}
