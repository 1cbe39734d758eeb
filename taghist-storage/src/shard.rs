use chrono::{Duration, NaiveDate, Utc};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement,
    TransactionTrait,
};
use std::path::{Path, PathBuf};
use taghist_error::{storage::StorageError, THError, THResult};
use taghist_models::{
    constants::{SHARD_FILE_EXT, SHARD_FILE_PREFIX},
    TagSample,
};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// File name of the shard for one UTC calendar day.
pub fn shard_file_name(date: NaiveDate) -> String {
    format!("{SHARD_FILE_PREFIX}{}.{SHARD_FILE_EXT}", date.format("%Y-%m-%d"))
}

/// Full path of the shard file for one UTC calendar day.
pub fn shard_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(shard_file_name(date))
}

/// Alias a historical shard is attached under (`d20260807`).
pub fn attach_alias(date: NaiveDate) -> String {
    format!("d{}", date.format("%Y%m%d"))
}

pub(crate) struct OpenShard {
    pub(crate) date: NaiveDate,
    pub(crate) conn: DatabaseConnection,
}

/// Day-sharded SQLite history store.
///
/// Holds a single long-lived connection to the current day's shard. The pool
/// is pinned to one connection because `ATTACH` state is per connection.
pub struct DayShardStore {
    data_dir: PathBuf,
    seed_lookback_days: u32,
    pub(crate) open: RwLock<OpenShard>,
}

impl DayShardStore {
    /// Open the store, creating the data directory and today's shard if
    /// they do not exist yet.
    #[instrument(name = "store-open", skip_all)]
    pub async fn open(data_dir: impl Into<PathBuf>, seed_lookback_days: u32) -> THResult<Self> {
        let data_dir = data_dir.into();
        let today = Utc::now().date_naive();
        let conn = open_shard(&data_dir, today, seed_lookback_days).await?;
        info!(dir = %data_dir.display(), date = %today, "history store opened");
        Ok(Self {
            data_dir,
            seed_lookback_days,
            open: RwLock::new(OpenShard { date: today, conn }),
        })
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Connection to today's shard, rotating to a fresh file when the UTC
    /// day has changed since the last call.
    pub(crate) async fn today_conn(&self) -> THResult<DatabaseConnection> {
        let today = Utc::now().date_naive();
        {
            let guard = self.open.read().await;
            if guard.date == today {
                return Ok(guard.conn.clone());
            }
        }
        let mut guard = self.open.write().await;
        if guard.date != today {
            info!(from = %guard.date, to = %today, "rotating day shard");
            let conn = open_shard(&self.data_dir, today, self.seed_lookback_days).await?;
            let old = std::mem::replace(&mut *guard, OpenShard { date: today, conn });
            if let Err(e) = old.conn.close().await {
                warn!(error = %e, "failed to close previous day shard");
            }
        }
        Ok(guard.conn.clone())
    }

    /// Append a batch of samples to today's shard in one transaction.
    ///
    /// Per sample: upsert the tag row by name (insert if absent), then insert
    /// the data row, ignoring it when `(tag_id, time)` already exists. A
    /// single commit at the end; any error rolls back the whole batch.
    /// Returns the number of samples written.
    #[instrument(name = "store-append", skip_all, fields(batch = samples.len()))]
    pub async fn append_batch(&self, samples: &[TagSample]) -> THResult<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        let conn = self.today_conn().await?;
        let txn = conn.begin().await?;
        match write_samples(&txn, samples).await {
            Ok(written) => {
                txn.commit().await?;
                debug!(written, "batch committed");
                Ok(written)
            }
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!(error = %rb, "rollback failed after batch error");
                }
                Err(e)
            }
        }
    }

    /// Write samples into the shard for an arbitrary UTC day.
    ///
    /// For today this delegates to `append_batch`. For any other day the
    /// shard is opened, written in one transaction and closed again within
    /// this call (scoped acquisition, released even on error).
    pub async fn backfill(&self, date: NaiveDate, samples: &[TagSample]) -> THResult<usize> {
        {
            let guard = self.open.read().await;
            if guard.date == date {
                drop(guard);
                return self.append_batch(samples).await;
            }
        }
        let conn = open_shard(&self.data_dir, date, self.seed_lookback_days).await?;
        let result = async {
            let txn = conn.begin().await?;
            match write_samples(&txn, samples).await {
                Ok(written) => {
                    txn.commit().await?;
                    Ok(written)
                }
                Err(e) => {
                    txn.rollback().await.ok();
                    Err(e)
                }
            }
        }
        .await;
        if let Err(e) = conn.close().await {
            warn!(error = %e, date = %date, "failed to close backfill shard");
        }
        result
    }

    /// Close the store, releasing today's connection.
    pub async fn close(&self) -> THResult<()> {
        let guard = self.open.read().await;
        guard.conn.clone().close().await?;
        Ok(())
    }
}

async fn write_samples<C: ConnectionTrait>(conn: &C, samples: &[TagSample]) -> THResult<usize> {
    let mut written = 0usize;
    for sample in samples {
        // Null means "not yet read"; nothing to persist.
        let Some(text) = sample.value.storage_text() else {
            continue;
        };
        conn.execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "INSERT OR IGNORE INTO tag (name, comment, chart, log) VALUES (?, '', 0, 1)",
            [sample.name.clone().into()],
        ))
        .await?;
        let row = conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT id FROM tag WHERE name = ?",
                [sample.name.clone().into()],
            ))
            .await?
            .ok_or_else(|| {
                THError::StorageError(StorageError::QueryFailed {
                    tag: sample.name.clone(),
                    reason: "tag row missing after upsert".into(),
                })
            })?;
        let tag_id: i64 = row.try_get("", "id")?;
        conn.execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "INSERT OR IGNORE INTO data (time, tag_id, value) VALUES (?, ?, ?)",
            [
                sample.time.timestamp_millis().into(),
                tag_id.into(),
                text.into(),
            ],
        ))
        .await?;
        written += 1;
    }
    Ok(written)
}

/// Open (creating if absent) the shard file for `date` and make sure its
/// schema exists. A brand-new shard gets its tag table seeded from recent
/// prior days so tag metadata survives day rollover.
async fn open_shard(
    dir: &Path,
    date: NaiveDate,
    seed_lookback_days: u32,
) -> THResult<DatabaseConnection> {
    tokio::fs::create_dir_all(dir).await?;
    let path = shard_path(dir, date);
    let url = format!("sqlite://{}?mode=rwc", path.display());

    let mut opts = ConnectOptions::new(&url);
    // ATTACH/DETACH state lives on the connection, so the pool must not
    // hand out more than one.
    opts.max_connections(1).sqlx_logging(false);
    let conn = Database::connect(opts).await?;

    create_schema(&conn).await?;
    seed_tag_table(&conn, dir, date, seed_lookback_days).await?;
    Ok(conn)
}

async fn create_schema(conn: &DatabaseConnection) -> THResult<()> {
    for sql in [
        "CREATE TABLE IF NOT EXISTS tag (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            comment TEXT NOT NULL DEFAULT '',
            chart INTEGER NOT NULL DEFAULT 0,
            log INTEGER NOT NULL DEFAULT 1
        )",
        "CREATE TABLE IF NOT EXISTS data (
            time INTEGER NOT NULL,
            tag_id INTEGER NOT NULL,
            value TEXT,
            PRIMARY KEY (tag_id, time)
        )",
        "CREATE INDEX IF NOT EXISTS idx_data_time ON data (time)",
    ] {
        conn.execute(Statement::from_string(DbBackend::Sqlite, sql)).await?;
    }
    Ok(())
}

/// Walk backward through up to `lookback` prior days, copying tag rows that
/// carry metadata (non-zero chart flag or non-empty comment) into a fresh
/// shard. Stops at the first day that yields at least one row.
async fn seed_tag_table(
    conn: &DatabaseConnection,
    dir: &Path,
    date: NaiveDate,
    lookback: u32,
) -> THResult<()> {
    let row = conn
        .query_one(Statement::from_string(
            DbBackend::Sqlite,
            "SELECT COUNT(*) AS n FROM tag",
        ))
        .await?;
    let existing: i64 = row.map(|r| r.try_get("", "n")).transpose()?.unwrap_or(0);
    if existing > 0 {
        return Ok(());
    }

    for back in 1..=i64::from(lookback) {
        let prev = date - Duration::days(back);
        let prev_path = shard_path(dir, prev);
        if !prev_path.exists() {
            continue;
        }
        let alias = format!("seed{}", prev.format("%Y%m%d"));
        if let Err(e) = conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                format!("ATTACH DATABASE ? AS {alias}"),
                [prev_path.display().to_string().into()],
            ))
            .await
        {
            warn!(error = %e, date = %prev, "could not attach shard for tag seeding");
            continue;
        }
        let copied = conn
            .execute(Statement::from_string(
                DbBackend::Sqlite,
                format!(
                    "INSERT OR IGNORE INTO tag (name, comment, chart, log)
                     SELECT name, comment, chart, log FROM {alias}.tag
                     WHERE chart != 0 OR comment != ''"
                ),
            ))
            .await;
        if let Err(e) = conn
            .execute(Statement::from_string(
                DbBackend::Sqlite,
                format!("DETACH DATABASE {alias}"),
            ))
            .await
        {
            warn!(error = %e, date = %prev, "could not detach seeding shard");
        }
        match copied {
            Ok(res) if res.rows_affected() > 0 => {
                info!(rows = res.rows_affected(), from = %prev, "seeded tag table");
                break;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, date = %prev, "tag seeding copy failed"),
        }
    }
    Ok(())
}
