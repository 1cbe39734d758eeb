use crate::shard::{attach_alias, shard_path, DayShardStore};
use chrono::{DateTime, Duration, Local, LocalResult, NaiveDate, TimeZone, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement, Value};
use std::collections::{HashMap, HashSet};
use taghist_error::THResult;
use taghist_models::{TagSample, THValue};
use tracing::{debug, instrument, warn};

/// Schema prefix of one day involved in a range query: empty for the open
/// "today" shard, `"d20260807."` for an attached historical shard.
struct DayPart {
    prefix: String,
}

impl DayShardStore {
    /// Range-query samples for the given tag names across all day shards
    /// intersecting `[start, end]`.
    ///
    /// Historical shards are attached for the duration of this call and
    /// detached again before it returns, on error paths included. Shards
    /// that were already attached by someone else are used but left alone.
    /// A failure for one tag is logged and does not affect the others.
    #[instrument(name = "store-query", skip_all, fields(tags = tag_names.len()))]
    pub async fn query(
        &self,
        tag_names: &[String],
        start: DateTime<Local>,
        end: DateTime<Local>,
    ) -> THResult<Vec<TagSample>> {
        if tag_names.is_empty() || end < start {
            return Ok(Vec::new());
        }
        let (conn, open_date) = {
            let guard = self.open.read().await;
            (guard.conn.clone(), guard.date)
        };

        let first_day = start.with_timezone(&Utc).date_naive();
        let last_day = end.with_timezone(&Utc).date_naive();

        let (parts, attached_now) = self
            .attach_days(&conn, open_date, days_between(first_day, last_day))
            .await?;

        let result = if parts.is_empty() {
            Ok(Vec::new())
        } else {
            run_tag_queries(&conn, &parts, tag_names, start, end).await
        };

        detach_all(&conn, &attached_now).await;
        result
    }

    /// All tag names known to the shards of the last `lookback_days` days
    /// (today included), mapped to their comments. The most recent comment
    /// wins when a name appears in several shards.
    #[instrument(name = "store-known-tags", skip_all)]
    pub async fn list_known_tags(&self, lookback_days: u32) -> THResult<HashMap<String, String>> {
        let (conn, open_date) = {
            let guard = self.open.read().await;
            (guard.conn.clone(), guard.date)
        };
        let today = Utc::now().date_naive();
        let days: Vec<NaiveDate> = (0..=i64::from(lookback_days))
            .map(|back| today - Duration::days(back))
            .collect();

        let (parts, attached_now) = self.attach_days(&conn, open_date, days).await?;

        let mut known = HashMap::new();
        for part in &parts {
            let rows = conn
                .query_all(Statement::from_string(
                    DbBackend::Sqlite,
                    format!("SELECT name, comment FROM {}tag", part.prefix),
                ))
                .await;
            match rows {
                Ok(rows) => {
                    for row in rows {
                        let name: String = row.try_get("", "name")?;
                        let comment: String = row.try_get("", "comment").unwrap_or_default();
                        known.entry(name).or_insert(comment);
                    }
                }
                Err(e) => warn!(error = %e, "tag listing failed for one shard"),
            }
        }

        detach_all(&conn, &attached_now).await;
        Ok(known)
    }

    /// Set comment and chart flag on a tag row in today's shard. Invoked by
    /// the (out of scope) administration boundary; the metadata then travels
    /// forward through shard seeding.
    pub async fn set_tag_meta(&self, name: &str, comment: &str, chart: bool) -> THResult<()> {
        let conn = self.today_conn().await?;
        conn.execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "INSERT OR IGNORE INTO tag (name, comment, chart, log) VALUES (?, '', 0, 1)",
            [name.into()],
        ))
        .await?;
        conn.execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "UPDATE tag SET comment = ?, chart = ? WHERE name = ?",
            [comment.into(), i32::from(chart).into(), name.into()],
        ))
        .await?;
        Ok(())
    }

    /// Names of all databases currently attached to the open connection,
    /// as reported by `PRAGMA database_list`.
    pub async fn attached_databases(&self) -> THResult<Vec<String>> {
        let conn = { self.open.read().await.conn.clone() };
        attached_names(&conn)
            .await
            .map(|set| set.into_iter().collect())
    }

    /// Attach the shards of `days` that exist and are not the open shard,
    /// skipping any alias already attached. Returns the schema prefixes to
    /// query plus the aliases attached by this call (for later detach).
    async fn attach_days(
        &self,
        conn: &DatabaseConnection,
        open_date: NaiveDate,
        days: Vec<NaiveDate>,
    ) -> THResult<(Vec<DayPart>, Vec<String>)> {
        let already = attached_names(conn).await?;
        let mut parts = Vec::with_capacity(days.len());
        let mut attached_now = Vec::new();

        for day in days {
            if day == open_date {
                parts.push(DayPart {
                    prefix: String::new(),
                });
                continue;
            }
            let path = shard_path(self.data_dir(), day);
            if !path.exists() {
                continue;
            }
            let alias = attach_alias(day);
            if !already.contains(&alias) {
                if let Err(e) = conn
                    .execute(Statement::from_sql_and_values(
                        DbBackend::Sqlite,
                        format!("ATTACH DATABASE ? AS {alias}"),
                        [path.display().to_string().into()],
                    ))
                    .await
                {
                    warn!(error = %e, date = %day, "could not attach day shard");
                    continue;
                }
                attached_now.push(alias.clone());
            }
            parts.push(DayPart {
                prefix: format!("{alias}."),
            });
        }
        Ok((parts, attached_now))
    }
}

fn days_between(first: NaiveDate, last: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = first;
    while day <= last {
        days.push(day);
        day += Duration::days(1);
    }
    days
}

/// One `SELECT` per involved day, glued with `UNION ALL` and ordered by
/// time. Executed once per tag name with the name and range bound per part.
async fn run_tag_queries(
    conn: &DatabaseConnection,
    parts: &[DayPart],
    tag_names: &[String],
    start: DateTime<Local>,
    end: DateTime<Local>,
) -> THResult<Vec<TagSample>> {
    let sql = parts
        .iter()
        .map(|part| {
            format!(
                "SELECT d.time AS time, d.value AS value \
                 FROM {p}data d JOIN {p}tag t ON t.id = d.tag_id \
                 WHERE t.name = ? AND d.time >= ? AND d.time <= ?",
                p = part.prefix
            )
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    let sql = format!("{sql} ORDER BY time");

    let start_ms = start.timestamp_millis();
    let end_ms = end.timestamp_millis();

    let mut out = Vec::new();
    for name in tag_names {
        let mut values: Vec<Value> = Vec::with_capacity(parts.len() * 3);
        for _ in parts {
            values.push(name.clone().into());
            values.push(start_ms.into());
            values.push(end_ms.into());
        }
        let rows = conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                sql.clone(),
                values,
            ))
            .await;
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!(tag = %name, error = %e, "range query failed for tag");
                continue;
            }
        };
        debug!(tag = %name, rows = rows.len(), "range query rows");
        for row in rows {
            let time_ms: i64 = row.try_get("", "time")?;
            let text: Option<String> = row.try_get("", "value")?;
            let LocalResult::Single(time) = Local.timestamp_millis_opt(time_ms) else {
                continue;
            };
            out.push(TagSample::new(
                name.clone(),
                THValue::coerce_from_storage(text.as_deref()),
                time,
            ));
        }
    }
    Ok(out)
}

async fn attached_names(conn: &DatabaseConnection) -> THResult<HashSet<String>> {
    let rows = conn
        .query_all(Statement::from_string(
            DbBackend::Sqlite,
            "PRAGMA database_list",
        ))
        .await?;
    let mut names = HashSet::with_capacity(rows.len());
    for row in rows {
        names.insert(row.try_get::<String>("", "name")?);
    }
    Ok(names)
}

/// Detach everything this call attached; never fails the caller.
async fn detach_all(conn: &DatabaseConnection, aliases: &[String]) {
    for alias in aliases {
        if let Err(e) = conn
            .execute(Statement::from_string(
                DbBackend::Sqlite,
                format!("DETACH DATABASE {alias}"),
            ))
            .await
        {
            warn!(alias = %alias, error = %e, "could not detach day shard");
        }
    }
}
