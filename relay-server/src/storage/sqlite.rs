//! SQLite storage backend for relaynode.
//!
//! Tables:
//! - `events`: one row per accepted event, with the JSON body in `raw`.
//!   `deleted_at` is set when the row is tombstoned or superseded.
//! - `tags`: indexed single-letter tags, one row per `(event, name, value)`.
//! - `tombstones`: `(event_id, pubkey)` pairs that can never be stored again.
//!   These survive compaction.
//! - `coordinate_tombstones`: per `(pubkey, kind, d)` the newest `created_at`
//!   an `a`-tag deletion covers. Versions at or before it are refused.

use super::{EventStore, PutOutcome, StoreStats};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use relay_types::{Coordinate, Event, EventId, Filter};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// SQLite-based event store.
///
/// Uses WAL mode for concurrent reads. Writes are serialized by an
/// in-process lock so each conditional write sees a stable snapshot.
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SqliteEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEventStore")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl SqliteEventStore {
    /// Open (or create) the database at `path`.
    pub async fn new(path: &Path) -> StorageResult<Self> {
        if path.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // A second connection would open a second, empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> StorageResult<Self> {
        let store = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> StorageResult<()> {
        const STATEMENTS: &[&str] = &[
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id BLOB PRIMARY KEY,
                pubkey BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                d_tag TEXT,
                raw TEXT NOT NULL,
                deleted_at INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                event_id BLOB NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tombstones (
                event_id BLOB NOT NULL,
                pubkey BLOB NOT NULL,
                deleted_by BLOB NOT NULL,
                deleted_at INTEGER NOT NULL,
                PRIMARY KEY (event_id, pubkey)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS coordinate_tombstones (
                pubkey BLOB NOT NULL,
                kind INTEGER NOT NULL,
                d_tag TEXT NOT NULL,
                deleted_until INTEGER NOT NULL,
                deleted_by BLOB NOT NULL,
                PRIMARY KEY (pubkey, kind, d_tag)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at DESC, id)",
            "CREATE INDEX IF NOT EXISTS idx_events_author ON events(pubkey, kind, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_deleted ON events(deleted_at)",
            "CREATE INDEX IF NOT EXISTS idx_tags_lookup ON tags(name, value)",
            "CREATE INDEX IF NOT EXISTS idx_tags_event ON tags(event_id)",
        ];

        for statement in STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }
        Ok(())
    }

    fn current_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    async fn fetch_filter(&self, filter: &Filter, limit: usize) -> StorageResult<Vec<Event>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT e.id, e.raw FROM events e WHERE e.deleted_at IS NULL AND ",
        );
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY e.created_at DESC, e.id ASC LIMIT ");
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = qb
            .build_query_as::<EventRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Event::try_from).collect()
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn put(&self, event: &Event) -> StorageResult<PutOutcome> {
        if event.is_ephemeral() {
            return Ok(PutOutcome::Ephemeral);
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let tombstoned: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM tombstones WHERE event_id = ?1 AND pubkey = ?2",
        )
        .bind(event.id.as_bytes().as_slice())
        .bind(event.pubkey.as_bytes().as_slice())
        .fetch_optional(&mut *tx)
        .await?;
        if tombstoned.is_some() {
            return Ok(PutOutcome::Deleted);
        }

        let existing: Option<i64> = sqlx::query_scalar("SELECT 1 FROM events WHERE id = ?1")
            .bind(event.id.as_bytes().as_slice())
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            return Ok(PutOutcome::Duplicate);
        }

        let now = Self::current_timestamp();
        if event.is_replaceable() || event.is_addressable() {
            let d_tag = event.is_addressable().then(|| event.identifier());
            let deleted_until: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT deleted_until FROM coordinate_tombstones
                WHERE pubkey = ?1 AND kind = ?2 AND d_tag = ?3
                "#,
            )
            .bind(event.pubkey.as_bytes().as_slice())
            .bind(i64::from(event.kind))
            .bind(d_tag.unwrap_or(""))
            .fetch_optional(&mut *tx)
            .await?;
            if deleted_until.is_some_and(|t| to_sql_time(event.created_at) <= t) {
                return Ok(PutOutcome::Deleted);
            }

            let newest: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT MAX(created_at) FROM events
                WHERE pubkey = ?1 AND kind = ?2 AND COALESCE(d_tag, '') = ?3
                  AND deleted_at IS NULL
                "#,
            )
            .bind(event.pubkey.as_bytes().as_slice())
            .bind(i64::from(event.kind))
            .bind(d_tag.unwrap_or(""))
            .fetch_one(&mut *tx)
            .await?;

            if newest.is_some_and(|t| t >= to_sql_time(event.created_at)) {
                return Ok(PutOutcome::Superseded);
            }

            let superseded = sqlx::query(
                r#"
                UPDATE events SET deleted_at = ?4
                WHERE pubkey = ?1 AND kind = ?2 AND COALESCE(d_tag, '') = ?3
                  AND deleted_at IS NULL
                "#,
            )
            .bind(event.pubkey.as_bytes().as_slice())
            .bind(i64::from(event.kind))
            .bind(d_tag.unwrap_or(""))
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if superseded > 0 {
                tracing::debug!(id = %event.id, kind = event.kind, superseded, "replaced older events");
            }
        }

        insert_event(&mut tx, event).await?;

        if event.is_deletion() {
            let removed = apply_deletion(
                &mut tx,
                &event.deletion_targets(),
                &event.deletion_coordinates(),
                event,
                now,
            )
            .await?;
            tracing::debug!(id = %event.id, removed, "applied deletion");
        }

        tx.commit().await?;
        Ok(PutOutcome::Stored)
    }

    async fn get(&self, id: &EventId) -> StorageResult<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(
            "SELECT id, raw FROM events WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(id.as_bytes().as_slice())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Event::try_from).transpose()
    }

    async fn query(&self, filters: &[Filter], max: usize) -> StorageResult<Vec<Event>> {
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        let mut overall = 0;

        for filter in filters {
            let limit = filter.limit.unwrap_or(max).min(max);
            overall = overall.max(limit);
            for event in self.fetch_filter(filter, limit).await? {
                if seen.insert(event.id) {
                    events.push(event);
                }
            }
        }

        events.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        events.truncate(overall);
        Ok(events)
    }

    async fn count(&self, filters: &[Filter]) -> StorageResult<u64> {
        if filters.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM events e WHERE e.deleted_at IS NULL AND (",
        );
        for (i, filter) in filters.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            push_filter(&mut qb, filter);
        }
        qb.push(")");

        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn delete(
        &self,
        targets: &[EventId],
        coordinates: &[Coordinate],
        deletion: &Event,
    ) -> StorageResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let removed = apply_deletion(
            &mut tx,
            targets,
            coordinates,
            deletion,
            Self::current_timestamp(),
        )
        .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn compact(&self, older_than: u64) -> StorageResult<u64> {
        let _guard = self.write_lock.lock().await;
        let cutoff = to_sql_time(older_than);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM tags WHERE event_id IN (
                SELECT id FROM events WHERE deleted_at IS NOT NULL AND deleted_at <= ?1
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let removed = sqlx::query(
            "DELETE FROM events WHERE deleted_at IS NOT NULL AND deleted_at <= ?1",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(removed)
    }

    async fn stats(&self) -> StorageResult<StoreStats> {
        let (events, pending): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN deleted_at IS NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN deleted_at IS NOT NULL THEN 1 ELSE 0 END), 0)
            FROM events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let tombstones: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tombstones")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStats {
            events: events as u64,
            tombstones: tombstones as u64,
            pending_compaction: pending as u64,
        })
    }
}

fn to_sql_time(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn non_empty<T>(set: &Option<BTreeSet<T>>) -> Option<&BTreeSet<T>> {
    set.as_ref().filter(|s| !s.is_empty())
}

/// Append `(cond AND cond ...)` for one filter.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) {
    qb.push("(1 = 1");

    if let Some(ids) = non_empty(&filter.ids) {
        qb.push(" AND e.id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id.as_bytes().to_vec());
        }
        sep.push_unseparated(")");
    }
    if let Some(authors) = non_empty(&filter.authors) {
        qb.push(" AND e.pubkey IN (");
        let mut sep = qb.separated(", ");
        for pk in authors {
            sep.push_bind(pk.as_bytes().to_vec());
        }
        sep.push_unseparated(")");
    }
    if let Some(kinds) = non_empty(&filter.kinds) {
        qb.push(" AND e.kind IN (");
        let mut sep = qb.separated(", ");
        for kind in kinds {
            sep.push_bind(i64::from(*kind));
        }
        sep.push_unseparated(")");
    }
    if let Some(since) = filter.since {
        qb.push(" AND e.created_at >= ").push_bind(to_sql_time(since));
    }
    if let Some(until) = filter.until {
        qb.push(" AND e.created_at <= ").push_bind(to_sql_time(until));
    }
    for (key, values) in &filter.tags {
        if values.is_empty() {
            continue;
        }
        qb.push(" AND EXISTS (SELECT 1 FROM tags t WHERE t.event_id = e.id AND t.name = ")
            .push_bind(key.to_string())
            .push(" AND t.value IN (");
        let mut sep = qb.separated(", ");
        for value in values {
            sep.push_bind(value.clone());
        }
        sep.push_unseparated("))");
    }

    qb.push(")");
}

async fn insert_event(conn: &mut SqliteConnection, event: &Event) -> StorageResult<()> {
    let d_tag = event.is_addressable().then(|| event.identifier().to_string());
    sqlx::query(
        r#"
        INSERT INTO events (id, pubkey, created_at, kind, d_tag, raw)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(event.id.as_bytes().as_slice())
    .bind(event.pubkey.as_bytes().as_slice())
    .bind(to_sql_time(event.created_at))
    .bind(i64::from(event.kind))
    .bind(d_tag)
    .bind(event.to_json())
    .execute(&mut *conn)
    .await?;

    for (name, value) in event.indexed_tags() {
        sqlx::query("INSERT INTO tags (event_id, name, value) VALUES (?1, ?2, ?3)")
            .bind(event.id.as_bytes().as_slice())
            .bind(name.to_string())
            .bind(value)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn tombstone(
    conn: &mut SqliteConnection,
    id: &[u8],
    deletion: &Event,
    now: i64,
) -> StorageResult<u64> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO tombstones (event_id, pubkey, deleted_by, deleted_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(id)
    .bind(deletion.pubkey.as_bytes().as_slice())
    .bind(deletion.id.as_bytes().as_slice())
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let updated = sqlx::query(
        "UPDATE events SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(updated)
}

/// Tombstone what `deletion` references, restricted to its own author.
async fn apply_deletion(
    conn: &mut SqliteConnection,
    targets: &[EventId],
    coordinates: &[Coordinate],
    deletion: &Event,
    now: i64,
) -> StorageResult<u64> {
    let author = deletion.pubkey.as_bytes().as_slice();
    let mut removed = 0;

    for target in targets {
        if *target == deletion.id {
            continue;
        }
        let stored_author: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT pubkey FROM events WHERE id = ?1")
                .bind(target.as_bytes().as_slice())
                .fetch_optional(&mut *conn)
                .await?;

        match stored_author {
            Some(pk) if pk.as_slice() != author => {
                tracing::debug!(event_id = %target, by = %deletion.pubkey, "ignoring deletion of foreign event");
            }
            // Unknown ids are tombstoned for this author only, so the
            // target can never be stored later under the same author.
            _ => removed += tombstone(conn, target.as_bytes(), deletion, now).await?,
        }
    }

    for coordinate in coordinates {
        if coordinate.pubkey != deletion.pubkey {
            continue;
        }
        // Covers versions this store has not seen yet.
        sqlx::query(
            r#"
            INSERT INTO coordinate_tombstones (pubkey, kind, d_tag, deleted_until, deleted_by)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (pubkey, kind, d_tag) DO UPDATE SET
                deleted_until = excluded.deleted_until,
                deleted_by = excluded.deleted_by
            WHERE excluded.deleted_until > coordinate_tombstones.deleted_until
            "#,
        )
        .bind(author)
        .bind(i64::from(coordinate.kind))
        .bind(coordinate.identifier.as_str())
        .bind(to_sql_time(deletion.created_at))
        .bind(deletion.id.as_bytes().as_slice())
        .execute(&mut *conn)
        .await?;

        let ids: Vec<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT id FROM events
            WHERE pubkey = ?1 AND kind = ?2 AND COALESCE(d_tag, '') = ?3
              AND created_at <= ?4 AND deleted_at IS NULL
            "#,
        )
        .bind(author)
        .bind(i64::from(coordinate.kind))
        .bind(coordinate.identifier.as_str())
        .bind(to_sql_time(deletion.created_at))
        .fetch_all(&mut *conn)
        .await?;

        for id in ids {
            removed += tombstone(conn, &id, deletion, now).await?;
        }
    }

    Ok(removed)
}

/// Internal row type for SQLite queries.
#[derive(sqlx::FromRow)]
struct EventRow {
    id: Vec<u8>,
    raw: String,
}

impl TryFrom<EventRow> for Event {
    type Error = StorageError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StorageError::Corrupt {
            id: hex::encode(&row.id),
            reason,
        };
        let event: Event = serde_json::from_str(&row.raw).map_err(|e| corrupt(e.to_string()))?;
        if event.id.as_bytes().as_slice() != row.id.as_slice() {
            return Err(corrupt("stored body does not match row id".into()));
        }
        Ok(event)
    }
}
