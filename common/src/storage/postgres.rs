//! Storage over a PostgreSQL-compatible database.
//!
//! Records live in a single `pathdata (bucket, fullpath, metadata)` table whose
//! primary key is `(bucket, fullpath)`. The statements only use syntax shared
//! by PostgreSQL and CockroachDB.

use std::ops::Bound::{self, Excluded, Included, Unbounded};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};

use super::config::PostgresStorageConfig;
use super::{ScanOrder, Storage, Transaction};
use crate::{BytesRange, Record, StorageError, StorageIterator, StorageRead, StorageResult};

const GET: &str = "SELECT metadata FROM pathdata WHERE bucket = $1::BYTEA AND fullpath = $2::BYTEA";

const GET_MANY: &str = "
    SELECT metadata
    FROM pathdata pd
        RIGHT JOIN
            unnest($2::BYTEA[]) WITH ORDINALITY pk(request, ord)
        ON (pd.fullpath = pk.request AND pd.bucket = $1::BYTEA)
    ORDER BY pk.ord
";

const PUT: &str = "
    INSERT INTO pathdata (bucket, fullpath, metadata)
        VALUES ($1::BYTEA, $2::BYTEA, $3::BYTEA)
        ON CONFLICT (bucket, fullpath) DO UPDATE SET metadata = EXCLUDED.metadata
";

const INSERT_IF_ABSENT: &str = "
    INSERT INTO pathdata (bucket, fullpath, metadata)
        VALUES ($1::BYTEA, $2::BYTEA, $3::BYTEA)
        ON CONFLICT DO NOTHING
";

const DELETE: &str = "DELETE FROM pathdata WHERE bucket = $1::BYTEA AND fullpath = $2::BYTEA";

const UPDATE_IF_VALUE: &str = "
    UPDATE pathdata
        SET metadata = $4::BYTEA
        WHERE pathdata.metadata = $3::BYTEA
            AND pathdata.bucket = $1::BYTEA
            AND pathdata.fullpath = $2::BYTEA
";

const DELETE_IF_VALUE: &str = "
    DELETE FROM pathdata
        WHERE pathdata.metadata = $3::BYTEA
            AND pathdata.bucket = $1::BYTEA
            AND pathdata.fullpath = $2::BYTEA
";

const BEGIN: &str = "BEGIN ISOLATION LEVEL SERIALIZABLE";

/// Maps driver errors, classifying serialization failures (SQLSTATE 40001) as
/// [`StorageError::Conflict`].
fn map_error(err: tokio_postgres::Error) -> StorageError {
    if err.code() == Some(&SqlState::T_R_SERIALIZATION_FAILURE) {
        StorageError::Conflict(err.to_string())
    } else {
        StorageError::Storage(err.to_string())
    }
}

async fn connect(url: &str) -> StorageResult<Client> {
    let (client, connection) = tokio_postgres::connect(url, NoTls)
        .await
        .map_err(|e| StorageError::Storage(format!("Failed to connect to database: {}", e)))?;

    // The connection object drives the socket; it must be polled for the
    // client to make progress.
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!("Connection error: {}", e);
        }
    });

    Ok(client)
}

/// Storage backed by a fixed set of connections to a PostgreSQL-compatible
/// database.
///
/// Each operation checks out one connection for its duration. A connection
/// closed by the server is re-established on its next checkout.
pub struct PostgresStorage {
    url: String,
    slots: Vec<Slot>,
    next: AtomicUsize,
    closed: AtomicBool,
}

/// One pooled connection.
struct Slot {
    client: Arc<Mutex<Client>>,
    /// Set when the connection was left inside an unfinished transaction it
    /// could not roll back; the next checkout replaces it.
    reset: Arc<AtomicBool>,
}

impl PostgresStorage {
    /// Opens `config.connections` connections (at least one).
    pub async fn connect(config: &PostgresStorageConfig) -> StorageResult<Self> {
        let count = config.connections.max(1);
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(Slot {
                client: Arc::new(Mutex::new(connect(&config.url).await?)),
                reset: Arc::new(AtomicBool::new(false)),
            });
        }
        tracing::debug!(connections = count, "connected to database");
        Ok(Self {
            url: config.url.clone(),
            slots,
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    async fn acquire(&self) -> StorageResult<OwnedMutexGuard<Client>> {
        let (conn, _) = self.checkout().await?;
        Ok(conn)
    }

    /// Checks out an idle connection if there is one, otherwise waits for
    /// the next one in turn.
    async fn checkout(&self) -> StorageResult<(OwnedMutexGuard<Client>, Arc<AtomicBool>)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Storage("storage is closed".to_string()));
        }
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        let count = self.slots.len();
        let idle = (0..count).map(|i| (ticket + i) % count).find_map(|slot| {
            Arc::clone(&self.slots[slot].client)
                .try_lock_owned()
                .ok()
                .map(|conn| (slot, conn))
        });
        let (slot, mut conn) = match idle {
            Some(idle) => idle,
            None => {
                let slot = ticket % count;
                (slot, Arc::clone(&self.slots[slot].client).lock_owned().await)
            }
        };

        let reset = Arc::clone(&self.slots[slot].reset);
        if conn.is_closed() || reset.swap(false, Ordering::AcqRel) {
            tracing::debug!(slot, "reconnecting");
            *conn = connect(&self.url).await?;
        }
        Ok((conn, reset))
    }
}

fn bound_key(bound: &Bound<Bytes>) -> Option<&[u8]> {
    match bound {
        Included(key) | Excluded(key) => Some(key.as_ref()),
        Unbounded => None,
    }
}

/// Builds the range scan statement. Parameters are, in order: bucket, the
/// lower bound key (if bounded), the upper bound key (if bounded), the limit.
fn scan_statement(range: &BytesRange, order: ScanOrder) -> String {
    let mut sql =
        String::from("SELECT fullpath, metadata FROM pathdata WHERE bucket = $1::BYTEA");
    let mut param = 2;

    let lower = match range.start {
        Included(_) => Some(">="),
        Excluded(_) => Some(">"),
        Unbounded => None,
    };
    if let Some(op) = lower {
        sql.push_str(&format!(" AND fullpath {} ${}::BYTEA", op, param));
        param += 1;
    }

    let upper = match range.end {
        Included(_) => Some("<="),
        Excluded(_) => Some("<"),
        Unbounded => None,
    };
    if let Some(op) = upper {
        sql.push_str(&format!(" AND fullpath {} ${}::BYTEA", op, param));
        param += 1;
    }

    match order {
        ScanOrder::Ascending => sql.push_str(" ORDER BY fullpath ASC"),
        ScanOrder::Descending => sql.push_str(" ORDER BY fullpath DESC"),
    }
    sql.push_str(&format!(" LIMIT ${}", param));
    sql
}

#[async_trait]
impl StorageRead for PostgresStorage {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, bucket: &[u8], key: &[u8]) -> StorageResult<Option<Bytes>> {
        let conn = self.acquire().await?;
        let row = conn.query_opt(GET, &[&bucket, &key]).await.map_err(map_error)?;
        row.map(|row| row.try_get::<_, Vec<u8>>(0).map(Bytes::from))
            .transpose()
            .map_err(map_error)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn get_many(&self, bucket: &[u8], keys: &[Bytes]) -> StorageResult<Vec<Option<Bytes>>> {
        let requested: Vec<&[u8]> = keys.iter().map(|key| key.as_ref()).collect();
        let conn = self.acquire().await?;
        let rows = conn
            .query(GET_MANY, &[&bucket, &requested])
            .await
            .map_err(map_error)?;
        rows.iter()
            .map(|row| {
                row.try_get::<_, Option<Vec<u8>>>(0)
                    .map(|value| value.map(Bytes::from))
                    .map_err(map_error)
            })
            .collect()
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn scan_iter(
        &self,
        bucket: &[u8],
        range: BytesRange,
        order: ScanOrder,
        limit: usize,
    ) -> StorageResult<Box<dyn StorageIterator + Send + 'static>> {
        if range.is_empty() || limit == 0 {
            return Ok(Box::new(PostgresBatch::default()));
        }

        let sql = scan_statement(&range, order);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let lower = bound_key(&range.start);
        let upper = bound_key(&range.end);

        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(4);
        params.push(&bucket);
        if let Some(key) = &lower {
            params.push(key);
        }
        if let Some(key) = &upper {
            params.push(key);
        }
        params.push(&limit);

        let conn = self.acquire().await?;
        let rows = conn.query(sql.as_str(), &params).await.map_err(map_error)?;
        let records = rows
            .iter()
            .map(|row| {
                let key: Vec<u8> = row.try_get(0).map_err(map_error)?;
                let value: Vec<u8> = row.try_get(1).map_err(map_error)?;
                Ok(Record::new(Bytes::from(key), Bytes::from(value)))
            })
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(Box::new(PostgresBatch {
            records: records.into_iter(),
        }))
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn put(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> StorageResult<()> {
        let conn = self.acquire().await?;
        conn.execute(PUT, &[&bucket, &key, &value])
            .await
            .map_err(map_error)?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn insert_if_absent(
        &self,
        bucket: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> StorageResult<bool> {
        let conn = self.acquire().await?;
        let inserted = conn
            .execute(INSERT_IF_ABSENT, &[&bucket, &key, &value])
            .await
            .map_err(map_error)?;
        Ok(inserted == 1)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn delete(&self, bucket: &[u8], key: &[u8]) -> StorageResult<u64> {
        let conn = self.acquire().await?;
        conn.execute(DELETE, &[&bucket, &key])
            .await
            .map_err(map_error)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn begin(&self) -> StorageResult<Box<dyn Transaction>> {
        let (conn, reset) = self.checkout().await?;
        conn.batch_execute(BEGIN).await.map_err(map_error)?;
        Ok(Box::new(PostgresTransaction {
            conn: Some(conn),
            reset,
        }))
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// One fully fetched scan batch. The connection is released as soon as the
/// batch has been read, so closing has nothing left to free.
#[derive(Default)]
struct PostgresBatch {
    records: std::vec::IntoIter<Record>,
}

#[async_trait]
impl StorageIterator for PostgresBatch {
    async fn next(&mut self) -> StorageResult<Option<Record>> {
        Ok(self.records.next())
    }
}

/// A transaction pinned to one connection until commit or rollback.
struct PostgresTransaction {
    conn: Option<OwnedMutexGuard<Client>>,
    reset: Arc<AtomicBool>,
}

impl PostgresTransaction {
    fn client(&self) -> StorageResult<&Client> {
        self.conn
            .as_deref()
            .ok_or_else(|| StorageError::Internal("transaction already finished".to_string()))
    }

    async fn finish(&mut self, statement: &str) -> StorageResult<()> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| StorageError::Internal("transaction already finished".to_string()))?;
        conn.batch_execute(statement).await.map_err(map_error)
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        // Abandoned mid-flight (e.g. the caller's future was cancelled): roll
        // back before the connection can be checked out again.
        if let Some(conn) = self.conn.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let reset = Arc::clone(&self.reset);
                    handle.spawn(async move {
                        if let Err(e) = conn.batch_execute("ROLLBACK").await {
                            tracing::warn!("Failed to roll back abandoned transaction: {}", e);
                            reset.store(true, Ordering::Release);
                        }
                    });
                }
                Err(_) => {
                    tracing::warn!("Transaction dropped outside a runtime; discarding its connection");
                    self.reset.store(true, Ordering::Release);
                }
            }
        }
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&mut self, bucket: &[u8], key: &[u8]) -> StorageResult<Option<Bytes>> {
        let row = self
            .client()?
            .query_opt(GET, &[&bucket, &key])
            .await
            .map_err(map_error)?;
        row.map(|row| row.try_get::<_, Vec<u8>>(0).map(Bytes::from))
            .transpose()
            .map_err(map_error)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn update_if_value(
        &mut self,
        bucket: &[u8],
        key: &[u8],
        expected: &[u8],
        value: &[u8],
    ) -> StorageResult<u64> {
        self.client()?
            .execute(UPDATE_IF_VALUE, &[&bucket, &key, &expected, &value])
            .await
            .map_err(map_error)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn delete_if_value(
        &mut self,
        bucket: &[u8],
        key: &[u8],
        expected: &[u8],
    ) -> StorageResult<u64> {
        self.client()?
            .execute(DELETE_IF_VALUE, &[&bucket, &key, &expected])
            .await
            .map_err(map_error)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let mut this = self;
        this.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        let mut this = self;
        this.finish("ROLLBACK").await
    }
}
