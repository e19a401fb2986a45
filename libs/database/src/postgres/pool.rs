//! Bounded async connection pool for a single PostgreSQL endpoint.
//!
//! The pool grows on demand up to `max_size`; when every connection is in
//! use, `acquire` queues the caller FIFO until a slot frees up or the
//! acquisition timeout elapses. Broken connections are discarded on return
//! and replaced lazily.

use std::time::{Duration, Instant};

use async_stream::try_stream;
use bytes::Bytes;
use deadpool::managed::{Hook, HookError};
use deadpool_postgres::{Manager, ManagerConfig, Object, PoolError, RecyclingMethod, Runtime, Timeouts};
use futures::{SinkExt, Stream};
use health::HealthResult;
use tokio_postgres::types::{FromSqlOwned, ToSql};
use tokio_postgres::{NoTls, Row, Transaction};
use tracing::{debug, info};

use super::config::PoolConfig;
use crate::common::{DatabaseError, DatabaseResult};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl From<IsolationLevel> for tokio_postgres::IsolationLevel {
    fn from(level: IsolationLevel) -> Self {
        match level {
            IsolationLevel::ReadUncommitted => Self::ReadUncommitted,
            IsolationLevel::ReadCommitted => Self::ReadCommitted,
            IsolationLevel::RepeatableRead => Self::RepeatableRead,
            IsolationLevel::Serializable => Self::Serializable,
        }
    }
}

/// Options for [`PoolClient::transaction`].
#[derive(Debug, Clone, Copy)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub readonly: bool,
    pub deferrable: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            readonly: false,
            deferrable: false,
        }
    }
}

/// Options for [`Pool::cursor`].
#[derive(Debug, Clone, Copy)]
pub struct CursorOptions {
    /// Rows fetched from the portal per round trip.
    pub prefetch: i32,
    /// Per-batch deadline; defaults to the pool-wide command timeout.
    pub timeout: Option<Duration>,
    pub isolation: IsolationLevel,
    pub readonly: bool,
    pub deferrable: bool,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            prefetch: 50,
            timeout: None,
            isolation: IsolationLevel::ReadCommitted,
            readonly: false,
            deferrable: false,
        }
    }
}

/// A connection borrowed from the pool.
///
/// Dropping the client returns the connection; a connection found closed on
/// return is discarded instead of being handed to the next borrower.
pub struct PoolClient {
    inner: Object,
}

impl std::ops::Deref for PoolClient {
    type Target = deadpool_postgres::ClientWrapper;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl std::ops::DerefMut for PoolClient {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl PoolClient {
    /// Start a transaction on this connection.
    ///
    /// Commits on [`Transaction::commit`]; rolls back when the transaction
    /// is dropped without committing, including on every failure path.
    pub async fn transaction(
        &mut self,
        options: TransactionOptions,
    ) -> DatabaseResult<Transaction<'_>> {
        let client: &mut tokio_postgres::Client = &mut self.inner;

        let mut builder = client
            .build_transaction()
            .isolation_level(options.isolation.into());
        if options.readonly {
            builder = builder.read_only(true);
        }
        if options.deferrable {
            builder = builder.deferrable(true);
        }

        Ok(builder.start().await?)
    }
}

/// Async connection pool for a single PostgreSQL database.
///
/// For primary/replica topology use [`super::Cluster`], which wraps multiple
/// `Pool` instances with explicit routing.
pub struct Pool {
    config: PoolConfig,
    inner: tokio::sync::RwLock<Option<deadpool_postgres::Pool>>,
}

impl Pool {
    /// Create an uninitialized pool after validating the config.
    pub fn new(config: PoolConfig) -> DatabaseResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: tokio::sync::RwLock::new(None),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Initialize the pool. Idempotent; concurrent callers are serialized by
    /// the write lock so only one pool is ever created.
    ///
    /// On success the pool holds `min_size` connections, each proven with a
    /// round trip.
    pub async fn initialize(&self) -> DatabaseResult<()> {
        let mut guard = self.inner.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let pool = self.build_pool()?;

        // Hold all min_size connections at once so distinct connections are
        // established rather than one being revalidated repeatedly.
        let mut validated = Vec::with_capacity(self.config.pool.min_size as usize);
        for _ in 0..self.config.pool.min_size {
            let client = pool
                .get()
                .await
                .map_err(|e| map_pool_error(e, self.config.pool.acquire_timeout))?;
            client.simple_query("SELECT 1").await?;
            validated.push(client);
        }
        drop(validated);

        *guard = Some(pool);
        info!(
            host = %self.config.connection.host,
            port = self.config.connection.port,
            database = %self.config.connection.database,
            min_size = self.config.pool.min_size,
            max_size = self.config.pool.max_size,
            "Connection pool initialized"
        );
        Ok(())
    }

    /// Close the pool and drop all connections. Idempotent; the pool flips
    /// back to uninitialized.
    pub async fn close(&self) {
        let mut guard = self.inner.write().await;
        if let Some(pool) = guard.take() {
            pool.close();
            info!("Connection pool closed");
        }
    }

    /// Borrow and validate `min_size` connections, then release them.
    ///
    /// Call during startup to eliminate first-request latency. Initializes
    /// the pool first when needed.
    pub async fn warmup(&self) -> DatabaseResult<()> {
        if self.inner.read().await.is_none() {
            self.initialize().await?;
        }

        let pool = self.handle().await?;
        let target = self.config.pool.min_size;
        let mut held = Vec::with_capacity(target as usize);
        for _ in 0..target {
            let client = pool
                .get()
                .await
                .map_err(|e| map_pool_error(e, self.config.pool.acquire_timeout))?;
            client.simple_query("SELECT 1").await?;
            held.push(client);
        }
        drop(held);

        info!(connections = target, "Pool warmup completed");
        Ok(())
    }

    /// Acquire a connection, waiting up to the configured acquisition
    /// timeout when the pool is at `max_size` with every connection in use.
    /// Waiters are served in FIFO order.
    pub async fn acquire(&self) -> DatabaseResult<PoolClient> {
        self.acquire_timeout(self.config.pool.acquire_timeout).await
    }

    /// Acquire with an explicit timeout overriding the pool-wide one.
    pub async fn acquire_timeout(&self, timeout: Duration) -> DatabaseResult<PoolClient> {
        let pool = self.handle().await?;
        let timeouts = Timeouts {
            wait: Some(timeout),
            create: Some(timeout),
            recycle: Some(timeout),
        };
        let inner = pool
            .timeout_get(&timeouts)
            .await
            .map_err(|e| map_pool_error(e, timeout))?;
        Ok(PoolClient { inner })
    }

    /// Execute a statement and return the number of rows affected.
    pub async fn execute(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
        timeout: Option<Duration>,
    ) -> DatabaseResult<u64> {
        let client = self.acquire().await?;
        let limit = timeout.unwrap_or(self.config.pool.command_timeout);

        let work = async {
            let stmt = self.prepared(&client, query).await?;
            let pg: &tokio_postgres::Client = &client;
            pg.execute(&stmt, params).await
        };
        self.bounded(limit, work).await
    }

    /// Execute a statement once per parameter set.
    pub async fn execute_many(
        &self,
        query: &str,
        batches: &[&[&(dyn ToSql + Sync)]],
        timeout: Option<Duration>,
    ) -> DatabaseResult<()> {
        let client = self.acquire().await?;
        let limit = timeout.unwrap_or(self.config.pool.command_timeout);

        let work = async {
            let stmt = self.prepared(&client, query).await?;
            let pg: &tokio_postgres::Client = &client;
            for &params in batches {
                pg.execute(&stmt, params).await?;
            }
            Ok(())
        };
        self.bounded(limit, work).await
    }

    /// Fetch all rows.
    pub async fn fetch(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
        timeout: Option<Duration>,
    ) -> DatabaseResult<Vec<Row>> {
        let client = self.acquire().await?;
        let limit = timeout.unwrap_or(self.config.pool.command_timeout);

        let work = async {
            let stmt = self.prepared(&client, query).await?;
            let pg: &tokio_postgres::Client = &client;
            pg.query(&stmt, params).await
        };
        self.bounded(limit, work).await
    }

    /// Fetch the first row, or `None` when the query returns nothing.
    pub async fn fetch_row(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
        timeout: Option<Duration>,
    ) -> DatabaseResult<Option<Row>> {
        let client = self.acquire().await?;
        let limit = timeout.unwrap_or(self.config.pool.command_timeout);

        let work = async {
            let stmt = self.prepared(&client, query).await?;
            let pg: &tokio_postgres::Client = &client;
            pg.query_opt(&stmt, params).await
        };
        self.bounded(limit, work).await
    }

    /// Fetch the first column of the first row, or `None` when the query
    /// returns nothing.
    pub async fn fetch_value<T: FromSqlOwned>(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
        timeout: Option<Duration>,
    ) -> DatabaseResult<Option<T>> {
        let row = self.fetch_row(query, params, timeout).await?;
        match row {
            Some(row) => Ok(Some(row.try_get(0)?)),
            None => Ok(None),
        }
    }

    /// Bulk-load records via `COPY ... FROM STDIN`. `None` fields become SQL
    /// NULL. Returns the number of rows copied.
    pub async fn copy_records_to_table(
        &self,
        table: &str,
        columns: &[&str],
        records: &[Vec<Option<String>>],
        timeout: Option<Duration>,
    ) -> DatabaseResult<u64> {
        let client = self.acquire().await?;
        let limit = timeout.unwrap_or(self.config.pool.command_timeout);

        let column_list = columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        let statement = format!("COPY {} ({}) FROM STDIN", quote_ident(table), column_list);

        let work = async {
            let pg: &tokio_postgres::Client = &client;
            let sink = pg.copy_in::<_, Bytes>(statement.as_str()).await?;
            futures::pin_mut!(sink);

            let mut buffer = String::new();
            for record in records {
                for (i, field) in record.iter().enumerate() {
                    if i > 0 {
                        buffer.push('\t');
                    }
                    match field {
                        Some(value) => push_copy_escaped(&mut buffer, value),
                        None => buffer.push_str("\\N"),
                    }
                }
                buffer.push('\n');
            }

            sink.send(Bytes::from(buffer)).await?;
            sink.finish().await
        };
        self.bounded(limit, work).await
    }

    /// Run a query through a server-side portal and stream the rows lazily,
    /// `prefetch` rows per round trip, inside an implicit transaction.
    ///
    /// The stream is finite and non-restartable. Dropping it early releases
    /// the portal and rolls the transaction back; the connection returns to
    /// the pool either way.
    pub fn cursor(
        &self,
        query: String,
        params: Vec<Box<dyn ToSql + Sync + Send>>,
        options: CursorOptions,
    ) -> impl Stream<Item = DatabaseResult<Row>> + '_ {
        try_stream! {
            let pool = self.handle().await?;
            let mut client = pool
                .get()
                .await
                .map_err(|e| map_pool_error(e, self.config.pool.acquire_timeout))?;
            let pg: &mut tokio_postgres::Client = &mut client;

            let mut builder = pg
                .build_transaction()
                .isolation_level(options.isolation.into());
            if options.readonly {
                builder = builder.read_only(true);
            }
            if options.deferrable {
                builder = builder.deferrable(true);
            }
            let txn = builder.start().await.map_err(DatabaseError::from)?;

            let limit = options.timeout.unwrap_or(self.config.pool.command_timeout);
            let stmt = txn.prepare(&query).await.map_err(DatabaseError::from)?;
            let portal = txn
                .bind_raw(&stmt, params)
                .await
                .map_err(DatabaseError::from)?;

            loop {
                let batch =
                    match tokio::time::timeout(limit, txn.query_portal(&portal, options.prefetch))
                        .await
                    {
                        Ok(rows) => rows.map_err(DatabaseError::from)?,
                        Err(_) => Err(DatabaseError::QueryTimeout { elapsed: limit })?,
                    };

                let exhausted = (batch.len() as i32) < options.prefetch;
                for row in batch {
                    yield row;
                }
                if exhausted {
                    break;
                }
            }

            txn.commit().await.map_err(DatabaseError::from)?;
        }
    }

    /// Probe the pool with a round trip.
    pub async fn health_check(&self) -> HealthResult {
        let max_size = self.config.pool.max_size;
        let pool = match self.inner.read().await.clone() {
            Some(pool) => pool,
            None => return HealthResult::initializing(max_size),
        };

        let started = Instant::now();
        let client = match pool.get().await {
            Ok(client) => client,
            Err(e) => return HealthResult::unhealthy(max_size, e.to_string()),
        };
        if let Err(e) = client.simple_query("SELECT 1").await {
            return HealthResult::unhealthy(max_size, e.to_string());
        }
        let latency = started.elapsed().as_secs_f64();
        drop(client);

        let status = pool.status();
        HealthResult::healthy(
            status.size as u32,
            max_size,
            status.available as u32,
            latency,
        )
    }

    /// Current number of connections, 0 when uninitialized.
    pub async fn pool_size(&self) -> u32 {
        match self.inner.read().await.as_ref() {
            Some(pool) => pool.status().size as u32,
            None => 0,
        }
    }

    /// Current number of idle connections, 0 when uninitialized.
    pub async fn pool_idle_size(&self) -> u32 {
        match self.inner.read().await.as_ref() {
            Some(pool) => pool.status().available as u32,
            None => 0,
        }
    }

    pub fn pool_min_size(&self) -> u32 {
        self.config.pool.min_size
    }

    pub fn pool_max_size(&self) -> u32 {
        self.config.pool.max_size
    }

    async fn handle(&self) -> DatabaseResult<deadpool_postgres::Pool> {
        self.inner
            .read()
            .await
            .clone()
            .ok_or(DatabaseError::NotInitialized)
    }

    fn build_pool(&self) -> DatabaseResult<deadpool_postgres::Pool> {
        let manager = Manager::from_config(
            self.config.driver_config(),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let acquire = self.config.pool.acquire_timeout;
        let timeouts = Timeouts {
            wait: Some(acquire),
            create: Some(acquire),
            recycle: Some(acquire),
        };

        let lifetime = self.config.pool.max_inactive_connection_lifetime;
        let mut builder = deadpool_postgres::Pool::builder(manager)
            .max_size(self.config.pool.max_size as usize)
            .timeouts(timeouts)
            .runtime(Runtime::Tokio1);

        if !lifetime.is_zero() {
            builder = builder.pre_recycle(Hook::sync_fn(move |_client, metrics| {
                if metrics.last_used() > lifetime {
                    return Err(HookError::message("idle connection lifetime exceeded"));
                }
                Ok(())
            }));
        }

        builder
            .build()
            .map_err(|e| DatabaseError::Pool(e.to_string()))
    }

    async fn prepared(
        &self,
        client: &PoolClient,
        query: &str,
    ) -> Result<tokio_postgres::Statement, tokio_postgres::Error> {
        let cache_size = self.config.statement_cache.max_size;
        if cache_size == 0 {
            let pg: &tokio_postgres::Client = client;
            return pg.prepare(query).await;
        }

        let stmt = client.prepare_cached(query).await?;
        if client.statement_cache.size() > cache_size {
            debug!(cache_size, "Statement cache overflow, clearing");
            client.statement_cache.clear();
        }
        Ok(stmt)
    }

    async fn bounded<T>(
        &self,
        limit: Duration,
        work: impl Future<Output = Result<T, tokio_postgres::Error>>,
    ) -> DatabaseResult<T> {
        match tokio::time::timeout(limit, work).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(DatabaseError::QueryTimeout { elapsed: limit }),
        }
    }
}

fn map_pool_error(error: PoolError, waited: Duration) -> DatabaseError {
    match error {
        PoolError::Timeout(_) => DatabaseError::AcquireTimeout { waited },
        PoolError::Backend(e) => DatabaseError::Postgres(e),
        other => DatabaseError::Pool(other.to_string()),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn push_copy_escaped(buffer: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '\\' => buffer.push_str("\\\\"),
            '\t' => buffer.push_str("\\t"),
            '\n' => buffer.push_str("\\n"),
            '\r' => buffer.push_str("\\r"),
            other => buffer.push(other),
        }
    }
}
