//! # Write Coalescer and Batch Append Executor
//!
//! Many producers submit appends concurrently; one consumer drains whatever is
//! queued and writes it as a batch. Each producer suspends until its own
//! request is settled, so per-producer latency does not depend on batch size.
//!
//! ```text
//!  producer ─┐
//!  producer ─┼──► mpsc queue ──► drain loop (one thread) ──► BatchWriter::execute_batch
//!  producer ─┘        ▲                                              │
//!                     └──────── oneshot per request ◄────────────────┘
//! ```
//!
//! ## Executing a Batch
//!
//! ```text
//! resolve(min ts) covers max ts?
//!   ├─ yes ─► fast path: one transaction for the whole batch
//!   └─ no  ─► slow path: resolve every row, group by table,
//!             one transaction per group
//!
//! transaction fails (insert or commit)?
//!   └─► roll back, re-run each row on its own in autocommit,
//!       deliver each row's own outcome to its own handle
//! ```
//!
//! A poisoned row therefore costs its batch-mates one redundant insert but
//! never their result.
//!
//! ## Outcomes
//!
//! - `Ok(true)`: row inserted
//! - `Ok(false)`: idempotent duplicate (`ON CONFLICT DO NOTHING` affected 0 rows)
//! - `Err(_)`: this row failed (constraint, routing, storage)
//!
//! ## Invariants
//!
//! - Exactly one drain executes at a time
//! - Every accepted request is settled exactly once, including across shutdown
//! - Requests accepted into a drain run to completion; there is no cancellation

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rusqlite::{params, Connection, Statement, TransactionBehavior};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::router::{group_by_table, resolve_each, ShardGroup, TableRouter};
use crate::schema::quote_ident;
use crate::types::{EventRecord, StateKey, SubTable, Timestamp};

// =============================================================================
// Configuration
// =============================================================================

/// Maximum requests per drain.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 1000;

/// Capacity of the request queue. Producers suspend when it is full.
pub const DEFAULT_CHANNEL_SIZE: usize = 4096;

/// Configuration for the write coalescer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum requests taken by one drain.
    pub batch_max_size: usize,

    /// How long a drain keeps collecting after its first request.
    ///
    /// Zero takes exactly what is already queued.
    pub batch_linger: Duration,

    /// Capacity of the request queue.
    pub channel_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            batch_linger: Duration::ZERO,
            channel_size: DEFAULT_CHANNEL_SIZE,
        }
    }
}

impl WriterConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_max_size == 0 {
            return Err(Error::Config("batch_max_size must be at least 1".to_string()));
        }
        if self.channel_size == 0 {
            return Err(Error::Config("channel_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Rows and Statements
// =============================================================================

/// An event record flattened into the column values of a sub-table row.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    pub state_id: String,
    pub unique_id: String,
    pub type_code: String,
    pub data: Vec<u8>,
    pub version: i64,
    pub timestamp: Timestamp,
}

impl InsertRow {
    /// Flattens a record, stringifying its key.
    pub fn from_record<K: StateKey>(record: EventRecord<K>) -> Self {
        Self {
            state_id: record.state_id.to_key_string(),
            unique_id: record.unique_id.as_str().to_string(),
            type_code: record.type_code.as_str().to_string(),
            data: record.data,
            version: record.version.as_raw(),
            timestamp: record.timestamp,
        }
    }

    /// Runs a prepared insert for this row and reports whether it was stored.
    fn insert(&self, stmt: &mut Statement<'_>) -> Result<bool> {
        let affected = stmt.execute(params![
            self.state_id,
            self.unique_id,
            self.type_code,
            self.data,
            self.version,
            self.timestamp.as_millis(),
        ])?;
        Ok(affected == 1)
    }
}

/// Returns the idempotent insert statement for one sub-table.
pub fn insert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {} (state_id, unique_id, type_code, data, version, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT DO NOTHING",
        quote_ident(table)
    )
}

/// Process-wide cache of insert statements keyed by table name.
///
/// Built lazily with insert-if-absent. Two callers may render the same
/// table's statement at once; the text is a pure function of the name, so the
/// map keeps whichever lands first and both are correct.
#[derive(Debug, Default)]
pub struct InsertStatements {
    by_table: DashMap<String, Arc<str>>,
}

impl InsertStatements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached insert statement for `table`, rendering it on first use.
    pub fn get(&self, table: &str) -> Arc<str> {
        if let Some(sql) = self.by_table.get(table) {
            return Arc::clone(sql.value());
        }

        let sql: Arc<str> = insert_statement(table).into();
        Arc::clone(self.by_table.entry(table.to_string()).or_insert(sql).value())
    }

    /// Number of tables with a cached statement.
    pub fn len(&self) -> usize {
        self.by_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_table.is_empty()
    }
}

/// Inserts `rows` inside one immediate transaction.
///
/// Any failure drops the transaction, which rolls it back.
fn insert_group<'a>(
    conn: &mut Connection,
    sql: &str,
    rows: impl Iterator<Item = &'a InsertRow>,
) -> Result<Vec<bool>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut outcomes = Vec::new();
    {
        let mut stmt = tx.prepare_cached(sql)?;
        for row in rows {
            outcomes.push(row.insert(&mut stmt)?);
        }
    }
    tx.commit()?;
    Ok(outcomes)
}

/// Inserts one row outside any shared transaction.
fn insert_single(conn: &Connection, sql: &str, row: &InsertRow) -> Result<bool> {
    let mut stmt = conn.prepare_cached(sql)?;
    row.insert(&mut stmt)
}

// =============================================================================
// Request Types
// =============================================================================

/// A request sent to the coalescer.
pub enum WriteRequest {
    /// Append one row.
    Append {
        row: InsertRow,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Flush, settle every accepted request and stop.
    Shutdown { done: oneshot::Sender<()> },
}

/// An append waiting in a drained batch.
pub struct PendingAppend {
    pub row: InsertRow,
    pub response: oneshot::Sender<Result<bool>>,
}

impl PendingAppend {
    fn settle(self, outcome: Result<bool>) {
        // The producer may have stopped waiting; nothing to deliver then.
        let _ = self.response.send(outcome);
    }
}

// =============================================================================
// Batch Writer
// =============================================================================

/// Executes drained batches.
///
/// Runs on the coalescer thread and owns that thread's connection.
pub struct BatchWriter {
    conn: Connection,
    router: Arc<dyn TableRouter>,
    statements: Arc<InsertStatements>,
}

impl BatchWriter {
    pub fn new(
        conn: Connection,
        router: Arc<dyn TableRouter>,
        statements: Arc<InsertStatements>,
    ) -> Self {
        Self {
            conn,
            router,
            statements,
        }
    }

    /// Writes one drained batch and settles every request in it.
    pub async fn execute_batch(&mut self, batch: Vec<PendingAppend>) {
        let (Some(min), Some(max)) = (
            batch.iter().map(|p| p.row.timestamp).min(),
            batch.iter().map(|p| p.row.timestamp).max(),
        ) else {
            return;
        };

        match self.router.resolve(min).await {
            Ok(table) if table.covers(max) => {
                debug!(size = batch.len(), table = %table.name, "fast path");
                self.commit_group(&table, batch);
            }
            _ => {
                debug!(size = batch.len(), "slow path");
                for (table, items) in self.route_each(batch).await {
                    self.commit_group(&table, items);
                }
            }
        }
    }

    /// Resolves every request's table and groups requests by table.
    ///
    /// Requests whose timestamp cannot be routed are settled with the
    /// routing error here.
    async fn route_each(&self, batch: Vec<PendingAppend>) -> Vec<(SubTable, Vec<PendingAppend>)> {
        let timestamps: Vec<Timestamp> = batch.iter().map(|p| p.row.timestamp).collect();
        let resolved = resolve_each(self.router.as_ref(), &timestamps).await;

        let mut tables = Vec::with_capacity(batch.len());
        let mut routed = Vec::with_capacity(batch.len());
        for (pending, table) in batch.into_iter().zip(resolved) {
            match table {
                Ok(table) => {
                    tables.push(table);
                    routed.push(Some(pending));
                }
                Err(e) => pending.settle(Err(e)),
            }
        }

        group_by_table(tables)
            .into_iter()
            .map(|ShardGroup { table, members }| {
                let items = members
                    .into_iter()
                    .filter_map(|i| routed[i].take())
                    .collect();
                (table, items)
            })
            .collect()
    }

    /// Inserts one group in a transaction, falling back to per-row inserts.
    fn commit_group(&mut self, table: &SubTable, items: Vec<PendingAppend>) {
        let sql = self.statements.get(&table.name);

        match insert_group(&mut self.conn, &sql, items.iter().map(|p| &p.row)) {
            Ok(outcomes) => {
                for (pending, inserted) in items.into_iter().zip(outcomes) {
                    pending.settle(Ok(inserted));
                }
            }
            Err(e) => {
                warn!(
                    table = %table.name,
                    rows = items.len(),
                    error = %e,
                    "batch transaction failed, retrying rows individually"
                );
                for pending in items {
                    let outcome = insert_single(&self.conn, &sql, &pending.row);
                    pending.settle(outcome);
                }
            }
        }
    }
}

// =============================================================================
// Batch Writer Handle
// =============================================================================

/// Async handle to the coalescer.
///
/// Cloning is cheap; all clones feed the same queue.
#[derive(Clone)]
pub struct BatchWriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl BatchWriterHandle {
    /// Submits one row and waits until it is settled.
    pub async fn append(&self, row: InsertRow) -> Result<bool> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(WriteRequest::Append {
                row,
                response: response_tx,
            })
            .await
            .map_err(|_| Error::Closed("writer has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Closed("writer dropped response".to_string()))?
    }

    /// Flushes pending work and stops the coalescer.
    ///
    /// Returns once every accepted request has been settled. Calling it again
    /// is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send(WriteRequest::Shutdown { done: done_tx })
            .await
            .is_err()
        {
            return Ok(());
        }

        let _ = done_rx.await;
        Ok(())
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Adds a request to `batch`, or returns the shutdown acknowledgement.
fn accept(request: WriteRequest, batch: &mut Vec<PendingAppend>) -> Option<oneshot::Sender<()>> {
    match request {
        WriteRequest::Append { row, response } => {
            batch.push(PendingAppend { row, response });
            None
        }
        WriteRequest::Shutdown { done } => Some(done),
    }
}

/// Runs the drain loop until shutdown or until every handle is dropped.
pub async fn run_batch_writer(
    mut writer: BatchWriter,
    mut rx: mpsc::Receiver<WriteRequest>,
    config: WriterConfig,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::new();
        let mut shutdown = accept(first, &mut batch);
        let deadline = Instant::now() + config.batch_linger;

        while shutdown.is_none() && batch.len() < config.batch_max_size {
            let next = match rx.try_recv() {
                Ok(request) => request,
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match timeout(remaining, rx.recv()).await {
                        Ok(Some(request)) => request,
                        _ => break,
                    }
                }
            };
            shutdown = accept(next, &mut batch);
        }

        debug!(size = batch.len(), "draining batch");
        writer.execute_batch(batch).await;

        if let Some(done) = shutdown {
            // Anything queued behind the shutdown marker was accepted too.
            rx.close();
            let mut rest = Vec::new();
            let mut acks = vec![done];
            while let Ok(request) = rx.try_recv() {
                acks.extend(accept(request, &mut rest));
            }
            writer.execute_batch(rest).await;

            debug!("batch writer stopped");
            for ack in acks {
                let _ = ack.send(());
            }
            return;
        }
    }

    debug!("all writer handles dropped, batch writer stopped");
}

/// Spawns the coalescer on a dedicated thread.
///
/// The thread owns `conn` and runs its own current-thread runtime.
pub fn spawn_batch_writer(
    conn: Connection,
    router: Arc<dyn TableRouter>,
    statements: Arc<InsertStatements>,
    config: WriterConfig,
) -> Result<BatchWriterHandle> {
    config.validate()?;
    let (tx, rx) = mpsc::channel(config.channel_size);

    let writer = BatchWriter::new(conn, router, statements);

    std::thread::Builder::new()
        .name("shardlog-batch-writer".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    // Dropping rx fails every submit with Error::Closed.
                    error!(error = %e, "failed to create writer runtime");
                    return;
                }
            };

            runtime.block_on(run_batch_writer(writer, rx, config));
        })
        .map_err(|e| {
            error!(error = %e, "failed to spawn writer thread");
            Error::Background(format!("failed to spawn writer thread: {e}"))
        })?;

    Ok(BatchWriterHandle { tx })
}

// =============================================================================
// Transactional Append
// =============================================================================

/// Inserts every row of every group inside one transaction.
///
/// Returns one outcome per row, indexed like `rows`. Any failure rolls back
/// all groups and is returned as is; there is no per-row fallback.
pub fn insert_all_or_nothing(
    conn: &mut Connection,
    statements: &InsertStatements,
    groups: &[ShardGroup],
    rows: &[InsertRow],
) -> Result<Vec<bool>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut outcomes = vec![false; rows.len()];

    for group in groups {
        let sql = statements.get(&group.table.name);
        let mut stmt = tx.prepare_cached(&sql)?;
        for &i in &group.members {
            outcomes[i] = rows[i].insert(&mut stmt)?;
        }
    }

    tx.commit()?;
    Ok(outcomes)
}

// =============================================================================
// Tests
// =============================================================================
