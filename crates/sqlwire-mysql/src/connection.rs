//! Async MySQL connection over a [`Transport`].
//!
//! [`Connection`] drives a [`Driver`] against a real byte stream: it writes
//! outbound packets, performs TLS upgrades when asked, feeds received bytes
//! back and waits for the completion of the command it just submitted.
//! Every operation takes a [`Cx`] and checks it for cancellation before
//! touching the wire. A cancellation that lands while a command is in flight
//! leaves the session out of sync, so the connection quits instead of
//! pretending it can continue.

use sqlwire_core::{Cx, Error, IsolationLevel, Outcome, Result, Row, Value};

use crate::auth::AuthRegistry;
use crate::command::{Columns, CommandResult, FetchedRows, QueryResult, ServerInfo};
use crate::config::MySqlConfig;
use crate::driver::{ConnectionState, Driver, DriverEvent, TransportAction};
use crate::engine::CommandId;
use crate::error::{disconnected, protocol_error};
use crate::statement::{Params, Statement, StatementCursor};
use crate::transport::{MySqlStream, Transport};

/// Size of one socket read.
const READ_CHUNK: usize = 16 * 1024;

/// One result set of a response, or the OK that stands in for one.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// Empty for statements that return no rows.
    pub columns: Columns,
    pub rows: Vec<Row>,
    pub summary: QueryResult,
}

/// Async MySQL connection.
pub struct Connection<T: Transport = MySqlStream> {
    transport: T,
    driver: Driver,
    read_buf: Vec<u8>,
    /// The driver asked for the transport to be closed.
    closed: bool,
    /// The transport failed or reached EOF.
    broken: bool,
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("driver", &self.driver)
            .field("secure", &self.transport.is_secure())
            .field("closed", &self.closed)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl Connection<MySqlStream> {
    /// Open a TCP connection to `config.host` and run the handshake.
    pub async fn open(cx: &Cx, config: MySqlConfig) -> Outcome<Self, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let stream = match MySqlStream::connect(&config).await {
            Ok(s) => s,
            Err(e) => return Outcome::Err(e),
        };
        Self::connect(cx, stream, config).await
    }
}

impl<T: Transport> Connection<T> {
    /// Run the handshake over an already connected transport, with the
    /// built-in auth plugins and no LOCAL INFILE handler.
    pub async fn connect(cx: &Cx, transport: T, config: MySqlConfig) -> Outcome<Self, Error> {
        let driver = Driver::new(config, AuthRegistry::with_defaults(), None);
        Self::connect_with(cx, transport, driver).await
    }

    /// Run the handshake with a caller-built [`Driver`].
    pub async fn connect_with(cx: &Cx, transport: T, mut driver: Driver) -> Outcome<Self, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let id = match driver.connect() {
            Ok(id) => id,
            Err(e) => return Outcome::Err(e),
        };
        let mut conn = Self {
            transport,
            driver,
            read_buf: vec![0; READ_CHUNK],
            closed: false,
            broken: false,
        };
        match conn.wait(cx, id).await {
            Outcome::Ok(CommandResult::Connected(info)) => {
                tracing::info!(
                    server_version = %info.server_version,
                    connection_id = info.connection_id,
                    tls = info.tls,
                    "connected"
                );
                Outcome::Ok(conn)
            }
            Outcome::Ok(other) => Outcome::Err(unexpected_result("connect", &other)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn state(&self) -> ConnectionState {
        self.driver.state()
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.driver.server_info()
    }

    pub fn in_transaction(&self) -> bool {
        self.driver.in_transaction()
    }

    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    // ==================== Queries ====================

    /// Run a text query and return the rows of every result set.
    pub async fn query(&mut self, cx: &Cx, sql: &str) -> Outcome<Vec<Row>, Error> {
        match self.query_results(cx, sql).await {
            Outcome::Ok(sets) => Outcome::Ok(sets.into_iter().flat_map(|s| s.rows).collect()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run a text query and keep result sets apart. Multi-statement SQL
    /// yields one entry per statement.
    pub async fn query_results(&mut self, cx: &Cx, sql: &str) -> Outcome<Vec<ResultSet>, Error> {
        let submitted = self.driver.query(sql);
        match self.stream(cx, submitted).await {
            Outcome::Ok(stream) => stream.collect(cx).await,
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run a text query and read its rows one at a time.
    pub async fn query_stream(&mut self, cx: &Cx, sql: &str) -> Outcome<RowStream<'_, T>, Error> {
        let submitted = self.driver.query(sql);
        self.stream(cx, submitted).await
    }

    /// Run a statement that returns no rows and report what it changed.
    /// If it does return rows they are discarded.
    pub async fn execute(&mut self, cx: &Cx, sql: &str) -> Outcome<QueryResult, Error> {
        match self.query_results(cx, sql).await {
            Outcome::Ok(sets) => Outcome::Ok(last_summary(sets)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    // ==================== Prepared statements ====================

    pub async fn prepare(&mut self, cx: &Cx, sql: &str) -> Outcome<Statement, Error> {
        let submitted = self.driver.prepare(sql);
        match self.run(cx, submitted).await {
            Outcome::Ok(CommandResult::Prepared(statement)) => Outcome::Ok(statement),
            Outcome::Ok(other) => Outcome::Err(unexpected_result("prepare", &other)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Execute a prepared statement with the binary protocol.
    pub async fn execute_statement(
        &mut self,
        cx: &Cx,
        statement: &Statement,
        params: impl Into<Params>,
    ) -> Outcome<Vec<ResultSet>, Error> {
        let submitted = self.driver.execute(statement, params);
        match self.stream(cx, submitted).await {
            Outcome::Ok(stream) => stream.collect(cx).await,
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Execute a prepared statement and stream its rows.
    pub async fn execute_statement_stream(
        &mut self,
        cx: &Cx,
        statement: &Statement,
        params: impl Into<Params>,
    ) -> Outcome<RowStream<'_, T>, Error> {
        let submitted = self.driver.execute(statement, params);
        self.stream(cx, submitted).await
    }

    /// Execute a prepared statement behind a server-side cursor. Rows are
    /// read with [`Connection::fetch`].
    pub async fn execute_cursor(
        &mut self,
        cx: &Cx,
        statement: &Statement,
        params: impl Into<Params>,
    ) -> Outcome<StatementCursor, Error> {
        let submitted = self.driver.execute_cursor(statement, params);
        match self.run(cx, submitted).await {
            Outcome::Ok(CommandResult::Cursor(cursor)) => Outcome::Ok(cursor),
            Outcome::Ok(other) => Outcome::Err(unexpected_result("execute_cursor", &other)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub async fn fetch(
        &mut self,
        cx: &Cx,
        cursor: &StatementCursor,
        rows: u32,
    ) -> Outcome<FetchedRows, Error> {
        let submitted = self.driver.fetch(cursor, rows);
        match self.run(cx, submitted).await {
            Outcome::Ok(CommandResult::Fetched(fetched)) => Outcome::Ok(fetched),
            Outcome::Ok(other) => Outcome::Err(unexpected_result("fetch", &other)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub async fn reset_statement(
        &mut self,
        cx: &Cx,
        statement: &Statement,
    ) -> Outcome<QueryResult, Error> {
        let submitted = self.driver.reset_statement(statement);
        self.run_done(cx, submitted, "reset_statement").await
    }

    /// Deallocate `statement`. The server sends no reply.
    pub async fn close_statement(&mut self, cx: &Cx, statement: &Statement) -> Outcome<(), Error> {
        let submitted = self.driver.close_statement(statement);
        self.run_unit(cx, submitted).await
    }

    // ==================== Utility commands ====================

    pub async fn ping(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let submitted = self.driver.ping();
        match self.run_done(cx, submitted, "ping").await {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Server status line from `COM_STATISTICS`.
    pub async fn statistics(&mut self, cx: &Cx) -> Outcome<String, Error> {
        let submitted = self.driver.statistics();
        match self.run(cx, submitted).await {
            Outcome::Ok(CommandResult::Statistics(text)) => Outcome::Ok(text),
            Outcome::Ok(other) => Outcome::Err(unexpected_result("statistics", &other)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Render `value` as an SQL literal, honoring the session's
    /// `NO_BACKSLASH_ESCAPES` mode.
    pub fn quote(&self, value: &Value) -> Result<String> {
        self.driver.quote(value)
    }

    // ==================== Transactions ====================

    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.begin_with(cx, None).await
    }

    pub async fn begin_with(
        &mut self,
        cx: &Cx,
        isolation: Option<IsolationLevel>,
    ) -> Outcome<(), Error> {
        let submitted = self.driver.begin_transaction(isolation);
        self.run_query_unit(cx, submitted, "begin").await
    }

    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let submitted = self.driver.commit();
        self.run_query_unit(cx, submitted, "commit").await
    }

    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let submitted = self.driver.rollback();
        self.run_query_unit(cx, submitted, "rollback").await
    }

    // ==================== Shutdown ====================

    /// Send `COM_QUIT` once outstanding work has finished.
    pub async fn close(mut self, cx: &Cx) -> Outcome<(), Error> {
        let submitted = self.driver.close();
        let outcome = self.run_unit(cx, submitted).await;
        if !self.broken {
            // The server may already be gone; nothing left to report.
            let _ = self.transport.flush().await;
        }
        tracing::debug!("connection closed");
        outcome
    }

    // ==================== Event loop ====================

    async fn run(&mut self, cx: &Cx, submitted: Result<CommandId>) -> Outcome<CommandResult, Error> {
        if let Some(reason) = cx.cancel_reason() {
            if let Ok(id) = submitted {
                // Submitted but never waited on: the session cannot be trusted.
                tracing::debug!(%id, "cancelled before dispatch");
                self.abandon();
            }
            return Outcome::Cancelled(reason);
        }
        match submitted {
            Ok(id) => self.wait(cx, id).await,
            Err(e) => Outcome::Err(e),
        }
    }

    async fn run_done(
        &mut self,
        cx: &Cx,
        submitted: Result<CommandId>,
        op: &str,
    ) -> Outcome<QueryResult, Error> {
        match self.run(cx, submitted).await {
            Outcome::Ok(CommandResult::Done(summary)) => Outcome::Ok(summary),
            Outcome::Ok(other) => Outcome::Err(unexpected_result(op, &other)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn run_unit(&mut self, cx: &Cx, submitted: Result<CommandId>) -> Outcome<(), Error> {
        match self.run(cx, submitted).await {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Transaction statements answer with an OK, possibly streamed when a
    /// `SET TRANSACTION` precedes `START TRANSACTION`.
    async fn run_query_unit(
        &mut self,
        cx: &Cx,
        submitted: Result<CommandId>,
        op: &str,
    ) -> Outcome<(), Error> {
        match self.stream(cx, submitted).await {
            Outcome::Ok(stream) => match stream.collect(cx).await {
                Outcome::Ok(_) => {
                    tracing::debug!(op, "transaction statement done");
                    Outcome::Ok(())
                }
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn stream(
        &mut self,
        cx: &Cx,
        submitted: Result<CommandId>,
    ) -> Outcome<RowStream<'_, T>, Error> {
        let id = match submitted {
            Ok(id) => id,
            Err(e) => return Outcome::Err(e),
        };
        match self.run(cx, Ok(id)).await {
            Outcome::Ok(CommandResult::Stream(columns)) => Outcome::Ok(RowStream {
                conn: self,
                id,
                columns,
                summaries: Vec::new(),
                done: false,
            }),
            Outcome::Ok(CommandResult::Done(summary)) => Outcome::Ok(RowStream {
                conn: self,
                id,
                columns: Columns::from(Vec::new()),
                summaries: vec![summary],
                done: true,
            }),
            Outcome::Ok(other) => Outcome::Err(unexpected_result("query", &other)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Wait for the completion of `id`, skipping events left over from
    /// streams the caller abandoned.
    async fn wait(&mut self, cx: &Cx, id: CommandId) -> Outcome<CommandResult, Error> {
        loop {
            match self.next_event(cx).await {
                Outcome::Ok(DriverEvent::Completed {
                    id: done, result, ..
                }) if done == id => {
                    return match result {
                        Ok(r) => Outcome::Ok(r),
                        Err(e) => Outcome::Err(e),
                    };
                }
                Outcome::Ok(DriverEvent::ConnectionError(e)) => {
                    tracing::warn!(error = %e, "connection error");
                }
                Outcome::Ok(other) => tracing::trace!(?other, "skipping event"),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
    }

    async fn next_event(&mut self, cx: &Cx) -> Outcome<DriverEvent, Error> {
        loop {
            if let Some(reason) = cx.cancel_reason() {
                self.abandon();
                return Outcome::Cancelled(reason);
            }

            self.flush_outbound().await;

            while let Some(action) = self.driver.poll_transport_action() {
                match action {
                    TransportAction::UpgradeTls {
                        server_name,
                        options,
                    } => match self.transport.upgrade_tls(&server_name, &options).await {
                        Ok(()) => {
                            if let Err(e) = self.driver.tls_established() {
                                return Outcome::Err(e);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "TLS upgrade failed");
                            self.driver.tls_failed(&e);
                        }
                    },
                    TransportAction::Close => self.closed = true,
                }
            }
            if self.driver.has_outbound() && !self.closed && !self.broken {
                continue;
            }

            if let Some(event) = self.driver.poll_event() {
                return Outcome::Ok(event);
            }
            if self.driver.has_pending_work() {
                self.driver.tick();
                continue;
            }
            if self.closed || self.broken {
                return Outcome::Err(disconnected("connection is closed"));
            }

            match self.transport.read_some(&mut self.read_buf).await {
                Ok(0) => {
                    self.broken = true;
                    self.driver.transport_closed();
                }
                Ok(n) => {
                    tracing::trace!(bytes = n, "received");
                    self.driver.on_data(&self.read_buf[..n]);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "read failed");
                    self.broken = true;
                    self.driver.transport_closed();
                }
            }
        }
    }

    /// Write pending packets. A failed write is reported to the driver as a
    /// lost connection, which fails the affected commands through events.
    async fn flush_outbound(&mut self) {
        if !self.driver.has_outbound() {
            return;
        }
        let bytes = self.driver.take_outbound();
        if self.closed || self.broken {
            tracing::trace!(bytes = bytes.len(), "discarding output for closed transport");
            return;
        }
        let written = match self.transport.write_all(&bytes).await {
            Ok(()) => self.transport.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "write failed");
            self.broken = true;
            self.driver.transport_closed();
        }
    }

    fn abandon(&mut self) {
        if self.driver.state().is_connecting() {
            let _ = self.driver.cancel_connect();
        } else if !self.driver.is_idle() && self.driver.state() != ConnectionState::Unusable {
            self.driver.quit();
        }
    }
}

/// Rows of a response, read incrementally.
///
/// Holds the connection borrowed until dropped. Dropping it early is fine:
/// the remaining rows are skipped by the next operation.
pub struct RowStream<'c, T: Transport> {
    conn: &'c mut Connection<T>,
    id: CommandId,
    columns: Columns,
    summaries: Vec<QueryResult>,
    done: bool,
}

enum Item {
    Row(Row),
    Columns(Columns),
    End(QueryResult),
}

impl<T: Transport> std::fmt::Debug for RowStream<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("id", &self.id)
            .field("columns", &self.columns.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> RowStream<'_, T> {
    /// Columns of the current result set.
    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// Summaries of the result sets finished so far.
    pub fn summaries(&self) -> &[QueryResult] {
        &self.summaries
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Next row of any result set, or `None` once the response is complete.
    pub async fn next(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        loop {
            match self.next_item(cx).await {
                Outcome::Ok(Some(Item::Row(row))) => return Outcome::Ok(Some(row)),
                Outcome::Ok(Some(_)) => {}
                Outcome::Ok(None) => return Outcome::Ok(None),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
    }

    /// Drain the response into result sets.
    pub async fn collect(mut self, cx: &Cx) -> Outcome<Vec<ResultSet>, Error> {
        if self.done {
            return Outcome::Ok(
                self.summaries
                    .drain(..)
                    .map(|summary| ResultSet {
                        columns: self.columns.clone(),
                        rows: Vec::new(),
                        summary,
                    })
                    .collect(),
            );
        }
        let mut sets = Vec::new();
        let mut current = ResultSet {
            columns: self.columns.clone(),
            ..ResultSet::default()
        };
        loop {
            match self.next_item(cx).await {
                Outcome::Ok(Some(Item::Row(row))) => current.rows.push(row),
                Outcome::Ok(Some(Item::Columns(columns))) => current.columns = columns,
                Outcome::Ok(Some(Item::End(summary))) => {
                    current.summary = summary;
                    let next = ResultSet {
                        columns: Columns::from(Vec::new()),
                        ..ResultSet::default()
                    };
                    sets.push(std::mem::replace(&mut current, next));
                }
                Outcome::Ok(None) => return Outcome::Ok(sets),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
    }

    async fn next_item(&mut self, cx: &Cx) -> Outcome<Option<Item>, Error> {
        if self.done {
            return Outcome::Ok(None);
        }
        loop {
            let event = match self.conn.next_event(cx).await {
                Outcome::Ok(event) => event,
                Outcome::Err(e) => {
                    self.done = true;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.done = true;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            match event {
                DriverEvent::Row { id, row } if id == self.id => {
                    return Outcome::Ok(Some(Item::Row(row)));
                }
                DriverEvent::Columns { id, columns } if id == self.id => {
                    self.columns = columns.clone();
                    return Outcome::Ok(Some(Item::Columns(columns)));
                }
                DriverEvent::ResultEnd { id, summary } if id == self.id => {
                    self.summaries.push(summary.clone());
                    return Outcome::Ok(Some(Item::End(summary)));
                }
                DriverEvent::StreamEnd { id, .. } if id == self.id => {
                    self.done = true;
                    return Outcome::Ok(None);
                }
                DriverEvent::StreamFailed { id, error, .. } if id == self.id => {
                    self.done = true;
                    return Outcome::Err(error);
                }
                DriverEvent::ConnectionError(e) => {
                    tracing::warn!(error = %e, "connection error");
                }
                other => tracing::trace!(?other, "skipping event"),
            }
        }
    }
}

fn last_summary(sets: Vec<ResultSet>) -> QueryResult {
    sets.into_iter()
        .next_back()
        .map(|s| s.summary)
        .unwrap_or_default()
}

fn unexpected_result(op: &str, result: &CommandResult) -> Error {
    protocol_error(format!("unexpected {op} result: {result:?}"))
}
