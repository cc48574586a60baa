//! Connection lifecycle and command queue, without I/O.
//!
//! The [`Driver`] wraps the protocol [`Engine`] with everything that happens
//! around individual commands: the connect handshake (TLS upgrade, auth and
//! post-auth session setup), the FIFO backlog, transaction pinning and
//! graceful or forced shutdown.
//!
//! The caller owns the socket. It passes received bytes to
//! [`Driver::on_data`], writes whatever [`Driver::take_outbound`] returns,
//! carries out [`TransportAction`]s and reads [`DriverEvent`]s. Every
//! operation returns a [`CommandId`] naming the completion that will
//! eventually show up as an event, or fails synchronously without touching
//! the wire.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use sqlwire_core::{Error, IsolationLevel, Result, Row, UsageErrorKind, Value};

use crate::auth::{AuthContext, AuthRegistry};
use crate::codec;
use crate::command::{
    AuthExchange, Columns, Command, CommandResult, Execute, Fetch, HandshakeResponse, Ping,
    Prepare, Query, QueryResult, Quit, ServerInfo, SslRequest, StatementClose, StatementReset,
    Statistics,
};
use crate::config::{MySqlConfig, TlsOptions};
use crate::engine::{CommandId, Engine, EngineEvent};
use crate::error::{connection_error, disconnected, ssl_error};
use crate::infile::LocalInfileHandler;
use crate::message::Handshake;
use crate::protocol::{capabilities, server_status};
use crate::statement::{Params, Statement, StatementCursor};

/// Connect-phase requests nobody waits on.
const INTERNAL: CommandId = CommandId(0);

/// Driver-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// [`Driver::connect`] has not been called.
    Closed,
    /// Waiting for the server greeting.
    Started,
    /// Greeting received and capabilities negotiated.
    Made,
    /// Waiting for the transport to finish the TLS upgrade.
    SslStartup,
    /// Credentials sent.
    AwaitingResponse,
    /// Applying session settings after authentication.
    SetEnv,
    Ok,
    /// Terminal.
    Unusable,
}

impl ConnectionState {
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            ConnectionState::Started
                | ConnectionState::Made
                | ConnectionState::SslStartup
                | ConnectionState::AwaitingResponse
                | ConnectionState::SetEnv
        )
    }
}

/// Work the transport must do on the driver's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAction {
    /// Upgrade the stream in place, then report back through
    /// [`Driver::tls_established`] or [`Driver::tls_failed`].
    UpgradeTls {
        server_name: String,
        options: TlsOptions,
    },
    /// Close the stream once pending output has been written.
    Close,
}

/// Progress reported by the driver.
///
/// `release` tells a pool whether the connection may be checked back in
/// after this event: it is false while a transaction is open and on a
/// streaming completion whose rows are still to come.
#[derive(Debug)]
pub enum DriverEvent {
    Completed {
        id: CommandId,
        result: Result<CommandResult>,
        release: bool,
    },
    /// Metadata of a result set after the first in a multi-result response.
    Columns { id: CommandId, columns: Columns },
    Row { id: CommandId, row: Row },
    ResultEnd { id: CommandId, summary: QueryResult },
    StreamEnd { id: CommandId, release: bool },
    StreamFailed {
        id: CommandId,
        error: Error,
        release: bool,
    },
    /// A failure not attributable to any submitted command.
    ConnectionError(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Plain,
    Begin,
    End,
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    release: bool,
    role: Role,
}

struct Pending {
    id: CommandId,
    command: Box<dyn Command>,
    meta: Meta,
}

/// Sans-IO MySQL client connection.
pub struct Driver {
    config: MySqlConfig,
    registry: AuthRegistry,
    infile: Option<Arc<dyn LocalInfileHandler>>,
    engine: Engine,
    state: ConnectionState,
    backlog: VecDeque<Pending>,
    inflight: HashMap<CommandId, Meta>,
    next_id: u64,
    connect_id: Option<CommandId>,
    close_id: Option<CommandId>,
    draining: bool,
    greeting: Option<Handshake>,
    server_info: Option<ServerInfo>,
    events: VecDeque<DriverEvent>,
    actions: VecDeque<TransportAction>,
    in_transaction: bool,
    tls_active: bool,
    /// A close action was issued, so a disconnect is expected.
    closing: bool,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("state", &self.state)
            .field("engine", &self.engine)
            .field("backlog", &self.backlog.len())
            .field("in_transaction", &self.in_transaction)
            .field("tls", &self.tls_active)
            .finish_non_exhaustive()
    }
}

impl Driver {
    pub fn new(
        config: MySqlConfig,
        registry: AuthRegistry,
        infile: Option<Arc<dyn LocalInfileHandler>>,
    ) -> Self {
        let engine = Engine::new(config.capability_flags(), config.local_infile);
        Self {
            config,
            registry,
            infile,
            engine,
            state: ConnectionState::Closed,
            backlog: VecDeque::new(),
            inflight: HashMap::new(),
            next_id: 1,
            connect_id: None,
            close_id: None,
            draining: false,
            greeting: None,
            server_info: None,
            events: VecDeque::new(),
            actions: VecDeque::new(),
            in_transaction: false,
            tls_active: false,
            closing: false,
        }
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Session details, once connected.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Connected, not draining, and nothing queued or running.
    pub fn is_idle(&self) -> bool {
        self.state == ConnectionState::Ok
            && !self.draining
            && self.backlog.is_empty()
            && self.engine.is_idle()
    }

    // ==================== Transport side ====================

    /// Begin the handshake. The server speaks first, so nothing is written
    /// until its greeting arrives.
    pub fn connect(&mut self) -> Result<CommandId> {
        if self.state != ConnectionState::Closed {
            return Err(Error::usage(
                UsageErrorKind::InvalidState,
                format!("connect called in state {:?}", self.state),
            ));
        }
        let id = self.allocate();
        tracing::debug!(%id, host = %self.config.host, user = %self.config.user, "connecting");
        self.connect_id = Some(id);
        self.state = ConnectionState::Started;
        Ok(id)
    }

    /// Bytes received from the transport. Processes at most one message;
    /// call [`Driver::tick`] while [`Driver::has_pending_work`] holds.
    pub fn on_data(&mut self, bytes: &[u8]) {
        if self.state == ConnectionState::Unusable {
            tracing::trace!(bytes = bytes.len(), "dropping bytes for unusable connection");
            return;
        }
        self.engine.feed(bytes);
        self.tick();
    }

    /// Process one buffered message (or deferred completion).
    pub fn tick(&mut self) -> bool {
        let progressed = self.engine.step();
        self.pump();
        progressed
    }

    pub fn has_pending_work(&self) -> bool {
        self.engine.has_pending_work()
    }

    pub fn take_outbound(&mut self) -> Vec<u8> {
        self.engine.take_outbound()
    }

    pub fn has_outbound(&self) -> bool {
        self.engine.has_outbound()
    }

    pub fn poll_event(&mut self) -> Option<DriverEvent> {
        self.events.pop_front()
    }

    pub fn poll_transport_action(&mut self) -> Option<TransportAction> {
        self.actions.pop_front()
    }

    /// The transport finished the TLS upgrade requested by
    /// [`TransportAction::UpgradeTls`].
    pub fn tls_established(&mut self) -> Result<()> {
        if self.state != ConnectionState::SslStartup {
            return Err(Error::usage(
                UsageErrorKind::InvalidState,
                format!("no TLS upgrade pending in state {:?}", self.state),
            ));
        }
        tracing::debug!("TLS established");
        self.tls_active = true;
        self.send_handshake_response(true);
        self.pump();
        Ok(())
    }

    pub fn tls_failed(&mut self, error: &Error) {
        if self.state == ConnectionState::SslStartup {
            self.fail_connect(ssl_error(format!("TLS handshake failed: {error}")));
        }
    }

    /// The peer closed the stream or the transport failed.
    pub fn transport_closed(&mut self) {
        if self.closing {
            tracing::debug!("transport closed");
            return;
        }
        tracing::warn!(state = ?self.state, "connection closed by peer");
        let error = disconnected("connection closed by server");
        if self.state.is_connecting() {
            self.fail_connect(error);
        } else if self.state != ConnectionState::Unusable {
            self.fail_session(error);
        }
    }

    // ==================== Operations ====================

    /// Run a text-protocol statement. Result sets are streamed.
    pub fn query(&mut self, sql: impl Into<String>) -> Result<CommandId> {
        let handler = if self.config.local_infile {
            self.infile.clone()
        } else {
            None
        };
        self.submit(Box::new(Query::new(sql).with_local_infile(handler)), Role::Plain)
    }

    pub fn prepare(&mut self, sql: impl Into<String>) -> Result<CommandId> {
        self.submit(Box::new(Prepare::new(sql)), Role::Plain)
    }

    /// Execute a prepared statement; rows are streamed.
    pub fn execute(&mut self, statement: &Statement, params: impl Into<Params>) -> Result<CommandId> {
        let command = Execute::new(statement.clone(), params.into())?;
        self.submit(Box::new(command), Role::Plain)
    }

    /// Execute a prepared statement behind a read-only server cursor.
    pub fn execute_cursor(
        &mut self,
        statement: &Statement,
        params: impl Into<Params>,
    ) -> Result<CommandId> {
        let command = Execute::with_cursor(statement.clone(), params.into())?;
        self.submit(Box::new(command), Role::Plain)
    }

    /// Fetch up to `rows` rows from an open cursor.
    pub fn fetch(&mut self, cursor: &StatementCursor, rows: u32) -> Result<CommandId> {
        let command = Fetch::new(cursor.clone(), rows)?;
        self.submit(Box::new(command), Role::Plain)
    }

    /// Deallocate a statement. It is unusable from this call on.
    pub fn close_statement(&mut self, statement: &Statement) -> Result<CommandId> {
        let command = StatementClose::new(statement)?;
        self.submit(Box::new(command), Role::Plain)
    }

    pub fn reset_statement(&mut self, statement: &Statement) -> Result<CommandId> {
        statement.ensure_open()?;
        self.submit(Box::new(StatementReset::new(statement.clone())), Role::Plain)
    }

    pub fn ping(&mut self) -> Result<CommandId> {
        self.submit(Box::new(Ping::default()), Role::Plain)
    }

    pub fn statistics(&mut self) -> Result<CommandId> {
        self.submit(Box::new(Statistics::default()), Role::Plain)
    }

    /// Start a transaction. The connection stays pinned (no `release`) until
    /// [`Driver::commit`] or [`Driver::rollback`].
    pub fn begin_transaction(&mut self, isolation: Option<IsolationLevel>) -> Result<CommandId> {
        if self.in_transaction {
            return Err(Error::usage(
                UsageErrorKind::InvalidState,
                "a transaction is already open",
            ));
        }
        let query = match isolation {
            Some(level) => Query::new(format!(
                "SET TRANSACTION ISOLATION LEVEL {}",
                level.as_sql()
            ))
            .followed_by("START TRANSACTION"),
            None => Query::new("START TRANSACTION"),
        };
        self.submit(Box::new(query), Role::Begin)
    }

    pub fn commit(&mut self) -> Result<CommandId> {
        self.end_transaction("COMMIT")
    }

    pub fn rollback(&mut self) -> Result<CommandId> {
        self.end_transaction("ROLLBACK")
    }

    fn end_transaction(&mut self, sql: &'static str) -> Result<CommandId> {
        if !self.in_transaction {
            return Err(Error::usage(
                UsageErrorKind::InvalidState,
                format!("{sql} without an open transaction"),
            ));
        }
        self.submit(Box::new(Query::new(sql)), Role::End)
    }

    /// Queue an arbitrary command.
    pub fn run_command(&mut self, command: Box<dyn Command>) -> Result<CommandId> {
        self.submit(command, Role::Plain)
    }

    /// Render `value` as an SQL literal for this session.
    pub fn quote(&self, value: &Value) -> Result<String> {
        let no_backslash =
            self.engine.status_flags() & server_status::SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0;
        codec::quote(value, no_backslash)
    }

    /// Graceful close: let queued commands finish, then send `COM_QUIT` and
    /// close the transport. New commands are refused from now on.
    pub fn close(&mut self) -> Result<CommandId> {
        if self.close_id.is_some() {
            return Err(Error::usage(
                UsageErrorKind::InvalidState,
                "close already requested",
            ));
        }
        let id = self.allocate();
        match self.state {
            ConnectionState::Closed | ConnectionState::Unusable => {
                self.state = ConnectionState::Unusable;
                self.events.push_back(DriverEvent::Completed {
                    id,
                    result: Ok(CommandResult::Unit),
                    release: true,
                });
                self.request_close();
            }
            _ => {
                tracing::debug!(%id, queued = self.backlog.len(), "draining before close");
                self.close_id = Some(id);
                self.draining = true;
                self.pump();
            }
        }
        Ok(id)
    }

    /// Forced close: reject everything outstanding, send `COM_QUIT` if the
    /// session is established, and close the transport.
    pub fn quit(&mut self) -> CommandId {
        let id = self.allocate();
        if self.state == ConnectionState::Unusable {
            self.events.push_back(DriverEvent::Completed {
                id,
                result: Ok(CommandResult::Unit),
                release: true,
            });
            return id;
        }
        tracing::debug!(%id, state = ?self.state, "quitting");
        let established = self.state == ConnectionState::Ok;
        let connect = self.connect_id.take();
        if let Some(connect) = connect {
            self.events.push_back(DriverEvent::Completed {
                id: connect,
                result: Err(Error::going_away("connection is quitting")),
                release: true,
            });
        }
        if let Some((current, resolved)) = self.engine.abort() {
            if current != INTERNAL && Some(current) != connect {
                self.fail_command(current, resolved, Error::going_away("connection is quitting"));
            }
        }
        self.reject_backlog("connection is quitting");
        self.resolve_close();
        self.state = ConnectionState::Unusable;
        if established {
            self.inflight.insert(
                id,
                Meta {
                    release: true,
                    role: Role::Plain,
                },
            );
            self.engine.start(id, Box::new(Quit));
            self.drain_engine();
        } else {
            self.events.push_back(DriverEvent::Completed {
                id,
                result: Ok(CommandResult::Unit),
                release: true,
            });
        }
        self.request_close();
        id
    }

    /// Abandon an in-progress connect. Nothing further is written.
    pub fn cancel_connect(&mut self) -> Result<()> {
        let Some(connect) = self.connect_id.take() else {
            return Err(Error::usage(
                UsageErrorKind::InvalidState,
                "no connection attempt in progress",
            ));
        };
        tracing::debug!(id = %connect, state = ?self.state, "connect cancelled");
        self.engine.abort();
        self.engine.take_outbound();
        self.state = ConnectionState::Unusable;
        self.events.push_back(DriverEvent::Completed {
            id: connect,
            result: Err(Error::going_away("connection attempt cancelled")),
            release: true,
        });
        self.reject_backlog("connection attempt cancelled");
        self.resolve_close();
        self.request_close();
        Ok(())
    }

    // ==================== Internals ====================

    fn allocate(&mut self) -> CommandId {
        let id = CommandId(self.next_id);
        self.next_id += 1;
        id
    }

    fn submit(&mut self, command: Box<dyn Command>, role: Role) -> Result<CommandId> {
        match self.state {
            ConnectionState::Closed => {
                return Err(Error::usage(
                    UsageErrorKind::ConnectionClosed,
                    "connection is not open",
                ));
            }
            ConnectionState::Unusable => {
                return Err(Error::going_away("connection is closed"));
            }
            _ if self.draining => return Err(Error::going_away("connection is closing")),
            _ => {}
        }
        let release = match role {
            Role::Begin => {
                self.in_transaction = true;
                false
            }
            Role::End => {
                self.in_transaction = false;
                true
            }
            Role::Plain => !self.in_transaction,
        };
        let id = self.allocate();
        tracing::debug!(%id, command = command.name(), queued = self.backlog.len(), "submit");
        self.backlog.push_back(Pending {
            id,
            command,
            meta: Meta { release, role },
        });
        self.pump();
        Ok(id)
    }

    /// Translate engine events and feed the engine from the backlog until
    /// neither makes progress.
    fn pump(&mut self) {
        loop {
            self.drain_engine();
            if !self.dispatch_next() {
                break;
            }
        }
    }

    fn drain_engine(&mut self) {
        while let Some(event) = self.engine.poll_event() {
            self.on_engine_event(event);
        }
    }

    fn dispatch_next(&mut self) -> bool {
        if self.state != ConnectionState::Ok || !self.engine.is_idle() || self.engine.is_failed() {
            return false;
        }
        if let Some(next) = self.backlog.pop_front() {
            self.inflight.insert(next.id, next.meta);
            self.engine.start(next.id, next.command);
            return true;
        }
        if self.draining {
            self.finish_close();
            return true;
        }
        false
    }

    fn finish_close(&mut self) {
        self.draining = false;
        let Some(id) = self.close_id.take() else {
            return;
        };
        tracing::debug!(%id, "closing connection");
        self.state = ConnectionState::Unusable;
        self.inflight.insert(
            id,
            Meta {
                release: true,
                role: Role::Plain,
            },
        );
        self.engine.start(id, Box::new(Quit));
        self.request_close();
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Greeting(greeting) => self.on_greeting(greeting),
            EngineEvent::Completed {
                id,
                result,
                streaming,
            } => self.on_completed(id, result, streaming),
            EngineEvent::Columns { id, columns } => {
                self.events.push_back(DriverEvent::Columns { id, columns });
            }
            EngineEvent::Row { id, row } => self.events.push_back(DriverEvent::Row { id, row }),
            EngineEvent::ResultEnd { id, summary } => {
                self.events.push_back(DriverEvent::ResultEnd { id, summary });
            }
            EngineEvent::StreamEnd { id } => {
                if Some(id) == self.connect_id {
                    return self.on_connect_step(Ok(CommandResult::Unit));
                }
                let release = self.settle(id, true);
                self.events.push_back(DriverEvent::StreamEnd { id, release });
            }
            EngineEvent::StreamFailed { id, error } => {
                if Some(id) == self.connect_id {
                    return self.fail_connect(error);
                }
                let release = self.settle(id, false);
                self.events
                    .push_back(DriverEvent::StreamFailed { id, error, release });
            }
            EngineEvent::ServerError(error) => {
                self.events.push_back(DriverEvent::ConnectionError(error));
            }
            EngineEvent::Fatal(error) => {
                if self.state.is_connecting() {
                    self.fail_connect(error);
                } else if self.state != ConnectionState::Unusable {
                    self.fail_session(error);
                } else {
                    tracing::debug!(%error, "error after close");
                }
            }
        }
    }

    fn on_completed(&mut self, id: CommandId, result: Result<CommandResult>, streaming: bool) {
        if id == INTERNAL {
            if let Err(error) = result {
                self.fail_connect(error);
            }
            return;
        }
        if Some(id) == self.connect_id {
            if !streaming {
                self.on_connect_step(result);
            }
            return;
        }
        if streaming {
            self.events.push_back(DriverEvent::Completed {
                id,
                result,
                release: false,
            });
            return;
        }
        let release = self.settle(id, result.is_ok());
        self.events.push_back(DriverEvent::Completed {
            id,
            result,
            release,
        });
    }

    /// Forget a finished command, returning its release flag.
    fn settle(&mut self, id: CommandId, succeeded: bool) -> bool {
        let Some(meta) = self.inflight.remove(&id) else {
            return !self.in_transaction;
        };
        if meta.role == Role::Begin && !succeeded {
            tracing::debug!(%id, "transaction failed to start");
            self.in_transaction = false;
            return true;
        }
        meta.release
    }

    fn fail_command(&mut self, id: CommandId, resolved: bool, error: Error) {
        let release = self.settle(id, false);
        let event = if resolved {
            DriverEvent::StreamFailed { id, error, release }
        } else {
            DriverEvent::Completed {
                id,
                result: Err(error),
                release,
            }
        };
        self.events.push_back(event);
    }

    fn reject_backlog(&mut self, reason: &str) {
        for pending in std::mem::take(&mut self.backlog) {
            tracing::debug!(id = %pending.id, command = pending.command.name(), "rejected");
            self.events.push_back(DriverEvent::Completed {
                id: pending.id,
                result: Err(Error::going_away(reason)),
                release: true,
            });
        }
    }

    fn resolve_close(&mut self) {
        self.draining = false;
        if let Some(id) = self.close_id.take() {
            self.events.push_back(DriverEvent::Completed {
                id,
                result: Ok(CommandResult::Unit),
                release: true,
            });
        }
    }

    fn request_close(&mut self) {
        if !self.closing {
            self.closing = true;
            self.actions.push_back(TransportAction::Close);
        }
    }

    // ==================== Connect phase ====================

    fn on_greeting(&mut self, greeting: Handshake) {
        if self.state != ConnectionState::Started {
            tracing::warn!(state = ?self.state, "ignoring unexpected server greeting");
            return;
        }
        tracing::debug!(
            server = %greeting.server_version,
            connection_id = greeting.connection_id,
            plugin = greeting.auth_plugin.as_deref().unwrap_or("<none>"),
            "server greeting"
        );
        if !greeting.has_capability(capabilities::CLIENT_PROTOCOL_41) {
            return self.fail_connect(connection_error(format!(
                "server {} does not support protocol 4.1",
                greeting.server_version
            )));
        }
        let negotiated = self.config.capability_flags() & greeting.capabilities;
        self.engine.set_capabilities(negotiated);
        self.state = ConnectionState::Made;

        let server_tls = greeting.has_capability(capabilities::CLIENT_SSL);
        if self.config.requires_tls() && !server_tls {
            return self.fail_connect(ssl_error("TLS is required but the server does not offer it"));
        }
        let tls = self.config.tls_options().filter(|_| server_tls);
        self.greeting = Some(greeting);

        match tls {
            Some(options) => {
                self.state = ConnectionState::SslStartup;
                let params = self.config.login_params(negotiated);
                self.engine.start(INTERNAL, Box::new(SslRequest::new(&params)));
                self.actions.push_back(TransportAction::UpgradeTls {
                    server_name: self.config.tls_server_name(),
                    options,
                });
            }
            None => {
                let secure = self.config.socket.is_some();
                self.send_handshake_response(secure);
            }
        }
    }

    fn send_handshake_response(&mut self, secure: bool) {
        let (Some(connect), Some(greeting)) = (self.connect_id, self.greeting.as_ref()) else {
            return;
        };
        let auth = AuthContext {
            scramble: greeting.auth_scramble().to_vec(),
            password: self.config.password.clone().unwrap_or_default(),
            secure,
            allow_cleartext: self.config.allow_cleartext_password,
        };
        let plugin = match self.registry.for_handshake(greeting, &auth) {
            Ok(plugin) => plugin,
            Err(error) => return self.fail_connect(error),
        };
        let mut caps = self.engine.capabilities();
        if self.tls_active {
            caps |= capabilities::CLIENT_SSL;
        }
        let exchange = AuthExchange::new(plugin, self.registry.clone(), auth);
        let response = HandshakeResponse::new(self.config.login_params(caps), exchange);
        self.state = ConnectionState::AwaitingResponse;
        self.engine.start(connect, Box::new(response));
    }

    fn on_connect_step(&mut self, result: Result<CommandResult>) {
        if let Err(error) = result {
            return self.fail_connect(error);
        }
        match self.state {
            ConnectionState::AwaitingResponse => match self.config.set_names_sql() {
                Some(sql) => {
                    tracing::debug!(%sql, "applying session settings");
                    self.state = ConnectionState::SetEnv;
                    if let Some(connect) = self.connect_id {
                        self.engine.start(connect, Box::new(Query::new(sql)));
                    }
                }
                None => self.finish_connect(),
            },
            ConnectionState::SetEnv => self.finish_connect(),
            state => tracing::warn!(?state, "unexpected connect completion"),
        }
    }

    fn finish_connect(&mut self) {
        let Some(connect) = self.connect_id.take() else {
            return;
        };
        let info = ServerInfo {
            server_version: self
                .greeting
                .as_ref()
                .map(|g| g.server_version.clone())
                .unwrap_or_default(),
            connection_id: self.greeting.as_ref().map_or(0, |g| g.connection_id),
            capabilities: self.engine.capabilities(),
            auth_plugin: self
                .greeting
                .as_ref()
                .and_then(|g| g.auth_plugin.clone())
                .unwrap_or_else(|| "mysql_native_password".to_string()),
            tls: self.tls_active,
            compressed: self.engine.is_compressed(),
        };
        tracing::debug!(
            id = %connect,
            connection_id = info.connection_id,
            tls = info.tls,
            compressed = info.compressed,
            "connected"
        );
        self.state = ConnectionState::Ok;
        self.server_info = Some(info.clone());
        self.events.push_back(DriverEvent::Completed {
            id: connect,
            result: Ok(CommandResult::Connected(info)),
            release: true,
        });
    }

    fn fail_connect(&mut self, error: Error) {
        tracing::debug!(%error, state = ?self.state, "connect failed");
        self.engine.abort();
        self.engine.take_outbound();
        self.state = ConnectionState::Unusable;
        if let Some(connect) = self.connect_id.take() {
            self.events.push_back(DriverEvent::Completed {
                id: connect,
                result: Err(error),
                release: true,
            });
        } else {
            self.events.push_back(DriverEvent::ConnectionError(error));
        }
        self.reject_backlog("connection failed");
        self.resolve_close();
        self.request_close();
    }

    fn fail_session(&mut self, error: Error) {
        let summary = error.to_string();
        self.state = ConnectionState::Unusable;
        self.in_transaction = false;
        match self.engine.abort() {
            Some((id, resolved)) => {
                self.fail_command(id, resolved, error);
                self.events
                    .push_back(DriverEvent::ConnectionError(disconnected(summary.clone())));
            }
            None => self.events.push_back(DriverEvent::ConnectionError(error)),
        }
        self.reject_backlog(&format!("connection lost: {summary}"));
        self.resolve_close();
        self.request_close();
    }
}
