//! Commands: one per protocol interaction.
//!
//! A command encodes its request payload, tells the engine which response
//! grammar it expects next, consumes the decoded messages routed to it and
//! finally yields a [`CommandResult`]. The engine treats one command as
//! current from dispatch until it reports itself finished.

use std::sync::Arc;

use serde::Serialize;
use sqlwire_core::{ColumnInfo, Error, Result, Row};

use crate::column::ColumnDefinition;
use crate::error::query_error;
use crate::message::{ErrPacket, Expect, Message, OkPacket};
use crate::protocol::{CommandCode, ProtocolState, server_status};
use crate::statement::{Statement, StatementCursor};

mod execute;
mod handshake;
mod prepare;
mod query;
mod simple;

pub use execute::{Execute, Fetch};
pub(crate) use handshake::AuthExchange;
pub use handshake::{AuthSwitchResponse, HandshakeResponse, LoginParams, SslRequest};
pub use prepare::Prepare;
pub use query::Query;
pub use simple::{Ping, Quit, StatementClose, StatementReset, Statistics};

/// Column metadata shared by every row of a result set.
pub type Columns = Arc<[ColumnDefinition]>;

/// Summary of an OK packet or result set terminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub status_flags: u16,
    pub info: String,
}

impl QueryResult {
    pub fn has_more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }
}

impl From<&OkPacket> for QueryResult {
    fn from(ok: &OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            status_flags: ok.status_flags,
            info: ok.info.clone(),
        }
    }
}

/// Details of an established session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub server_version: String,
    pub connection_id: u32,
    /// Capabilities both sides agreed on.
    pub capabilities: u32,
    pub auth_plugin: String,
    pub tls: bool,
    pub compressed: bool,
}

/// Rows returned by one `COM_STMT_FETCH`.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRows {
    pub rows: Vec<Row>,
    /// The server reported the cursor exhausted.
    pub done: bool,
}

/// Terminal value of a command.
#[derive(Debug, Clone)]
pub enum CommandResult {
    /// The connection handshake finished.
    Connected(ServerInfo),
    /// OK response without a result set.
    Done(QueryResult),
    /// A result set started; rows and terminators follow as stream events.
    Stream(Columns),
    Prepared(Statement),
    /// A server-side cursor was opened.
    Cursor(StatementCursor),
    Fetched(FetchedRows),
    Statistics(String),
    Unit,
}

/// Connection facts available while encoding.
#[derive(Debug, Clone, Copy)]
pub struct EncodeContext {
    /// Negotiated capabilities (the client set until the greeting arrives).
    pub capabilities: u32,
    pub status_flags: u16,
}

/// Side effects a command requests while handling a message.
pub enum Effect {
    /// Send a payload, continuing the current sequence.
    Write(Vec<u8>),
    /// Resolve the caller's handle before the command finishes.
    Resolve(CommandResult),
    /// Metadata of a result set after the first.
    Columns(Columns),
    Row(Row),
    /// A result set (or OK inside a multi-result response) ended.
    ResultEnd(QueryResult),
    /// Replace this command with another under the same handle.
    Chain(Box<dyn Command>),
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Effect::Write(p) => f.debug_tuple("Write").field(&p.len()).finish(),
            Effect::Resolve(r) => f.debug_tuple("Resolve").field(r).finish(),
            Effect::Columns(c) => f.debug_tuple("Columns").field(&c.len()).finish(),
            Effect::Row(r) => f.debug_tuple("Row").field(r).finish(),
            Effect::ResultEnd(s) => f.debug_tuple("ResultEnd").field(s).finish(),
            Effect::Chain(c) => f.debug_tuple("Chain").field(&c.name()).finish(),
        }
    }
}

/// What a command sees of the engine while handling a message.
#[derive(Debug)]
pub struct CommandContext {
    pub capabilities: u32,
    pub status_flags: u16,
    pub(crate) effects: Vec<Effect>,
}

impl CommandContext {
    pub(crate) fn new(capabilities: u32, status_flags: u16) -> Self {
        Self {
            capabilities,
            status_flags,
            effects: Vec::new(),
        }
    }

    pub fn has_capability(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }

    pub fn write_packet(&mut self, payload: Vec<u8>) {
        self.effects.push(Effect::Write(payload));
    }

    pub fn resolve(&mut self, result: CommandResult) {
        self.effects.push(Effect::Resolve(result));
    }

    pub fn emit_columns(&mut self, columns: Columns) {
        self.effects.push(Effect::Columns(columns));
    }

    pub fn emit_row(&mut self, row: Row) {
        self.effects.push(Effect::Row(row));
    }

    pub fn end_result(&mut self, summary: QueryResult) {
        self.effects.push(Effect::ResultEnd(summary));
    }

    pub fn chain(&mut self, next: Box<dyn Command>) {
        self.effects.push(Effect::Chain(next));
    }
}

/// A unit of work on the connection.
pub trait Command: Send {
    fn name(&self) -> &'static str;

    /// Build the request payload. Failing here never touches the wire.
    fn encode(&mut self, ctx: &EncodeContext) -> Result<Vec<u8>>;

    /// Protocol state to enter once the request is sent.
    fn parser_state_override(&self) -> Option<ProtocolState> {
        None
    }

    /// Response grammar for the next message.
    fn expect(&self) -> Expect {
        Expect::Response
    }

    fn on_next(&mut self, message: Message, ctx: &mut CommandContext) -> Result<()>;

    fn on_complete(&mut self) -> Result<CommandResult>;

    /// Translate a server ERR packet into this command's error.
    fn on_error(&mut self, err: &ErrPacket) -> Error {
        query_error(err, None)
    }

    fn is_finished(&self) -> bool;

    /// Commands that return `false` complete as soon as they are written.
    fn requires_exclusive_connection(&self) -> bool {
        true
    }

    /// Start a fresh sequence (next packet id 0) when dispatched.
    fn resets_sequence(&self) -> bool {
        true
    }

    /// Hold the completion for one tick so trailing bytes drain first.
    fn defers_completion(&self) -> bool {
        false
    }
}

/// `[code] + body` payload for a simple command.
pub(crate) fn command_payload(code: CommandCode, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(body.len() + 1);
    payload.push(code as u8);
    payload.extend_from_slice(body);
    payload
}

/// Row metadata for the core `Row` type.
pub(crate) fn column_info(columns: &[ColumnDefinition]) -> Arc<ColumnInfo> {
    Arc::new(ColumnInfo::new(
        columns.iter().map(|c| c.name.clone()).collect(),
    ))
}

/// A message no command phase accepts.
pub(crate) fn unexpected(command: &str, message: &Message) -> Error {
    crate::error::protocol_error(format!(
        "unexpected {} message during {}",
        message.name(),
        command
    ))
}
