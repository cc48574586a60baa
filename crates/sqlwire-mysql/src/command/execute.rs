//! `COM_STMT_EXECUTE` and `COM_STMT_FETCH`.

use std::sync::Arc;

use sqlwire_core::{Error, Result, Row, Value};

use super::query::{ResultSetReader, RowFormat};
use super::{
    Columns, Command, CommandContext, CommandResult, EncodeContext, FetchedRows, QueryResult,
    column_info, command_payload, unexpected,
};
use crate::buffer::Buffer;
use crate::codec::{decode_binary_row, encode_binary_param, param_type};
use crate::column::ColumnDefinition;
use crate::error::{protocol_error, protocol_error_with_data, query_error};
use crate::message::{ErrPacket, Expect, Message};
use crate::protocol::{CommandCode, server_status};
use crate::statement::{Params, Statement, StatementCursor};

const CURSOR_TYPE_NO_CURSOR: u8 = 0x00;
const CURSOR_TYPE_READ_ONLY: u8 = 0x01;

/// Build the `COM_STMT_EXECUTE` payload for already-bound values.
fn execute_payload(statement_id: u32, flags: u8, values: &[Value]) -> Result<Vec<u8>> {
    let mut buf = Buffer::with_capacity(16 + values.len() * 8);
    buf.put_u8(CommandCode::StmtExecute as u8);
    buf.put_u32(statement_id);
    buf.put_u8(flags);
    buf.put_u32(1);

    if !values.is_empty() {
        let mut bitmap = vec![0u8; values.len().div_ceil(8)];
        for (i, value) in values.iter().enumerate() {
            if matches!(value, Value::Null) {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        buf.put_bytes(&bitmap);
        // new-params-bound: types follow.
        buf.put_u8(1);
        for value in values {
            let (ty, unsigned) = param_type(value);
            buf.put_u8(ty as u8);
            buf.put_u8(if unsigned { 0x80 } else { 0 });
        }
        for value in values {
            encode_binary_param(&mut buf, value)?;
        }
    }
    Ok(buf.into_vec())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorPhase {
    Header,
    Columns { remaining: u64 },
    Terminator,
    Done,
}

/// Response handling for an execute that opens a cursor: metadata only.
#[derive(Debug)]
struct CursorOpen {
    phase: CursorPhase,
    columns: Vec<ColumnDefinition>,
    summary: Option<QueryResult>,
}

enum Mode {
    Stream(ResultSetReader),
    Cursor(CursorOpen),
}

/// Execute a prepared statement with bound parameters.
pub struct Execute {
    statement: Statement,
    payload: Vec<u8>,
    mode: Mode,
}

impl std::fmt::Debug for Execute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execute")
            .field("statement", &self.statement.id())
            .field("cursor", &matches!(self.mode, Mode::Cursor(_)))
            .finish_non_exhaustive()
    }
}

impl Execute {
    /// Bind and encode up front so misuse is reported before anything is queued.
    pub fn new(statement: Statement, params: Params) -> Result<Self> {
        Self::build(statement, params, false)
    }

    /// Execute with a read-only server-side cursor; rows are pulled with [`Fetch`].
    pub fn with_cursor(statement: Statement, params: Params) -> Result<Self> {
        Self::build(statement, params, true)
    }

    fn build(statement: Statement, params: Params, cursor: bool) -> Result<Self> {
        statement.ensure_open()?;
        let values = statement.bind(params)?;
        let flags = if cursor {
            CURSOR_TYPE_READ_ONLY
        } else {
            CURSOR_TYPE_NO_CURSOR
        };
        let payload = execute_payload(statement.id(), flags, &values)?;
        let mode = if cursor {
            Mode::Cursor(CursorOpen {
                phase: CursorPhase::Header,
                columns: Vec::new(),
                summary: None,
            })
        } else {
            Mode::Stream(ResultSetReader::new(RowFormat::Binary))
        };
        Ok(Self {
            statement,
            payload,
            mode,
        })
    }

    fn on_cursor_message(
        open: &mut CursorOpen,
        message: Message,
    ) -> Result<()> {
        match (open.phase, message) {
            (CursorPhase::Header, Message::Ok(ok)) => {
                open.summary = Some(QueryResult::from(&ok));
                open.phase = CursorPhase::Done;
            }
            (CursorPhase::Header, Message::Payload(payload)) => {
                let mut buf = Buffer::from_vec(payload);
                let count = buf
                    .read_lenenc_int()?
                    .filter(|&n| n > 0)
                    .ok_or_else(|| protocol_error("invalid result set column count"))?;
                open.phase = CursorPhase::Columns { remaining: count };
            }
            (CursorPhase::Columns { remaining }, Message::Payload(payload)) => {
                let column = ColumnDefinition::parse(&payload).map_err(|e| {
                    protocol_error_with_data(format!("bad column definition: {e}"), &payload)
                })?;
                open.columns.push(column);
                open.phase = if remaining > 1 {
                    CursorPhase::Columns {
                        remaining: remaining - 1,
                    }
                } else {
                    CursorPhase::Terminator
                };
            }
            (CursorPhase::Terminator, Message::Eof(eof)) => {
                tracing::debug!(
                    cursor = eof.status_flags & server_status::SERVER_STATUS_CURSOR_EXISTS != 0,
                    "cursor metadata complete"
                );
                open.phase = CursorPhase::Done;
            }
            (CursorPhase::Terminator, Message::Ok(_)) => open.phase = CursorPhase::Done,
            (_, other) => return Err(unexpected("Execute", &other)),
        }
        Ok(())
    }
}

impl Command for Execute {
    fn name(&self) -> &'static str {
        "Execute"
    }

    fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
        // The statement may have been closed while this was queued.
        self.statement.ensure_open()?;
        tracing::debug!(statement = self.statement.id(), "execute");
        Ok(std::mem::take(&mut self.payload))
    }

    fn expect(&self) -> Expect {
        match &self.mode {
            Mode::Stream(reader) => reader.expect(),
            Mode::Cursor(open) => match open.phase {
                CursorPhase::Header | CursorPhase::Done => Expect::ResultHeader,
                CursorPhase::Columns { .. } => Expect::Columns,
                CursorPhase::Terminator => Expect::Rows,
            },
        }
    }

    fn on_next(&mut self, message: Message, ctx: &mut CommandContext) -> Result<()> {
        match &mut self.mode {
            Mode::Stream(reader) => match reader.on_next(message, ctx, "Execute")? {
                Some(_) => Err(protocol_error("LOCAL INFILE request during statement execute")),
                None => Ok(()),
            },
            Mode::Cursor(open) => Self::on_cursor_message(open, message),
        }
    }

    fn on_complete(&mut self) -> Result<CommandResult> {
        match &mut self.mode {
            Mode::Stream(reader) => reader.complete(),
            Mode::Cursor(open) => {
                if let Some(summary) = open.summary.take() {
                    return Ok(CommandResult::Done(summary));
                }
                let columns: Columns = Arc::from(std::mem::take(&mut open.columns));
                Ok(CommandResult::Cursor(StatementCursor::new(
                    &self.statement,
                    columns,
                )))
            }
        }
    }

    fn on_error(&mut self, err: &ErrPacket) -> Error {
        query_error(err, Some(self.statement.sql()))
    }

    fn is_finished(&self) -> bool {
        match &self.mode {
            Mode::Stream(reader) => reader.is_finished(),
            Mode::Cursor(open) => open.phase == CursorPhase::Done,
        }
    }
}

/// Pull up to `rows` rows from an open cursor.
#[derive(Debug)]
pub struct Fetch {
    cursor: StatementCursor,
    rows_requested: u32,
    rows: Vec<Row>,
    row_error: Option<Error>,
    done: Option<bool>,
}

impl Fetch {
    pub fn new(cursor: StatementCursor, rows: u32) -> Result<Self> {
        cursor.ensure_open()?;
        Ok(Self {
            cursor,
            rows_requested: rows,
            rows: Vec::new(),
            row_error: None,
            done: None,
        })
    }
}

impl Command for Fetch {
    fn name(&self) -> &'static str {
        "Fetch"
    }

    fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
        self.cursor.ensure_open()?;
        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(&self.cursor.statement_id().to_le_bytes());
        body.extend_from_slice(&self.rows_requested.to_le_bytes());
        Ok(command_payload(CommandCode::StmtFetch, &body))
    }

    fn expect(&self) -> Expect {
        Expect::Rows
    }

    fn on_next(&mut self, message: Message, _ctx: &mut CommandContext) -> Result<()> {
        let status = match message {
            Message::Payload(payload) => {
                let columns = self.cursor.columns();
                match decode_binary_row(&payload, columns) {
                    Ok(values) => {
                        let info = self
                            .rows
                            .first()
                            .map_or_else(|| column_info(columns), Row::column_info);
                        self.rows.push(Row::with_columns(info, values));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to decode fetched row");
                        self.row_error.get_or_insert_with(|| {
                            protocol_error_with_data(format!("failed to decode row: {e}"), &payload)
                        });
                    }
                }
                return Ok(());
            }
            Message::Eof(eof) => eof.status_flags,
            Message::Ok(ok) => ok.status_flags,
            other => return Err(unexpected(self.name(), &other)),
        };
        let done = status & server_status::SERVER_STATUS_LAST_ROW_SENT != 0;
        tracing::debug!(rows = self.rows.len(), done, "fetch finished");
        self.done = Some(done);
        Ok(())
    }

    fn on_complete(&mut self) -> Result<CommandResult> {
        if let Some(err) = self.row_error.take() {
            return Err(err);
        }
        let done = self.done.unwrap_or(false);
        if done {
            self.cursor.mark_exhausted();
        }
        Ok(CommandResult::Fetched(FetchedRows {
            rows: std::mem::take(&mut self.rows),
            done,
        }))
    }

    fn is_finished(&self) -> bool {
        self.done.is_some()
    }

    fn defers_completion(&self) -> bool {
        true
    }
}
