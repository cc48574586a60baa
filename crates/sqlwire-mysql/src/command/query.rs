//! `COM_QUERY` and the result-set reader it shares with `COM_STMT_EXECUTE`.

use std::sync::Arc;

use sqlwire_core::{ColumnInfo, Error, Result, Row};

use super::{
    Columns, Command, CommandContext, CommandResult, EncodeContext, QueryResult, column_info,
    command_payload, unexpected,
};
use crate::buffer::Buffer;
use crate::codec::{decode_binary_row, decode_text_row};
use crate::column::ColumnDefinition;
use crate::error::{protocol_error, protocol_error_with_data, query_error};
use crate::infile::LocalInfileHandler;
use crate::message::{ErrPacket, Expect, Message};
use crate::protocol::{CommandCode, capabilities, server_status};

/// LOCAL INFILE contents are sent in packets of at most this size.
const INFILE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for OK, ERR, LOCAL INFILE or a column count.
    Header,
    Columns { remaining: u64 },
    ColumnsEof,
    Rows,
    Done,
}

/// Row encoding of the result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowFormat {
    Text,
    Binary,
}

/// Reads one or more result sets, streaming rows through the context.
///
/// The caller's handle is resolved with the first result: an OK summary
/// when the response has no rows and nothing follows, otherwise a stream.
#[derive(Debug)]
pub(crate) struct ResultSetReader {
    format: RowFormat,
    phase: Phase,
    columns: Vec<ColumnDefinition>,
    shared: Option<(Columns, Arc<ColumnInfo>)>,
    resolved: bool,
    outcome: Option<QueryResult>,
    row_error: Option<Error>,
    row_count: u64,
}

impl ResultSetReader {
    pub(crate) fn new(format: RowFormat) -> Self {
        Self {
            format,
            phase: Phase::Header,
            columns: Vec::new(),
            shared: None,
            resolved: false,
            outcome: None,
            row_error: None,
            row_count: 0,
        }
    }

    pub(crate) fn expect(&self) -> Expect {
        match self.phase {
            Phase::Header | Phase::Done => Expect::ResultHeader,
            Phase::Columns { .. } | Phase::ColumnsEof => Expect::Columns,
            Phase::Rows => Expect::Rows,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Handle one message. Returns `Some(path)` for a LOCAL INFILE request,
    /// which only the owning command can satisfy.
    pub(crate) fn on_next(
        &mut self,
        message: Message,
        ctx: &mut CommandContext,
        owner: &str,
    ) -> Result<Option<String>> {
        match (self.phase, message) {
            (Phase::Header, Message::Ok(ok)) => {
                self.finish_result(QueryResult::from(&ok), ctx);
            }
            (Phase::Header, Message::LocalInFileRequest(path)) => return Ok(Some(path)),
            (Phase::Header, Message::Payload(payload)) => {
                let mut buf = Buffer::from_vec(payload);
                let count = buf
                    .read_lenenc_int()?
                    .filter(|&n| n > 0)
                    .ok_or_else(|| protocol_error("invalid result set column count"))?;
                tracing::trace!(columns = count, "result set header");
                self.columns = Vec::with_capacity(usize::try_from(count).unwrap_or(0).min(4096));
                self.phase = Phase::Columns { remaining: count };
            }
            (Phase::Columns { remaining }, Message::Payload(payload)) => {
                let column = ColumnDefinition::parse(&payload)
                    .map_err(|e| protocol_error_with_data(format!("bad column definition: {e}"), &payload))?;
                self.columns.push(column);
                let remaining = remaining - 1;
                if remaining > 0 {
                    self.phase = Phase::Columns { remaining };
                } else if ctx.has_capability(capabilities::CLIENT_DEPRECATE_EOF) {
                    self.start_rows(ctx);
                } else {
                    self.phase = Phase::ColumnsEof;
                }
            }
            (Phase::ColumnsEof, Message::Eof(_)) => self.start_rows(ctx),
            (Phase::Rows, Message::Payload(payload)) => self.on_row(&payload, ctx),
            (Phase::Rows, Message::Eof(eof)) => {
                let summary = QueryResult {
                    warnings: eof.warnings,
                    status_flags: eof.status_flags,
                    ..QueryResult::default()
                };
                self.finish_result(summary, ctx);
            }
            (Phase::Rows, Message::Ok(ok)) => self.finish_result(QueryResult::from(&ok), ctx),
            (_, other) => return Err(unexpected(owner, &other)),
        }
        Ok(None)
    }

    fn start_rows(&mut self, ctx: &mut CommandContext) {
        let columns: Columns = Arc::from(std::mem::take(&mut self.columns));
        let info = column_info(&columns);
        if self.resolved {
            ctx.emit_columns(Arc::clone(&columns));
        } else {
            ctx.resolve(CommandResult::Stream(Arc::clone(&columns)));
            self.resolved = true;
        }
        self.shared = Some((columns, info));
        self.phase = Phase::Rows;
    }

    fn on_row(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        let Some((columns, info)) = &self.shared else {
            return;
        };
        let decoded = match self.format {
            RowFormat::Text => decode_text_row(payload, columns),
            RowFormat::Binary => decode_binary_row(payload, columns),
        };
        match decoded {
            Ok(values) => {
                self.row_count += 1;
                ctx.emit_row(Row::with_columns(Arc::clone(info), values));
            }
            Err(e) => {
                // Keep draining so the connection stays in sync.
                tracing::warn!(error = %e, "failed to decode row");
                if self.row_error.is_none() {
                    self.row_error = Some(protocol_error_with_data(
                        format!("failed to decode row: {e}"),
                        payload,
                    ));
                }
            }
        }
    }

    fn finish_result(&mut self, summary: QueryResult, ctx: &mut CommandContext) {
        let more = summary.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0;
        tracing::debug!(rows = self.row_count, more_results = more, "result finished");
        self.row_count = 0;
        if !self.resolved && more {
            // Multi-result response opening with an OK: stream it.
            ctx.resolve(CommandResult::Stream(Arc::from(Vec::new())));
            self.resolved = true;
        }
        if self.resolved {
            ctx.end_result(summary.clone());
        }
        self.outcome = Some(summary);
        self.phase = if more { Phase::Header } else { Phase::Done };
    }

    /// Terminal result. A streamed response reports its last summary.
    pub(crate) fn complete(&mut self) -> Result<CommandResult> {
        if let Some(err) = self.row_error.take() {
            return Err(err);
        }
        Ok(CommandResult::Done(self.outcome.take().unwrap_or_default()))
    }
}

/// `COM_QUERY`: a text-protocol statement.
pub struct Query {
    sql: String,
    follow_up: Option<String>,
    reader: ResultSetReader,
    infile: Option<Arc<dyn LocalInfileHandler>>,
    infile_error: Option<Error>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("sql", &self.sql)
            .field("phase", &self.reader.phase)
            .finish_non_exhaustive()
    }
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            follow_up: None,
            reader: ResultSetReader::new(RowFormat::Text),
            infile: None,
            infile_error: None,
        }
    }

    /// Run `sql` under the same handle once this statement succeeds.
    pub fn followed_by(mut self, sql: impl Into<String>) -> Self {
        self.follow_up = Some(sql.into());
        self
    }

    /// Serve `LOAD DATA LOCAL INFILE` requests with `handler`.
    pub fn with_local_infile(mut self, handler: Option<Arc<dyn LocalInfileHandler>>) -> Self {
        self.infile = handler;
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn send_infile(&mut self, path: &str, ctx: &mut CommandContext) {
        let contents = match &self.infile {
            Some(handler) => handler.load(path),
            None => Err(Error::usage(
                sqlwire_core::UsageErrorKind::InvalidState,
                "LOCAL INFILE requested but no handler is configured",
            )),
        };
        match contents {
            Ok(bytes) => {
                tracing::debug!(path, bytes = bytes.len(), "sending LOCAL INFILE contents");
                for chunk in bytes.chunks(INFILE_CHUNK) {
                    ctx.write_packet(chunk.to_vec());
                }
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "LOCAL INFILE handler failed");
                self.infile_error = Some(e);
            }
        }
        ctx.write_packet(Vec::new());
    }
}

impl Command for Query {
    fn name(&self) -> &'static str {
        "Query"
    }

    fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
        tracing::debug!(sql = %self.sql, "query");
        Ok(command_payload(CommandCode::Query, self.sql.as_bytes()))
    }

    fn expect(&self) -> Expect {
        self.reader.expect()
    }

    fn on_next(&mut self, message: Message, ctx: &mut CommandContext) -> Result<()> {
        if let Some(path) = self.reader.on_next(message, ctx, "Query")? {
            self.send_infile(&path, ctx);
            return Ok(());
        }
        if self.reader.is_finished() && !self.reader.is_resolved() {
            if let Some(next) = self.follow_up.take() {
                if self.reader.row_error.is_none() && self.infile_error.is_none() {
                    ctx.chain(Box::new(
                        Query::new(next).with_local_infile(self.infile.clone()),
                    ));
                }
            }
        }
        Ok(())
    }

    fn on_complete(&mut self) -> Result<CommandResult> {
        if let Some(err) = self.infile_error.take() {
            return Err(err);
        }
        self.reader.complete()
    }

    fn on_error(&mut self, err: &ErrPacket) -> Error {
        query_error(err, Some(&self.sql))
    }

    fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::FieldType;
    use crate::column::tests::column_packet;
    use crate::command::Effect;
    use crate::message::{EofPacket, OkPacket};
    use sqlwire_core::Value;

    fn ctx(deprecate_eof: bool) -> CommandContext {
        let mut caps = capabilities::DEFAULT_CLIENT_FLAGS;
        if !deprecate_eof {
            caps &= !capabilities::CLIENT_DEPRECATE_EOF;
        }
        CommandContext::new(caps, 0)
    }

    fn ok(status: u16) -> Message {
        Message::Ok(OkPacket {
            status_flags: status,
            ..OkPacket::default()
        })
    }

    fn text_row(fields: &[&str]) -> Message {
        let mut buf = Buffer::new();
        for f in fields {
            buf.put_lenenc_str(f);
        }
        Message::Payload(buf.into_vec())
    }

    #[test]
    fn test_ok_only_query() {
        let mut q = Query::new("UPDATE t SET a = 1");
        let mut c = ctx(true);
        assert_eq!(q.expect(), Expect::ResultHeader);
        q.on_next(
            Message::Ok(OkPacket {
                affected_rows: 3,
                ..OkPacket::default()
            }),
            &mut c,
        )
        .unwrap();
        assert!(q.is_finished());
        assert!(c.effects.is_empty());
        match q.on_complete().unwrap() {
            CommandResult::Done(r) => assert_eq!(r.affected_rows, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_select_with_legacy_eof() {
        let mut q = Query::new("SELECT 1");
        let mut c = ctx(false);
        q.on_next(Message::Payload(vec![1]), &mut c).unwrap();
        assert_eq!(q.expect(), Expect::Columns);
        q.on_next(
            Message::Payload(column_packet("1", FieldType::LongLong, 0, 1)),
            &mut c,
        )
        .unwrap();
        assert!(c.effects.is_empty());
        q.on_next(Message::Eof(EofPacket::default()), &mut c).unwrap();
        assert_eq!(q.expect(), Expect::Rows);
        q.on_next(text_row(&["1"]), &mut c).unwrap();
        q.on_next(
            Message::Eof(EofPacket {
                warnings: 0,
                status_flags: server_status::SERVER_STATUS_AUTOCOMMIT,
            }),
            &mut c,
        )
        .unwrap();
        assert!(q.is_finished());

        let effects = std::mem::take(&mut c.effects);
        assert!(matches!(&effects[0], Effect::Resolve(CommandResult::Stream(cols)) if cols.len() == 1));
        match &effects[1] {
            Effect::Row(row) => {
                assert_eq!(row.get(0), Some(&Value::BigInt(1)));
                assert_eq!(row.get_by_name("1"), Some(&Value::BigInt(1)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&effects[2], Effect::ResultEnd(_)));
        assert!(q.on_complete().is_ok());
    }

    #[test]
    fn test_select_with_deprecate_eof() {
        let mut q = Query::new("SELECT a FROM t");
        let mut c = ctx(true);
        q.on_next(Message::Payload(vec![1]), &mut c).unwrap();
        q.on_next(
            Message::Payload(column_packet("a", FieldType::VarString, 0, 10)),
            &mut c,
        )
        .unwrap();
        assert_eq!(q.expect(), Expect::Rows);
        // MySQL 5.7 text row whose first column is empty starts with 0x00.
        q.on_next(Message::Payload(vec![0x00]), &mut c).unwrap();
        q.on_next(ok(0), &mut c).unwrap();
        assert!(q.is_finished());
        let rows: Vec<_> = c
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Row(r) => Some(r.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0), Some(&Value::Text(String::new())));
    }

    #[test]
    fn test_multi_result_streams_each_set() {
        let mut q = Query::new("CALL p()");
        let mut c = ctx(true);
        q.on_next(Message::Payload(vec![1]), &mut c).unwrap();
        q.on_next(
            Message::Payload(column_packet("x", FieldType::Long, 0, 11)),
            &mut c,
        )
        .unwrap();
        q.on_next(text_row(&["5"]), &mut c).unwrap();
        q.on_next(ok(server_status::SERVER_MORE_RESULTS_EXISTS), &mut c).unwrap();
        assert!(!q.is_finished());
        assert_eq!(q.expect(), Expect::ResultHeader);
        q.on_next(ok(0), &mut c).unwrap();
        assert!(q.is_finished());

        let kinds: Vec<&str> = c
            .effects
            .iter()
            .map(|e| match e {
                Effect::Resolve(_) => "resolve",
                Effect::Row(_) => "row",
                Effect::ResultEnd(_) => "end",
                Effect::Columns(_) => "columns",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["resolve", "row", "end", "end"]);
    }

    #[test]
    fn test_bad_row_drains_then_fails() {
        let mut q = Query::new("SELECT a FROM t");
        let mut c = ctx(true);
        q.on_next(Message::Payload(vec![1]), &mut c).unwrap();
        q.on_next(
            Message::Payload(column_packet("a", FieldType::VarString, 0, 10)),
            &mut c,
        )
        .unwrap();
        // Declares 9 bytes, carries 1.
        q.on_next(Message::Payload(vec![9, b'x']), &mut c).unwrap();
        q.on_next(text_row(&["ok"]), &mut c).unwrap();
        q.on_next(ok(0), &mut c).unwrap();
        assert!(q.is_finished());
        assert!(matches!(q.on_complete(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unexpected_message_is_protocol_error() {
        let mut q = Query::new("SELECT 1");
        let mut c = ctx(true);
        let err = q
            .on_next(Message::Eof(EofPacket::default()), &mut c)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_follow_up_chains_after_ok() {
        let mut q = Query::new("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE").followed_by("START TRANSACTION");
        let mut c = ctx(true);
        q.on_next(ok(0), &mut c).unwrap();
        let Some(Effect::Chain(next)) = c.effects.pop() else {
            panic!("expected chain");
        };
        assert_eq!(next.name(), "Query");
        assert!(next.resets_sequence());
    }

    struct Fixed(std::result::Result<Vec<u8>, String>);

    impl LocalInfileHandler for Fixed {
        fn load(&self, _path: &str) -> Result<Vec<u8>> {
            self.0.clone().map_err(Error::Custom)
        }
    }

    #[test]
    fn test_local_infile_streams_then_terminates() {
        let handler: Arc<dyn LocalInfileHandler> = Arc::new(Fixed(Ok(b"1,2\n3,4\n".to_vec())));
        let mut q = Query::new("LOAD DATA LOCAL INFILE 'x.csv' INTO TABLE t").with_local_infile(Some(handler));
        let mut c = ctx(true);
        q.on_next(Message::LocalInFileRequest("x.csv".into()), &mut c).unwrap();
        let writes: Vec<usize> = c
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Write(p) => Some(p.len()),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![8, 0]);
        q.on_next(ok(0), &mut c).unwrap();
        assert!(q.on_complete().is_ok());
    }

    #[test]
    fn test_local_infile_failure_sends_empty_packet() {
        let handler: Arc<dyn LocalInfileHandler> = Arc::new(Fixed(Err("denied".into())));
        let mut q = Query::new("LOAD DATA LOCAL INFILE 'x.csv' INTO TABLE t").with_local_infile(Some(handler));
        let mut c = ctx(true);
        q.on_next(Message::LocalInFileRequest("x.csv".into()), &mut c).unwrap();
        assert!(matches!(c.effects.as_slice(), [Effect::Write(p)] if p.is_empty()));
        q.on_next(ok(0), &mut c).unwrap();
        assert!(q.on_complete().is_err());
    }
}
