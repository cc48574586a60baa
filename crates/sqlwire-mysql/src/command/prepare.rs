//! `COM_STMT_PREPARE`.

use std::collections::VecDeque;
use std::sync::Arc;

use sqlwire_core::{Error, Result};

use super::{Command, CommandContext, CommandResult, EncodeContext, command_payload, unexpected};
use crate::column::ColumnDefinition;
use crate::error::{protocol_error, protocol_error_with_data, query_error};
use crate::message::{ErrPacket, Expect, Message, PrepareOk};
use crate::protocol::{CommandCode, capabilities};
use crate::statement::{Statement, rewrite_named_params};

/// Metadata packets still owed after PREPARE_OK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Param,
    ParamEof,
    Column,
    ColumnEof,
}

/// Prepare a statement; `:name` placeholders are rewritten to `?`.
#[derive(Debug)]
pub struct Prepare {
    sql: String,
    rewritten: String,
    names: Vec<String>,
    header: Option<PrepareOk>,
    pending: VecDeque<Pending>,
    params: Vec<ColumnDefinition>,
    columns: Vec<ColumnDefinition>,
}

impl Prepare {
    pub fn new(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let (rewritten, names) = rewrite_named_params(&sql);
        Self {
            sql,
            rewritten,
            names,
            header: None,
            pending: VecDeque::new(),
            params: Vec::new(),
            columns: Vec::new(),
        }
    }

    fn on_header(&mut self, ok: PrepareOk, deprecate_eof: bool) {
        tracing::debug!(
            statement = ok.statement_id,
            params = ok.num_params,
            columns = ok.num_columns,
            "statement prepared"
        );
        let eofs = !deprecate_eof;
        self.pending
            .extend(std::iter::repeat_n(Pending::Param, usize::from(ok.num_params)));
        if eofs && ok.num_params > 0 {
            self.pending.push_back(Pending::ParamEof);
        }
        self.pending
            .extend(std::iter::repeat_n(Pending::Column, usize::from(ok.num_columns)));
        if eofs && ok.num_columns > 0 {
            self.pending.push_back(Pending::ColumnEof);
        }
        self.params.reserve(usize::from(ok.num_params));
        self.columns.reserve(usize::from(ok.num_columns));
        self.header = Some(ok);
    }

    fn on_definition(&mut self, payload: &[u8]) -> Result<()> {
        while matches!(
            self.pending.front(),
            Some(Pending::ParamEof | Pending::ColumnEof)
        ) {
            self.pending.pop_front();
        }
        let column = ColumnDefinition::parse(payload).map_err(|e| {
            protocol_error_with_data(format!("bad column definition: {e}"), payload)
        })?;
        match self.pending.pop_front() {
            Some(Pending::Param) => self.params.push(column),
            Some(Pending::Column) => self.columns.push(column),
            _ => return Err(protocol_error("more column definitions than announced")),
        }
        Ok(())
    }
}

impl Command for Prepare {
    fn name(&self) -> &'static str {
        "Prepare"
    }

    fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
        Ok(command_payload(
            CommandCode::StmtPrepare,
            self.rewritten.as_bytes(),
        ))
    }

    fn expect(&self) -> Expect {
        if self.header.is_some() {
            Expect::Columns
        } else {
            Expect::PrepareOk
        }
    }

    fn on_next(&mut self, message: Message, ctx: &mut CommandContext) -> Result<()> {
        match message {
            Message::PrepareOk(ok) if self.header.is_none() => {
                self.on_header(ok, ctx.has_capability(capabilities::CLIENT_DEPRECATE_EOF));
                Ok(())
            }
            Message::Payload(payload) if self.header.is_some() => self.on_definition(&payload),
            Message::Eof(_) if self.header.is_some() => {
                if matches!(
                    self.pending.front(),
                    Some(Pending::ParamEof | Pending::ColumnEof)
                ) {
                    self.pending.pop_front();
                } else {
                    tracing::trace!("ignoring EOF during prepare");
                }
                Ok(())
            }
            other => Err(unexpected(self.name(), &other)),
        }
    }

    fn on_complete(&mut self) -> Result<CommandResult> {
        let header = self
            .header
            .take()
            .ok_or_else(|| protocol_error("prepare finished without PREPARE_OK"))?;
        Ok(CommandResult::Prepared(Statement::new(
            header.statement_id,
            std::mem::take(&mut self.sql),
            std::mem::take(&mut self.names),
            Arc::from(std::mem::take(&mut self.params)),
            Arc::from(std::mem::take(&mut self.columns)),
        )))
    }

    fn on_error(&mut self, err: &ErrPacket) -> Error {
        query_error(err, Some(&self.sql))
    }

    fn is_finished(&self) -> bool {
        self.header.is_some() && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::FieldType;
    use crate::column::tests::column_packet;
    use crate::message::EofPacket;
    use crate::protocol::capabilities::DEFAULT_CLIENT_FLAGS;

    fn header(params: u16, columns: u16) -> Message {
        Message::PrepareOk(PrepareOk {
            statement_id: 9,
            num_columns: columns,
            num_params: params,
            warnings: 0,
        })
    }

    fn def(name: &str) -> Message {
        Message::Payload(column_packet(name, FieldType::Long, 0, 11))
    }

    #[test]
    fn test_prepare_with_eofs() {
        let mut p = Prepare::new("SELECT a, b FROM t WHERE id = ?");
        let mut ctx = CommandContext::new(
            DEFAULT_CLIENT_FLAGS & !capabilities::CLIENT_DEPRECATE_EOF,
            0,
        );
        assert_eq!(p.expect(), Expect::PrepareOk);
        p.on_next(header(1, 2), &mut ctx).unwrap();
        assert_eq!(p.expect(), Expect::Columns);
        p.on_next(def("?"), &mut ctx).unwrap();
        p.on_next(Message::Eof(EofPacket::default()), &mut ctx).unwrap();
        p.on_next(def("a"), &mut ctx).unwrap();
        assert!(!p.is_finished());
        p.on_next(def("b"), &mut ctx).unwrap();
        assert!(!p.is_finished());
        p.on_next(Message::Eof(EofPacket::default()), &mut ctx).unwrap();
        assert!(p.is_finished());

        let CommandResult::Prepared(stmt) = p.on_complete().unwrap() else {
            panic!("expected statement");
        };
        assert_eq!(stmt.id(), 9);
        assert_eq!(stmt.param_count(), 1);
        assert_eq!(stmt.columns().len(), 2);
        assert_eq!(stmt.columns()[1].name, "b");
    }

    #[test]
    fn test_prepare_with_deprecate_eof() {
        let mut p = Prepare::new("INSERT INTO t VALUES (?, ?)");
        let mut ctx = CommandContext::new(DEFAULT_CLIENT_FLAGS, 0);
        p.on_next(header(2, 0), &mut ctx).unwrap();
        p.on_next(def("?"), &mut ctx).unwrap();
        p.on_next(def("?"), &mut ctx).unwrap();
        assert!(p.is_finished());
    }

    #[test]
    fn test_prepare_without_metadata_finishes_on_header() {
        let mut p = Prepare::new("DO 1");
        let mut ctx = CommandContext::new(DEFAULT_CLIENT_FLAGS, 0);
        p.on_next(header(0, 0), &mut ctx).unwrap();
        assert!(p.is_finished());
    }

    #[test]
    fn test_named_placeholders_are_rewritten() {
        let mut p = Prepare::new("SELECT * FROM t WHERE a = :a AND b = :b");
        let payload = p
            .encode(&EncodeContext {
                capabilities: DEFAULT_CLIENT_FLAGS,
                status_flags: 0,
            })
            .unwrap();
        assert_eq!(payload[0], 0x16);
        assert_eq!(&payload[1..], b"SELECT * FROM t WHERE a = ? AND b = ?");

        let mut ctx = CommandContext::new(DEFAULT_CLIENT_FLAGS, 0);
        p.on_next(header(2, 0), &mut ctx).unwrap();
        p.on_next(def("?"), &mut ctx).unwrap();
        p.on_next(def("?"), &mut ctx).unwrap();
        let CommandResult::Prepared(stmt) = p.on_complete().unwrap() else {
            panic!("expected statement");
        };
        assert_eq!(stmt.param_names(), ["a", "b"]);
        assert_eq!(stmt.sql(), "SELECT * FROM t WHERE a = :a AND b = :b");
    }

    #[test]
    fn test_extra_definition_is_protocol_error() {
        let mut p = Prepare::new("SELECT 1");
        let mut ctx = CommandContext::new(DEFAULT_CLIENT_FLAGS, 0);
        p.on_next(header(0, 1), &mut ctx).unwrap();
        p.on_next(def("1"), &mut ctx).unwrap();
        assert!(p.on_next(def("2"), &mut ctx).is_err());
    }
}
