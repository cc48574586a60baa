//! Single-packet commands with a fixed response shape.

use sqlwire_core::Result;

use super::{Command, CommandContext, CommandResult, EncodeContext, QueryResult, command_payload, unexpected};
use crate::message::{Expect, Message};
use crate::protocol::CommandCode;
use crate::statement::Statement;

/// `COM_QUIT`. The server closes the socket without answering.
#[derive(Debug, Default)]
pub struct Quit;

impl Command for Quit {
    fn name(&self) -> &'static str {
        "Quit"
    }

    fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
        Ok(command_payload(CommandCode::Quit, &[]))
    }

    fn on_next(&mut self, message: Message, _ctx: &mut CommandContext) -> Result<()> {
        Err(unexpected(self.name(), &message))
    }

    fn on_complete(&mut self) -> Result<CommandResult> {
        Ok(CommandResult::Unit)
    }

    fn is_finished(&self) -> bool {
        true
    }

    fn requires_exclusive_connection(&self) -> bool {
        false
    }
}

/// `COM_PING`.
#[derive(Debug, Default)]
pub struct Ping {
    result: Option<QueryResult>,
}

impl Command for Ping {
    fn name(&self) -> &'static str {
        "Ping"
    }

    fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
        Ok(command_payload(CommandCode::Ping, &[]))
    }

    fn on_next(&mut self, message: Message, _ctx: &mut CommandContext) -> Result<()> {
        match message {
            Message::Ok(ok) => {
                self.result = Some(QueryResult::from(&ok));
                Ok(())
            }
            other => Err(unexpected(self.name(), &other)),
        }
    }

    fn on_complete(&mut self) -> Result<CommandResult> {
        Ok(CommandResult::Done(self.result.take().unwrap_or_default()))
    }

    fn is_finished(&self) -> bool {
        self.result.is_some()
    }
}

/// `COM_STATISTICS`. The answer is a bare human-readable string.
#[derive(Debug, Default)]
pub struct Statistics {
    text: Option<String>,
}

impl Command for Statistics {
    fn name(&self) -> &'static str {
        "Statistics"
    }

    fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
        Ok(command_payload(CommandCode::Statistics, &[]))
    }

    fn on_next(&mut self, message: Message, _ctx: &mut CommandContext) -> Result<()> {
        match message {
            Message::Payload(payload) => {
                self.text = Some(String::from_utf8_lossy(&payload).into_owned());
                Ok(())
            }
            // An empty reply can look like an OK header.
            Message::Ok(_) => {
                self.text = Some(String::new());
                Ok(())
            }
            other => Err(unexpected(self.name(), &other)),
        }
    }

    fn on_complete(&mut self) -> Result<CommandResult> {
        Ok(CommandResult::Statistics(self.text.take().unwrap_or_default()))
    }

    fn is_finished(&self) -> bool {
        self.text.is_some()
    }
}

/// `COM_STMT_CLOSE`. No response.
#[derive(Debug)]
pub struct StatementClose {
    statement_id: u32,
}

impl StatementClose {
    /// Invalidate `statement` immediately, so later use fails before the
    /// close request has even been sent.
    pub fn new(statement: &Statement) -> Result<Self> {
        statement.ensure_open()?;
        statement.mark_closed();
        Ok(Self {
            statement_id: statement.id(),
        })
    }
}

impl Command for StatementClose {
    fn name(&self) -> &'static str {
        "StatementClose"
    }

    fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
        tracing::debug!(statement = self.statement_id, "closing statement");
        Ok(command_payload(
            CommandCode::StmtClose,
            &self.statement_id.to_le_bytes(),
        ))
    }

    fn on_next(&mut self, message: Message, _ctx: &mut CommandContext) -> Result<()> {
        Err(unexpected(self.name(), &message))
    }

    fn on_complete(&mut self) -> Result<CommandResult> {
        Ok(CommandResult::Unit)
    }

    fn is_finished(&self) -> bool {
        true
    }

    fn requires_exclusive_connection(&self) -> bool {
        false
    }
}

/// `COM_STMT_RESET`: discard long data and close any open cursor.
#[derive(Debug)]
pub struct StatementReset {
    statement: Statement,
    result: Option<QueryResult>,
}

impl StatementReset {
    pub fn new(statement: Statement) -> Self {
        Self {
            statement,
            result: None,
        }
    }
}

impl Command for StatementReset {
    fn name(&self) -> &'static str {
        "StatementReset"
    }

    fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
        self.statement.ensure_open()?;
        Ok(command_payload(
            CommandCode::StmtReset,
            &self.statement.id().to_le_bytes(),
        ))
    }

    fn expect(&self) -> Expect {
        Expect::Response
    }

    fn on_next(&mut self, message: Message, _ctx: &mut CommandContext) -> Result<()> {
        match message {
            Message::Ok(ok) => {
                self.result = Some(QueryResult::from(&ok));
                Ok(())
            }
            other => Err(unexpected(self.name(), &other)),
        }
    }

    fn on_complete(&mut self) -> Result<CommandResult> {
        Ok(CommandResult::Done(self.result.take().unwrap_or_default()))
    }

    fn is_finished(&self) -> bool {
        self.result.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OkPacket;
    use crate::protocol::capabilities::DEFAULT_CLIENT_FLAGS;
    use sqlwire_core::{Error, UsageErrorKind};
    use std::sync::Arc;

    fn enc() -> EncodeContext {
        EncodeContext {
            capabilities: DEFAULT_CLIENT_FLAGS,
            status_flags: 0,
        }
    }

    fn statement(id: u32) -> Statement {
        Statement::new(id, "SELECT 1".into(), Vec::new(), Arc::from(Vec::new()), Arc::from(Vec::new()))
    }

    #[test]
    fn test_quit_and_ping_payloads() {
        let mut quit = Quit;
        assert_eq!(quit.encode(&enc()).unwrap(), vec![0x01]);
        assert!(!quit.requires_exclusive_connection());

        let mut ping = Ping::default();
        assert_eq!(ping.encode(&enc()).unwrap(), vec![0x0e]);
        assert!(!ping.is_finished());
        let mut ctx = CommandContext::new(DEFAULT_CLIENT_FLAGS, 0);
        ping.on_next(Message::Ok(OkPacket::default()), &mut ctx).unwrap();
        assert!(ping.is_finished());
        assert!(matches!(ping.on_complete().unwrap(), CommandResult::Done(_)));
    }

    #[test]
    fn test_statistics_reads_text() {
        let mut stats = Statistics::default();
        let mut ctx = CommandContext::new(DEFAULT_CLIENT_FLAGS, 0);
        stats
            .on_next(Message::Payload(b"Uptime: 5  Threads: 1".to_vec()), &mut ctx)
            .unwrap();
        match stats.on_complete().unwrap() {
            CommandResult::Statistics(s) => assert!(s.starts_with("Uptime")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_close_invalidates_statement() {
        let stmt = statement(7);
        let mut close = StatementClose::new(&stmt).unwrap();
        assert!(stmt.is_closed());
        assert_eq!(close.encode(&enc()).unwrap(), vec![0x19, 7, 0, 0, 0]);

        assert!(matches!(
            StatementClose::new(&stmt),
            Err(Error::Usage(u)) if u.kind == UsageErrorKind::StatementClosed
        ));
        let mut reset = StatementReset::new(stmt);
        assert!(reset.encode(&enc()).is_err());
    }

    #[test]
    fn test_reset_payload() {
        let mut reset = StatementReset::new(statement(0x0102));
        assert_eq!(reset.encode(&enc()).unwrap(), vec![0x1a, 2, 1, 0, 0]);
    }
}
