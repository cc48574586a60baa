//! The protocol engine: packet framing, sequencing and message dispatch.
//!
//! The engine owns the receive buffer, sequence counters, optional
//! compression layer and the one command currently holding the connection.
//! It never touches a socket: bytes go in through [`Engine::feed`], framed
//! output comes out through [`Engine::take_outbound`], and everything that
//! happened is reported as [`EngineEvent`]s.
//!
//! Inbound messages are processed one per [`Engine::step`] so a caller can
//! interleave transport work between back-to-back buffered messages.

use std::collections::VecDeque;
use std::fmt;

use sqlwire_core::{Error, Result, Row};

use crate::buffer::Buffer;
use crate::command::{
    Columns, Command, CommandContext, CommandResult, Effect, EncodeContext, QueryResult,
};
use crate::error::{connection_error, query_error};
use crate::message::{DecodeContext, ErrPacket, Expect, Handshake, Message};
use crate::protocol::compression::CompressedFramer;
use crate::protocol::packet::{PacketHeader, frame_payload};
use crate::protocol::{MAX_PACKET_SIZE, ProtocolState, capabilities};

/// Handle naming one submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub(crate) u64);

impl CommandId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something the engine observed or finished.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    /// The server greeting arrived.
    Greeting(Handshake),
    /// A command's handle resolved. `streaming` marks an early resolution
    /// whose rows and terminators follow as further events.
    Completed {
        id: CommandId,
        result: Result<CommandResult>,
        streaming: bool,
    },
    Columns { id: CommandId, columns: Columns },
    Row { id: CommandId, row: Row },
    ResultEnd { id: CommandId, summary: QueryResult },
    /// A streaming command finished cleanly.
    StreamEnd { id: CommandId },
    StreamFailed { id: CommandId, error: Error },
    /// A server error with no command to receive it.
    ServerError(Error),
    /// Unrecoverable; the connection must be dropped.
    Fatal(Error),
}

struct Active {
    id: CommandId,
    command: Box<dyn Command>,
    resolved: bool,
}

struct Finished {
    id: CommandId,
    result: Result<CommandResult>,
    resolved: bool,
}

pub(crate) struct Engine {
    state: ProtocolState,
    inbound: Buffer,
    /// Payload bytes of a message split across max-size packets.
    partial: Vec<u8>,
    /// Last sequence id sent or received.
    sequence: u8,
    compression: Option<CompressedFramer>,
    outbound: Vec<u8>,
    current: Option<Active>,
    deferred: Option<Finished>,
    capabilities: u32,
    status_flags: u16,
    local_infile_allowed: bool,
    events: VecDeque<EngineEvent>,
    failed: bool,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("sequence", &self.sequence)
            .field("buffered", &self.inbound.remaining())
            .field("compressed", &self.compression.is_some())
            .field(
                "current",
                &self.current.as_ref().map(|a| (a.id, a.command.name())),
            )
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub(crate) fn new(capabilities: u32, local_infile_allowed: bool) -> Self {
        Self {
            state: ProtocolState::Init,
            inbound: Buffer::new(),
            partial: Vec::new(),
            sequence: u8::MAX,
            compression: None,
            outbound: Vec::new(),
            current: None,
            deferred: None,
            capabilities,
            status_flags: 0,
            local_infile_allowed,
            events: VecDeque::new(),
            failed: false,
        }
    }

    pub(crate) fn state(&self) -> ProtocolState {
        self.state
    }

    pub(crate) fn capabilities(&self) -> u32 {
        self.capabilities
    }

    /// Narrow to the capabilities both sides agreed on.
    pub(crate) fn set_capabilities(&mut self, capabilities: u32) {
        self.capabilities = capabilities;
    }

    pub(crate) fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub(crate) fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed
    }

    /// No command holds the connection.
    pub(crate) fn is_idle(&self) -> bool {
        self.current.is_none() && self.deferred.is_none()
    }

    /// Buffer raw bytes received from the transport.
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        if self.failed {
            return;
        }
        tracing::trace!(bytes = bytes.len(), "received");
        // Reclaim consumed bytes once per read, not once per packet.
        self.inbound.compact();
        match &mut self.compression {
            Some(framer) => {
                framer.feed(bytes);
                if let Err(e) = framer.unwrap_into(&mut self.inbound) {
                    self.fail(e);
                }
            }
            None => self.inbound.append(bytes),
        }
    }

    /// Whether [`Engine::step`] would make progress right now.
    pub(crate) fn has_pending_work(&self) -> bool {
        if self.failed {
            return false;
        }
        if self.deferred.is_some() {
            return true;
        }
        let buffered = self.inbound.as_slice();
        PacketHeader::parse(buffered).is_some_and(|h| {
            buffered.len() >= PacketHeader::SIZE + h.payload_length as usize
        })
    }

    pub(crate) fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    pub(crate) fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub(crate) fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    /// Process at most one message, or flush one deferred completion.
    pub(crate) fn step(&mut self) -> bool {
        if let Some(done) = self.deferred.take() {
            self.emit_finished(done);
            return true;
        }
        if self.failed {
            return false;
        }
        match self.next_payload() {
            Ok(Some(payload)) => {
                self.dispatch(payload);
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.fail(e);
                true
            }
        }
    }

    /// Hand the connection to `command` and send its request.
    pub(crate) fn start(&mut self, id: CommandId, command: Box<dyn Command>) {
        self.start_with(id, command, false);
    }

    fn start_with(&mut self, id: CommandId, mut command: Box<dyn Command>, resolved: bool) {
        if command.resets_sequence() {
            self.reset_sequence();
        }
        let ctx = EncodeContext {
            capabilities: self.capabilities,
            status_flags: self.status_flags,
        };
        let payload = match command.encode(&ctx) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::debug!(%id, command = command.name(), %error, "encode failed");
                self.emit_finished(Finished {
                    id,
                    result: Err(error),
                    resolved,
                });
                return;
            }
        };
        tracing::debug!(%id, command = command.name(), bytes = payload.len(), "dispatch");
        if let Err(e) = self.send(&payload) {
            self.fail(e);
            return;
        }
        if let Some(state) = command.parser_state_override() {
            self.set_state(state);
        }
        if command.requires_exclusive_connection() {
            self.current = Some(Active {
                id,
                command,
                resolved,
            });
        } else {
            let result = command.on_complete();
            self.emit_finished(Finished {
                id,
                result,
                resolved,
            });
        }
    }

    /// Drop the current command after a fatal error, reporting its id and
    /// whether its handle had already resolved.
    pub(crate) fn abort(&mut self) -> Option<(CommandId, bool)> {
        self.failed = true;
        self.deferred
            .take()
            .map(|d| (d.id, d.resolved))
            .or_else(|| self.current.take().map(|a| (a.id, a.resolved)))
    }

    fn reset_sequence(&mut self) {
        self.sequence = u8::MAX;
        if let Some(framer) = &mut self.compression {
            framer.reset_sequence();
        }
    }

    fn set_state(&mut self, state: ProtocolState) {
        if state != self.state {
            tracing::debug!(from = ?self.state, to = ?state, "protocol state");
            self.state = state;
        }
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(payload.len() + PacketHeader::SIZE);
        frame_payload(payload, &mut self.sequence, &mut framed);
        tracing::trace!(payload = payload.len(), sequence = self.sequence, "send");
        match &mut self.compression {
            Some(framer) => framer.wrap(&framed, &mut self.outbound),
            None => {
                self.outbound.extend_from_slice(&framed);
                Ok(())
            }
        }
    }

    /// Pull the next complete logical payload out of the receive buffer.
    fn next_payload(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let Some(header) = PacketHeader::parse(self.inbound.as_slice()) else {
                return Ok(None);
            };
            let len = header.payload_length as usize;
            if self.inbound.remaining() < PacketHeader::SIZE + len {
                return Ok(None);
            }
            self.inbound.skip(PacketHeader::SIZE)?;
            let expected = self.sequence.wrapping_add(1);
            if header.sequence_id != expected {
                tracing::warn!(expected, received = header.sequence_id, "sequence mismatch");
            }
            self.sequence = header.sequence_id;
            tracing::trace!(payload = len, sequence = header.sequence_id, "packet");
            self.partial.extend_from_slice(self.inbound.read(len)?);
            if len < MAX_PACKET_SIZE {
                return Ok(Some(std::mem::take(&mut self.partial)));
            }
        }
    }

    fn dispatch(&mut self, payload: Vec<u8>) {
        let expect = self
            .current
            .as_ref()
            .map_or(Expect::Response, |a| a.command.expect());
        let ctx = DecodeContext {
            state: self.state,
            expect,
            capabilities: self.capabilities,
            local_infile_allowed: self.local_infile_allowed,
        };
        let message = match Message::decode(payload, &ctx) {
            Ok(message) => message,
            Err(e) => return self.fail(e),
        };

        let previous = self.state;
        if let Some(next) = message.state_transition(previous) {
            self.set_state(next);
        }
        if let Some(flags) = message.status_flags() {
            self.status_flags = flags;
        }
        if previous.is_authenticating() && self.state == ProtocolState::Ok {
            self.maybe_enable_compression();
        }

        let message = match message {
            Message::Handshake(greeting) => {
                self.events.push_back(EngineEvent::Greeting(greeting));
                return;
            }
            Message::Err(err) => return self.on_server_error(&err),
            other => other,
        };

        let Some(active) = self.current.as_mut() else {
            tracing::warn!(message = message.name(), "unexpected message for idle connection");
            return;
        };
        let mut cctx = CommandContext::new(self.capabilities, self.status_flags);
        let outcome = active.command.on_next(message, &mut cctx);
        let chained = self.apply_effects(cctx.effects);

        match outcome {
            Err(e) if e.is_fatal() => self.fail(e),
            Err(e) => self.finish_current(Err(e)),
            Ok(()) => {
                if let Some(next) = chained {
                    if let Some(active) = self.current.take() {
                        tracing::debug!(id = %active.id, from = active.command.name(), to = next.name(), "chain");
                        self.start_with(active.id, next, active.resolved);
                    }
                } else if self.current.as_ref().is_some_and(|a| a.command.is_finished()) {
                    self.complete_current();
                }
            }
        }
    }

    /// Emit stream events and writes; returns a chained successor, if any.
    fn apply_effects(&mut self, effects: Vec<Effect>) -> Option<Box<dyn Command>> {
        let mut chained = None;
        for effect in effects {
            let Some(active) = self.current.as_mut() else {
                break;
            };
            let id = active.id;
            match effect {
                Effect::Write(payload) => {
                    if let Err(e) = self.send(&payload) {
                        self.fail(e);
                        return None;
                    }
                }
                Effect::Resolve(result) => {
                    active.resolved = true;
                    self.events.push_back(EngineEvent::Completed {
                        id,
                        result: Ok(result),
                        streaming: true,
                    });
                }
                Effect::Columns(columns) => {
                    self.events.push_back(EngineEvent::Columns { id, columns });
                }
                Effect::Row(row) => self.events.push_back(EngineEvent::Row { id, row }),
                Effect::ResultEnd(summary) => {
                    self.events.push_back(EngineEvent::ResultEnd { id, summary });
                }
                Effect::Chain(next) => chained = Some(next),
            }
        }
        chained
    }

    fn complete_current(&mut self) {
        let result = match self.current.as_mut() {
            Some(active) => active.command.on_complete(),
            None => return,
        };
        self.finish_current(result);
    }

    fn finish_current(&mut self, result: Result<CommandResult>) {
        let Some(active) = self.current.take() else {
            return;
        };
        let done = Finished {
            id: active.id,
            result,
            resolved: active.resolved,
        };
        if active.command.defers_completion() {
            self.deferred = Some(done);
        } else {
            self.emit_finished(done);
        }
    }

    fn emit_finished(&mut self, done: Finished) {
        let Finished {
            id,
            result,
            resolved,
        } = done;
        tracing::debug!(%id, ok = result.is_ok(), "command finished");
        let event = match (resolved, result) {
            (false, result) => EngineEvent::Completed {
                id,
                result,
                streaming: false,
            },
            (true, Ok(_)) => EngineEvent::StreamEnd { id },
            (true, Err(error)) => EngineEvent::StreamFailed { id, error },
        };
        self.events.push_back(event);
    }

    fn on_server_error(&mut self, err: &ErrPacket) {
        if let Some(active) = self.current.as_mut() {
            let error = active.command.on_error(err);
            tracing::debug!(id = %active.id, code = err.error_code, "server error");
            self.finish_current(Err(error));
            return;
        }
        if self.state == ProtocolState::HandshakeError {
            self.fail(connection_error(format!(
                "server refused connection: [{}] {}",
                err.error_code, err.error_message
            )));
            return;
        }
        tracing::warn!(code = err.error_code, "server error with no command in flight");
        self.events
            .push_back(EngineEvent::ServerError(query_error(err, None)));
    }

    fn maybe_enable_compression(&mut self) {
        if self.compression.is_some() || self.capabilities & capabilities::CLIENT_COMPRESS == 0 {
            return;
        }
        tracing::debug!("compression enabled");
        let mut framer = CompressedFramer::new();
        framer.reset_sequence();
        // Anything already buffered after the auth OK is compressed.
        let residual = std::mem::take(&mut self.inbound).into_remaining();
        if !residual.is_empty() {
            framer.feed(&residual);
            if let Err(e) = framer.unwrap_into(&mut self.inbound) {
                self.compression = Some(framer);
                return self.fail(e);
            }
        }
        self.compression = Some(framer);
    }

    fn fail(&mut self, error: Error) {
        if self.failed {
            return;
        }
        tracing::warn!(%error, "fatal protocol error");
        self.failed = true;
        self.events.push_back(EngineEvent::Fatal(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Ping, Query, Quit};
    use crate::protocol::capabilities::DEFAULT_CLIENT_FLAGS;

    fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut s = seq.wrapping_sub(1);
        frame_payload(payload, &mut s, &mut out);
        out
    }

    fn ok_payload() -> Vec<u8> {
        vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
    }

    fn ready_engine() -> Engine {
        let mut engine = Engine::new(DEFAULT_CLIENT_FLAGS, false);
        engine.state = ProtocolState::Ok;
        engine
    }

    fn drain(engine: &mut Engine) -> Vec<EngineEvent> {
        while engine.step() {}
        std::iter::from_fn(|| engine.poll_event()).collect()
    }

    #[test]
    fn test_ping_round_trip_resets_sequence() {
        let mut engine = ready_engine();
        engine.sequence = 7;
        engine.start(CommandId(1), Box::new(Ping::default()));
        assert_eq!(engine.take_outbound(), vec![1, 0, 0, 0, 0x0e]);
        assert!(!engine.is_idle());

        engine.feed(&packet(1, &ok_payload()));
        let events = drain(&mut engine);
        assert!(matches!(
            events.as_slice(),
            [EngineEvent::Completed { id: CommandId(1), result: Ok(CommandResult::Done(_)), streaming: false }]
        ));
        assert!(engine.is_idle());
        assert_eq!(engine.status_flags(), 2);
    }

    #[test]
    fn test_non_exclusive_completes_on_send() {
        let mut engine = ready_engine();
        engine.start(CommandId(4), Box::new(Quit));
        assert!(engine.is_idle());
        assert!(matches!(
            engine.poll_event(),
            Some(EngineEvent::Completed { id: CommandId(4), result: Ok(CommandResult::Unit), .. })
        ));
        assert_eq!(engine.take_outbound(), vec![1, 0, 0, 0, 0x01]);
    }

    #[test]
    fn test_partial_packets_wait_for_more_bytes() {
        let mut engine = ready_engine();
        engine.start(CommandId(1), Box::new(Ping::default()));
        let bytes = packet(1, &ok_payload());
        engine.feed(&bytes[..3]);
        assert!(!engine.has_pending_work());
        assert!(!engine.step());
        engine.feed(&bytes[3..]);
        assert!(engine.has_pending_work());
        assert!(engine.step());
        assert!(engine.is_idle());
    }

    #[test]
    fn test_one_message_per_step() {
        let mut engine = ready_engine();
        engine.start(CommandId(1), Box::new(Query::new("SELECT 1")));
        let mut wire = packet(1, &[1]);
        wire.extend(packet(
            2,
            &crate::column::tests::column_packet("1", crate::column::FieldType::LongLong, 0, 1),
        ));
        let mut row = Buffer::new();
        row.put_lenenc_str("1");
        wire.extend(packet(3, row.written()));
        wire.extend(packet(4, &[0xfe, 0, 0, 2, 0, 0, 0]));
        engine.feed(&wire);

        assert!(engine.step());
        assert!(engine.poll_event().is_none());
        assert!(engine.step());
        assert!(matches!(
            engine.poll_event(),
            Some(EngineEvent::Completed { streaming: true, result: Ok(CommandResult::Stream(_)), .. })
        ));
        assert!(engine.step());
        assert!(matches!(engine.poll_event(), Some(EngineEvent::Row { .. })));
        assert!(engine.step());
        assert!(matches!(engine.poll_event(), Some(EngineEvent::ResultEnd { .. })));
        assert!(matches!(engine.poll_event(), Some(EngineEvent::StreamEnd { id: CommandId(1) })));
        assert!(!engine.has_pending_work());
    }

    #[test]
    fn test_consumed_bytes_reclaimed_on_next_read() {
        let mut engine = ready_engine();
        engine.start(CommandId(1), Box::new(Query::new("SELECT 1")));
        let header = packet(1, &[1]);
        let column = packet(
            2,
            &crate::column::tests::column_packet("1", crate::column::FieldType::LongLong, 0, 1),
        );
        let mut wire = header.clone();
        wire.extend(&column);
        engine.feed(&wire);

        assert!(engine.step());
        assert!(engine.step());
        assert_eq!(engine.inbound.position(), header.len() + column.len());
        assert_eq!(engine.inbound.remaining(), 0);

        let mut row = Buffer::new();
        row.put_lenenc_str("1");
        let row = packet(3, row.written());
        engine.feed(&row);
        assert_eq!(engine.inbound.position(), 0);
        assert_eq!(engine.inbound.remaining(), row.len());

        engine.feed(&packet(4, &[0xfe, 0, 0, 2, 0, 0, 0]));
        let events = drain(&mut engine);
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Row { .. })));
        assert!(matches!(events.last(), Some(EngineEvent::StreamEnd { id: CommandId(1) })));
    }

    #[test]
    fn test_fragmented_message_is_reassembled() {
        let mut engine = ready_engine();
        engine.start(CommandId(1), Box::new(crate::command::Statistics::default()));
        let text = vec![b'x'; MAX_PACKET_SIZE + 10];
        let mut seq = 0;
        let mut wire = Vec::new();
        frame_payload(&text, &mut seq, &mut wire);
        engine.feed(&wire);
        let events = drain(&mut engine);
        match events.as_slice() {
            [EngineEvent::Completed { result: Ok(CommandResult::Statistics(s)), .. }] => {
                assert_eq!(s.len(), MAX_PACKET_SIZE + 10);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_server_error_routes_to_command() {
        let mut engine = ready_engine();
        engine.start(CommandId(2), Box::new(Query::new("SELEC 1")));
        let mut err = vec![0xff, 0x28, 0x04, b'#'];
        err.extend_from_slice(b"42000You have an error");
        engine.feed(&packet(1, &err));
        let events = drain(&mut engine);
        match events.as_slice() {
            [EngineEvent::Completed { result: Err(e), .. }] => {
                assert_eq!(e.code(), Some(1064));
                assert_eq!(e.sql(), Some("SELEC 1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!engine.is_failed());
    }

    #[test]
    fn test_unsolicited_messages() {
        let mut engine = ready_engine();
        engine.feed(&packet(0, &ok_payload()));
        assert!(drain(&mut engine).is_empty());

        let mut err = vec![0xff, 0x35, 0x04];
        err.extend_from_slice(b"shutdown");
        engine.feed(&packet(1, &err));
        assert!(matches!(drain(&mut engine).as_slice(), [EngineEvent::ServerError(_)]));
    }

    #[test]
    fn test_greeting_error_is_fatal() {
        let mut engine = Engine::new(DEFAULT_CLIENT_FLAGS, false);
        let mut err = vec![0xff, 0x10, 0x04];
        err.extend_from_slice(b"Too many connections");
        engine.feed(&packet(0, &err));
        let events = drain(&mut engine);
        assert!(matches!(events.as_slice(), [EngineEvent::Fatal(e)] if e.is_connection_error()));
        assert_eq!(engine.state(), ProtocolState::HandshakeError);
        assert!(engine.is_failed());
    }

    #[test]
    fn test_deferred_completion_waits_one_step() {
        struct Slow(bool);
        impl Command for Slow {
            fn name(&self) -> &'static str {
                "Slow"
            }
            fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
                Ok(vec![0x0e])
            }
            fn on_next(&mut self, _m: Message, _c: &mut CommandContext) -> Result<()> {
                self.0 = true;
                Ok(())
            }
            fn on_complete(&mut self) -> Result<CommandResult> {
                Ok(CommandResult::Unit)
            }
            fn is_finished(&self) -> bool {
                self.0
            }
            fn defers_completion(&self) -> bool {
                true
            }
        }

        let mut engine = ready_engine();
        engine.start(CommandId(9), Box::new(Slow(false)));
        engine.feed(&packet(1, &ok_payload()));
        assert!(engine.step());
        assert!(engine.poll_event().is_none());
        assert!(engine.has_pending_work());
        assert!(engine.step());
        assert!(matches!(engine.poll_event(), Some(EngineEvent::Completed { id: CommandId(9), .. })));
    }

    #[test]
    fn test_compression_starts_after_auth() {
        let caps = DEFAULT_CLIENT_FLAGS | capabilities::CLIENT_COMPRESS;
        let mut engine = Engine::new(caps, false);
        engine.state = ProtocolState::AuthSent;
        engine.sequence = 1;

        let mut framer = CompressedFramer::new();
        let mut compressed = Vec::new();
        framer
            .wrap(&packet(0, &ok_payload()), &mut compressed)
            .unwrap();
        let mut wire = packet(2, &ok_payload());
        wire.extend_from_slice(&compressed);
        engine.feed(&wire);

        assert!(engine.step());
        assert_eq!(engine.state(), ProtocolState::Ok);
        assert!(engine.is_compressed());
        // The trailing frame was unwrapped into a regular packet.
        assert!(engine.has_pending_work());

        engine.start(CommandId(1), Box::new(Ping::default()));
        let out = engine.take_outbound();
        assert_eq!(out, vec![5, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0x0e]);
    }
}
