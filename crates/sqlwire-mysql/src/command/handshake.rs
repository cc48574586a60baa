//! Connection-phase commands: SSL request, handshake response and auth switch.

use sqlwire_core::{Error, Result};

use super::{Command, CommandContext, CommandResult, EncodeContext, QueryResult, unexpected};
use crate::auth::{AuthContext, AuthPlugin, AuthRegistry, AuthResponse};
use crate::buffer::Buffer;
use crate::error::auth_error;
use crate::message::{ErrPacket, Expect, Message};
use crate::protocol::{ProtocolState, capabilities};

/// Client half of the handshake that does not depend on the auth plugin.
#[derive(Debug, Clone)]
pub struct LoginParams {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: String,
    pub database: Option<String>,
    pub attributes: Vec<(String, String)>,
}

fn write_login_prefix(buf: &mut Buffer, caps: u32, max_packet_size: u32, charset: u8) {
    buf.put_u32(caps);
    buf.put_u32(max_packet_size);
    buf.put_u8(charset);
    buf.put_zeros(23);
}

/// `SSLRequest`: the truncated handshake response that precedes the TLS upgrade.
#[derive(Debug)]
pub struct SslRequest {
    capabilities: u32,
    max_packet_size: u32,
    charset: u8,
}

impl SslRequest {
    pub fn new(params: &LoginParams) -> Self {
        Self {
            capabilities: params.capabilities | capabilities::CLIENT_SSL,
            max_packet_size: params.max_packet_size,
            charset: params.charset,
        }
    }
}

impl Command for SslRequest {
    fn name(&self) -> &'static str {
        "SslRequest"
    }

    fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
        let mut buf = Buffer::with_capacity(32);
        write_login_prefix(&mut buf, self.capabilities, self.max_packet_size, self.charset);
        Ok(buf.into_vec())
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

    fn resets_sequence(&self) -> bool {
        false
    }
}

/// Plugin state carried across handshake response and auth switches.
pub(crate) struct AuthExchange {
    plugin: Box<dyn AuthPlugin>,
    registry: AuthRegistry,
    ctx: AuthContext,
}

impl AuthExchange {
    pub(crate) fn new(plugin: Box<dyn AuthPlugin>, registry: AuthRegistry, ctx: AuthContext) -> Self {
        Self {
            plugin,
            registry,
            ctx,
        }
    }

    pub(crate) fn plugin_name(&self) -> &'static str {
        self.plugin.name()
    }

    /// Handle an auth-phase message. Returns `Some` once the server accepted.
    fn handle(&mut self, message: Message, ctx: &mut CommandContext, owner: &str) -> Result<Option<QueryResult>> {
        match message {
            Message::Ok(ok) => Ok(Some(QueryResult::from(&ok))),
            Message::AuthMoreData(data) => {
                match self.plugin.receive_more_data(&data)? {
                    AuthResponse::Wait => {}
                    AuthResponse::Send(bytes) => ctx.write_packet(bytes),
                }
                Ok(None)
            }
            Message::AuthSwitchRequest(request) => {
                tracing::debug!(
                    from = self.plugin.name(),
                    to = %request.plugin_name,
                    "server requested auth plugin switch"
                );
                let mut switched = AuthContext {
                    scramble: request.plugin_data,
                    ..self.ctx.clone()
                };
                switched.scramble.truncate(crate::protocol::SCRAMBLE_LENGTH);
                let plugin = self.registry.by_name(&request.plugin_name, &switched)?;
                let token = plugin.auth_token(&switched.password)?;
                let next = AuthExchange::new(plugin, self.registry.clone(), switched);
                ctx.chain(Box::new(AuthSwitchResponse::new(next, token)));
                Ok(None)
            }
            other => Err(unexpected(owner, &other)),
        }
    }
}

fn auth_failure(err: &ErrPacket) -> Error {
    if err.sql_state.is_empty() {
        auth_error(format!("[{}] {}", err.error_code, err.error_message))
    } else {
        auth_error(format!(
            "[{} ({})] {}",
            err.error_code, err.sql_state, err.error_message
        ))
    }
}

/// `HandshakeResponse41`: credentials, capabilities and the initial auth token.
pub struct HandshakeResponse {
    params: LoginParams,
    exchange: AuthExchange,
    accepted: Option<QueryResult>,
}

impl std::fmt::Debug for HandshakeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeResponse")
            .field("user", &self.params.user)
            .field("plugin", &self.exchange.plugin_name())
            .finish_non_exhaustive()
    }
}

impl HandshakeResponse {
    pub(crate) fn new(params: LoginParams, exchange: AuthExchange) -> Self {
        Self {
            params,
            exchange,
            accepted: None,
        }
    }
}

impl Command for HandshakeResponse {
    fn name(&self) -> &'static str {
        "HandshakeResponse"
    }

    fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
        let caps = self.params.capabilities;
        let mut buf = Buffer::with_capacity(128);
        write_login_prefix(&mut buf, caps, self.params.max_packet_size, self.params.charset);
        buf.put_null_terminated(self.params.user.as_bytes());

        let auth = self
            .exchange
            .plugin
            .compute_handshake_auth(&self.exchange.ctx.password)?;
        if auth.len() > 251 && caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA == 0 {
            return Err(auth_error(
                "auth token too long for a server without lenenc client data",
            ));
        }
        buf.put_bytes(&auth);

        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            let db = self.params.database.as_deref().unwrap_or_default();
            buf.put_null_terminated(db.as_bytes());
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            buf.put_null_terminated(self.exchange.plugin_name().as_bytes());
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = Buffer::new();
            for (key, value) in &self.params.attributes {
                attrs.put_lenenc_str(key);
                attrs.put_lenenc_str(value);
            }
            let attrs = attrs.into_vec();
            buf.put_lenenc_bytes(&attrs);
        }
        Ok(buf.into_vec())
    }

    fn parser_state_override(&self) -> Option<ProtocolState> {
        Some(ProtocolState::AuthSent)
    }

    fn expect(&self) -> Expect {
        Expect::Auth
    }

    fn on_next(&mut self, message: Message, ctx: &mut CommandContext) -> Result<()> {
        self.accepted = self.exchange.handle(message, ctx, "HandshakeResponse")?;
        Ok(())
    }

    fn on_complete(&mut self) -> Result<CommandResult> {
        Ok(CommandResult::Done(self.accepted.take().unwrap_or_default()))
    }

    fn on_error(&mut self, err: &ErrPacket) -> Error {
        auth_failure(err)
    }

    fn is_finished(&self) -> bool {
        self.accepted.is_some()
    }

    fn resets_sequence(&self) -> bool {
        false
    }
}

/// `AuthSwitchResponse`: the token computed by the plugin the server switched to.
pub struct AuthSwitchResponse {
    exchange: AuthExchange,
    token: Option<Vec<u8>>,
    accepted: Option<QueryResult>,
}

impl std::fmt::Debug for AuthSwitchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSwitchResponse")
            .field("plugin", &self.exchange.plugin_name())
            .finish_non_exhaustive()
    }
}

impl AuthSwitchResponse {
    pub(crate) fn new(exchange: AuthExchange, token: Vec<u8>) -> Self {
        Self {
            exchange,
            token: Some(token),
            accepted: None,
        }
    }
}

impl Command for AuthSwitchResponse {
    fn name(&self) -> &'static str {
        "AuthSwitchResponse"
    }

    fn encode(&mut self, _ctx: &EncodeContext) -> Result<Vec<u8>> {
        Ok(self.token.take().unwrap_or_default())
    }

    fn parser_state_override(&self) -> Option<ProtocolState> {
        Some(ProtocolState::AuthSent)
    }

    fn expect(&self) -> Expect {
        Expect::Auth
    }

    fn on_next(&mut self, message: Message, ctx: &mut CommandContext) -> Result<()> {
        self.accepted = self.exchange.handle(message, ctx, "AuthSwitchResponse")?;
        Ok(())
    }

    fn on_complete(&mut self) -> Result<CommandResult> {
        Ok(CommandResult::Done(self.accepted.take().unwrap_or_default()))
    }

    fn on_error(&mut self, err: &ErrPacket) -> Error {
        auth_failure(err)
    }

    fn is_finished(&self) -> bool {
        self.accepted.is_some()
    }

    fn resets_sequence(&self) -> bool {
        false
    }
}
