//! Server message decoding.
//!
//! Every reassembled packet payload is classified exactly once into a
//! [`Message`]. Which variant applies depends on the protocol state, on what
//! the current command is waiting for ([`Expect`]) and on the negotiated
//! capabilities; after that, commands match on the enum exhaustively.

use sqlwire_core::Result;

use crate::buffer::{Buffer, DecodeError, DecodeResult};
use crate::error::{protocol_error, protocol_error_with_data};
use crate::protocol::{MAX_PACKET_SIZE, ProtocolState, SCRAMBLE_LENGTH, capabilities};

/// EOF packets are shorter than this.
const EOF_MAX_LEN: usize = 6;

/// What the current command is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// OK/ERR (or an opaque payload such as COM_STATISTICS output).
    Response,
    /// Authentication exchange.
    Auth,
    /// First response to COM_STMT_PREPARE.
    PrepareOk,
    /// First response to a query or execute: OK, ERR, LOCAL INFILE or column count.
    ResultHeader,
    /// Column definition packets.
    Columns,
    /// Row packets.
    Rows,
}

/// Inputs that decide how a payload is classified.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext {
    pub state: ProtocolState,
    pub expect: Expect,
    pub capabilities: u32,
    pub local_infile_allowed: bool,
}

impl DecodeContext {
    fn deprecate_eof(&self) -> bool {
        self.capabilities & capabilities::CLIENT_DEPRECATE_EOF != 0
    }
}

/// A decoded server message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(Handshake),
    Ok(OkPacket),
    Err(ErrPacket),
    Eof(EofPacket),
    AuthSwitchRequest(AuthSwitchRequest),
    AuthMoreData(Vec<u8>),
    PrepareOk(PrepareOk),
    LocalInFileRequest(String),
    /// Column counts, column definitions, rows and other command-specific bodies.
    Payload(Vec<u8>),
}

impl Message {
    /// Classify and parse one complete payload.
    pub fn decode(payload: Vec<u8>, ctx: &DecodeContext) -> Result<Message> {
        let Some(&first) = payload.first() else {
            return Ok(Message::Payload(payload));
        };
        let parsed = if ctx.state == ProtocolState::Init {
            if first == 0xFF {
                ErrPacket::parse(&payload).map(Message::Err)
            } else {
                Handshake::parse(&payload).map(Message::Handshake)
            }
        } else {
            match first {
                0xFF => ErrPacket::parse(&payload).map(Message::Err),
                0xFE if ctx.state.is_authenticating() => {
                    AuthSwitchRequest::parse(&payload).map(Message::AuthSwitchRequest)
                }
                0x01 if ctx.state.is_authenticating() => {
                    Ok(Message::AuthMoreData(payload[1..].to_vec()))
                }
                0xFE if payload.len() < EOF_MAX_LEN => {
                    EofPacket::parse(&payload).map(Message::Eof)
                }
                // A row whose first cell is 16 MiB or larger also opens with
                // 0xFE, but it can never fit in a single packet.
                0xFE if ctx.expect == Expect::Rows
                    && ctx.deprecate_eof()
                    && payload.len() < MAX_PACKET_SIZE =>
                {
                    OkPacket::parse(&payload).map(Message::Ok)
                }
                0x00 => match ctx.expect {
                    Expect::PrepareOk => PrepareOk::parse(&payload).map(Message::PrepareOk),
                    // Binary rows open with 0x00, and a MySQL 5.7 text row can
                    // too; neither is an OK packet.
                    Expect::Rows | Expect::Columns => return Ok(Message::Payload(payload)),
                    _ => OkPacket::parse(&payload).map(Message::Ok),
                },
                0xFB if ctx.expect == Expect::ResultHeader => {
                    if !ctx.local_infile_allowed {
                        return Err(protocol_error(
                            "server requested LOCAL INFILE but it is not enabled",
                        ));
                    }
                    Ok(Message::LocalInFileRequest(
                        String::from_utf8_lossy(&payload[1..]).into_owned(),
                    ))
                }
                _ => return Ok(Message::Payload(payload)),
            }
        };
        parsed.map_err(|e| match e {
            DecodeError::Underflow { .. } => {
                protocol_error_with_data(format!("truncated packet: {}", e), &payload)
            }
            DecodeError::Malformed(msg) => protocol_error_with_data(msg, &payload),
        })
    }

    /// Protocol state this message moves the parser into, if any.
    pub fn state_transition(&self, current: ProtocolState) -> Option<ProtocolState> {
        match self {
            Message::Handshake(_) => Some(ProtocolState::Handshake),
            Message::AuthSwitchRequest(_) => Some(ProtocolState::Auth),
            Message::Ok(_) if current.is_authenticating() => Some(ProtocolState::Ok),
            Message::Err(_) => match current {
                ProtocolState::Init | ProtocolState::Handshake => {
                    Some(ProtocolState::HandshakeError)
                }
                ProtocolState::Auth | ProtocolState::AuthSent => Some(ProtocolState::AuthError),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "Handshake",
            Message::Ok(_) => "Ok",
            Message::Err(_) => "Err",
            Message::Eof(_) => "Eof",
            Message::AuthSwitchRequest(_) => "AuthSwitchRequest",
            Message::AuthMoreData(_) => "AuthMoreData",
            Message::PrepareOk(_) => "PrepareOk",
            Message::LocalInFileRequest(_) => "LocalInFileRequest",
            Message::Payload(_) => "Payload",
        }
    }

    /// Status flags carried by an OK or EOF message.
    pub fn status_flags(&self) -> Option<u16> {
        match self {
            Message::Ok(ok) => Some(ok.status_flags),
            Message::Eof(eof) => Some(eof.status_flags),
            _ => None,
        }
    }
}

/// Initial server greeting (protocol version 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Auth plugin data assembled from both wire fragments.
    pub scramble: Vec<u8>,
    pub capabilities: u32,
    pub charset: Option<u8>,
    pub status_flags: Option<u16>,
    pub auth_plugin: Option<String>,
}

impl Handshake {
    pub fn parse(payload: &[u8]) -> DecodeResult<Self> {
        let mut buf = Buffer::from_vec(payload.to_vec());

        let protocol_version = buf.read_u8()?;
        if protocol_version != 10 {
            return Err(DecodeError::malformed(format!(
                "unsupported handshake protocol version: {}",
                protocol_version
            )));
        }
        let server_version = buf.read_null_terminated_string()?;
        let connection_id = buf.read_u32()?;
        let mut scramble = buf.read(8)?.to_vec();
        buf.skip(1)?;
        let caps_lower = buf.read_u16()?;

        let mut handshake = Handshake {
            protocol_version,
            server_version,
            connection_id,
            scramble: Vec::new(),
            capabilities: u32::from(caps_lower),
            charset: None,
            status_flags: None,
            auth_plugin: None,
        };

        if buf.is_empty() {
            handshake.scramble = scramble;
            return Ok(handshake);
        }

        handshake.charset = Some(buf.read_u8()?);
        handshake.status_flags = Some(buf.read_u16()?);
        let caps_upper = buf.read_u16()?;
        handshake.capabilities |= u32::from(caps_upper) << 16;
        let auth_data_len = usize::from(buf.read_u8()?);
        buf.skip(10)?;

        if handshake.capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len2 = auth_data_len.saturating_sub(8).max(13).min(buf.remaining());
            let part2 = buf.read(len2)?;
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            scramble.extend_from_slice(part2);
        }
        handshake.scramble = scramble;

        if handshake.capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            // Some servers omit the trailing NUL.
            let name = match buf.read_null_terminated_string() {
                Ok(name) => name,
                Err(_) => String::from_utf8_lossy(buf.read_rest()).into_owned(),
            };
            handshake.auth_plugin = Some(name);
        }
        Ok(handshake)
    }

    /// The scramble truncated to the 20 bytes used by hashing plugins.
    pub fn auth_scramble(&self) -> &[u8] {
        &self.scramble[..self.scramble.len().min(SCRAMBLE_LENGTH)]
    }

    pub fn has_capability(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }

    pub fn is_mariadb(&self) -> bool {
        self.server_version.contains("MariaDB")
    }
}

/// Parsed OK packet (header 0x00, or 0xFE as a deprecated-EOF terminator).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    pub fn parse(payload: &[u8]) -> DecodeResult<Self> {
        let mut buf = Buffer::from_vec(payload.to_vec());
        buf.skip(1)?;
        let affected_rows = buf.read_lenenc_int()?.unwrap_or(0);
        let last_insert_id = buf.read_lenenc_int()?.unwrap_or(0);
        let status_flags = buf.read_u16()?;
        let warnings = buf.read_u16()?;
        let info = String::from_utf8_lossy(buf.read_rest()).into_owned();
        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }
}

/// Parsed ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    /// SQL state (5 characters), empty when the server omitted it
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn parse(payload: &[u8]) -> DecodeResult<Self> {
        let mut buf = Buffer::from_vec(payload.to_vec());
        buf.skip(1)?;
        let error_code = buf.read_u16()?;
        let sql_state = if buf.peek() == Some(b'#') {
            buf.skip(1)?;
            buf.read_string(5)?
        } else {
            String::new()
        };
        let error_message = String::from_utf8_lossy(buf.read_rest()).into_owned();
        Ok(Self {
            error_code,
            sql_state,
            error_message,
        })
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.error_code == 1062
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn parse(payload: &[u8]) -> DecodeResult<Self> {
        let mut buf = Buffer::from_vec(payload.to_vec());
        buf.skip(1)?;
        if buf.is_empty() {
            // Pre-4.1 servers send a bare 0xFE.
            return Ok(Self::default());
        }
        Ok(Self {
            warnings: buf.read_u16()?,
            status_flags: buf.read_u16()?,
        })
    }
}

/// Server request to restart authentication with another plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> DecodeResult<Self> {
        let mut buf = Buffer::from_vec(payload.to_vec());
        buf.skip(1)?;
        if buf.is_empty() {
            // Old-style switch request with no plugin name.
            return Ok(Self {
                plugin_name: "mysql_old_password".to_string(),
                plugin_data: Vec::new(),
            });
        }
        let plugin_name = buf.read_null_terminated_string()?;
        let data = buf.read_rest();
        let plugin_data = data.strip_suffix(&[0]).unwrap_or(data).to_vec();
        Ok(Self {
            plugin_name,
            plugin_data,
        })
    }
}

/// Response to COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

impl PrepareOk {
    pub fn parse(payload: &[u8]) -> DecodeResult<Self> {
        let mut buf = Buffer::from_vec(payload.to_vec());
        buf.skip(1)?;
        let statement_id = buf.read_u32()?;
        let num_columns = buf.read_u16()?;
        let num_params = buf.read_u16()?;
        let warnings = if buf.remaining() >= 3 {
            buf.skip(1)?;
            buf.read_u16()?
        } else {
            0
        };
        Ok(Self {
            statement_id,
            num_columns,
            num_params,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlwire_core::Error;

    fn ctx(state: ProtocolState, expect: Expect) -> DecodeContext {
        DecodeContext {
            state,
            expect,
            capabilities: capabilities::DEFAULT_CLIENT_FLAGS,
            local_infile_allowed: false,
        }
    }

    fn handshake_payload(plugin: &str, scramble: &[u8; 20]) -> Vec<u8> {
        let caps = capabilities::DEFAULT_CLIENT_FLAGS | capabilities::CLIENT_SSL;
        let mut buf = Buffer::new();
        buf.put_u8(10);
        buf.put_null_terminated(b"8.0.36");
        buf.put_u32(42);
        buf.put_bytes(&scramble[..8]);
        buf.put_u8(0);
        buf.put_u16((caps & 0xFFFF) as u16);
        buf.put_u8(45);
        buf.put_u16(2);
        buf.put_u16((caps >> 16) as u16);
        buf.put_u8(21);
        buf.put_zeros(10);
        buf.put_bytes(&scramble[8..]);
        buf.put_u8(0);
        buf.put_null_terminated(plugin.as_bytes());
        buf.into_vec()
    }

    #[test]
    fn test_parse_handshake_v10() {
        let scramble = *b"abcdefghijklmnopqrst";
        let payload = handshake_payload("mysql_native_password", &scramble);
        let msg = Message::decode(payload, &ctx(ProtocolState::Init, Expect::Response)).unwrap();
        let Message::Handshake(hs) = msg else {
            panic!("expected handshake");
        };
        assert_eq!(hs.server_version, "8.0.36");
        assert_eq!(hs.connection_id, 42);
        assert_eq!(hs.scramble, scramble.to_vec());
        assert_eq!(hs.auth_scramble(), &scramble[..]);
        assert_eq!(hs.charset, Some(45));
        assert_eq!(hs.status_flags, Some(2));
        assert_eq!(hs.auth_plugin.as_deref(), Some("mysql_native_password"));
        assert!(hs.has_capability(capabilities::CLIENT_SSL));
        assert!(!hs.is_mariadb());
    }

    #[test]
    fn test_unsupported_protocol_version_is_protocol_error() {
        let mut payload = handshake_payload("x", &[1; 20]);
        payload[0] = 9;
        let err = Message::decode(payload, &ctx(ProtocolState::Init, Expect::Response)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_err_during_init_is_err_message() {
        let mut payload = vec![0xFF, 0x10, 0x04];
        payload.extend_from_slice(b"Too many connections");
        let msg = Message::decode(payload, &ctx(ProtocolState::Init, Expect::Response)).unwrap();
        let Message::Err(err) = &msg else {
            panic!("expected err");
        };
        assert_eq!(err.error_code, 1040);
        assert_eq!(err.sql_state, "");
        assert_eq!(
            msg.state_transition(ProtocolState::Init),
            Some(ProtocolState::HandshakeError)
        );
    }

    #[test]
    fn test_ok_and_err_packets() {
        let ok = Message::decode(
            vec![0x00, 0x01, 0x2A, 0x02, 0x00, 0x00, 0x00],
            &ctx(ProtocolState::Ok, Expect::Response),
        )
        .unwrap();
        assert_eq!(
            ok,
            Message::Ok(OkPacket {
                affected_rows: 1,
                last_insert_id: 42,
                status_flags: 2,
                warnings: 0,
                info: String::new(),
            })
        );

        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000Access denied");
        let err = Message::decode(data, &ctx(ProtocolState::AuthSent, Expect::Auth)).unwrap();
        assert_eq!(
            err.state_transition(ProtocolState::AuthSent),
            Some(ProtocolState::AuthError)
        );
        let Message::Err(err) = err else {
            panic!("expected err");
        };
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied");
    }

    #[test]
    fn test_eof_vs_payload_by_length() {
        let eof = Message::decode(
            vec![0xFE, 0x00, 0x00, 0x22, 0x00],
            &ctx(ProtocolState::Ok, Expect::Columns),
        )
        .unwrap();
        assert_eq!(
            eof,
            Message::Eof(EofPacket {
                warnings: 0,
                status_flags: 0x22
            })
        );

        // A long 0xFE packet in the rows phase without DEPRECATE_EOF is data.
        let mut no_deprecate = ctx(ProtocolState::Ok, Expect::Rows);
        no_deprecate.capabilities &= !capabilities::CLIENT_DEPRECATE_EOF;
        let long = vec![0xFE; 12];
        assert!(matches!(
            Message::decode(long, &no_deprecate).unwrap(),
            Message::Payload(_)
        ));
    }

    #[test]
    fn test_deprecated_eof_terminator_is_ok() {
        let msg = Message::decode(
            vec![0xFE, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00],
            &ctx(ProtocolState::Ok, Expect::Rows),
        )
        .unwrap();
        assert!(matches!(msg, Message::Ok(ok) if ok.status_flags == 2));
    }

    #[test]
    fn test_huge_first_cell_is_a_row() {
        let cell_len = MAX_PACKET_SIZE + 16;
        let mut payload = Vec::with_capacity(cell_len + 9);
        payload.push(0xFE);
        payload.extend((cell_len as u64).to_le_bytes());
        payload.resize(cell_len + 9, b'x');
        let msg = Message::decode(payload, &ctx(ProtocolState::Ok, Expect::Rows)).unwrap();
        assert!(matches!(msg, Message::Payload(p) if p.len() == cell_len + 9));
    }

    #[test]
    fn test_zero_header_in_rows_is_payload() {
        let msg = Message::decode(
            vec![0x00, 0x00, 0x01, b'1'],
            &ctx(ProtocolState::Ok, Expect::Rows),
        )
        .unwrap();
        assert!(matches!(msg, Message::Payload(_)));
    }

    #[test]
    fn test_prepare_ok() {
        let msg = Message::decode(
            vec![0x00, 7, 0, 0, 0, 2, 0, 1, 0, 0, 0, 0],
            &ctx(ProtocolState::Ok, Expect::PrepareOk),
        )
        .unwrap();
        assert_eq!(
            msg,
            Message::PrepareOk(PrepareOk {
                statement_id: 7,
                num_columns: 2,
                num_params: 1,
                warnings: 0
            })
        );
    }

    #[test]
    fn test_auth_messages_only_while_authenticating() {
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"caching_sha2_password\0");
        switch.extend_from_slice(&[7; 20]);
        switch.push(0);
        let msg = Message::decode(switch, &ctx(ProtocolState::AuthSent, Expect::Auth)).unwrap();
        assert_eq!(
            msg.state_transition(ProtocolState::AuthSent),
            Some(ProtocolState::Auth)
        );
        let Message::AuthSwitchRequest(req) = msg else {
            panic!("expected auth switch");
        };
        assert_eq!(req.plugin_name, "caching_sha2_password");
        assert_eq!(req.plugin_data, vec![7; 20]);

        let more = Message::decode(vec![0x01, 0x03], &ctx(ProtocolState::Auth, Expect::Auth)).unwrap();
        assert_eq!(more, Message::AuthMoreData(vec![0x03]));
        assert_eq!(more.state_transition(ProtocolState::Auth), None);

        let data = Message::decode(vec![0x01, 0x03], &ctx(ProtocolState::Ok, Expect::Rows)).unwrap();
        assert!(matches!(data, Message::Payload(_)));
    }

    #[test]
    fn test_local_infile_requires_opt_in() {
        let mut payload = vec![0xFB];
        payload.extend_from_slice(b"/tmp/data.csv");

        let denied = Message::decode(payload.clone(), &ctx(ProtocolState::Ok, Expect::ResultHeader));
        assert!(matches!(denied, Err(Error::Protocol(_))));

        let mut allowed = ctx(ProtocolState::Ok, Expect::ResultHeader);
        allowed.local_infile_allowed = true;
        assert_eq!(
            Message::decode(payload.clone(), &allowed).unwrap(),
            Message::LocalInFileRequest("/tmp/data.csv".to_string())
        );

        // A NULL first column in a text row also starts with 0xFB.
        assert!(matches!(
            Message::decode(payload, &ctx(ProtocolState::Ok, Expect::Rows)).unwrap(),
            Message::Payload(_)
        ));
    }

    #[test]
    fn test_truncated_ok_is_protocol_error() {
        let err = Message::decode(vec![0x00, 0x01], &ctx(ProtocolState::Ok, Expect::Response))
            .unwrap_err();
        match err {
            Error::Protocol(p) => assert_eq!(p.raw_data, Some(vec![0x00, 0x01])),
            other => panic!("unexpected: {other}"),
        }
    }
}
