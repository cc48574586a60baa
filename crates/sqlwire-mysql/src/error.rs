//! Error constructors for the MySQL driver.

use sqlwire_core::error::{
    ConnectionError, ConnectionErrorKind, Error, ProtocolError, QueryError, QueryErrorKind,
};

use crate::message::ErrPacket;

pub(crate) fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
        source: None,
    })
}

pub(crate) fn protocol_error_with_data(msg: impl Into<String>, raw: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: Some(raw.to_vec()),
        source: None,
    })
}

pub(crate) fn auth_error(msg: impl Into<String>) -> Error {
    connection_error_kind(ConnectionErrorKind::Authentication, msg)
}

pub(crate) fn ssl_error(msg: impl Into<String>) -> Error {
    connection_error_kind(ConnectionErrorKind::Ssl, msg)
}

pub(crate) fn connection_error(msg: impl Into<String>) -> Error {
    connection_error_kind(ConnectionErrorKind::Connect, msg)
}

pub(crate) fn disconnected(msg: impl Into<String>) -> Error {
    connection_error_kind(ConnectionErrorKind::Disconnected, msg)
}

fn connection_error_kind(kind: ConnectionErrorKind, msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: msg.into(),
        source: None,
    })
}

/// Classify a server error code.
pub(crate) fn classify(code: u16) -> QueryErrorKind {
    match code {
        1062 | 1169 | 1216 | 1217 | 1451 | 1452 | 1048 | 3819 => QueryErrorKind::Constraint,
        1064 | 1149 => QueryErrorKind::Syntax,
        1146 | 1054 | 1049 | 1051 | 1091 | 1305 | 1243 => QueryErrorKind::NotFound,
        1044 | 1045 | 1142 | 1143 | 1227 | 1370 => QueryErrorKind::Permission,
        1406 | 1264 | 1265 => QueryErrorKind::DataTruncation,
        1213 => QueryErrorKind::Deadlock,
        1205 | 3024 => QueryErrorKind::Timeout,
        1317 => QueryErrorKind::Cancelled,
        _ => QueryErrorKind::Database,
    }
}

/// Convert a server ERR packet into an error, remembering the SQL if known.
pub(crate) fn query_error(err: &ErrPacket, sql: Option<&str>) -> Error {
    Error::Query(QueryError {
        kind: classify(err.error_code),
        code: Some(err.error_code),
        sqlstate: (!err.sql_state.is_empty()).then(|| err.sql_state.clone()),
        message: err.error_message.clone(),
        sql: sql.map(str::to_string),
        source: None,
    })
}
