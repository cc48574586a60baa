//! Core types shared by the sqlwire drivers.
//!
//! - `Error` taxonomy covering protocol, server, auth, usage and going-away failures
//! - `Value` dynamic SQL values produced by the row codecs
//! - `Row` and `ColumnInfo` for decoded result rows
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod row;
pub mod transaction;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ProtocolError, QueryError,
    QueryErrorKind, Result, TypeError, UsageError, UsageErrorKind,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use transaction::IsolationLevel;
pub use value::Value;
