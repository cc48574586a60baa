//! Prepared statement handles and parameter binding.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlwire_core::{Error, Result, UsageErrorKind, Value};

use crate::command::Columns;

/// A server-side prepared statement.
///
/// Clones share the closed flag, so closing any copy invalidates all of them.
#[derive(Debug, Clone)]
pub struct Statement {
    id: u32,
    sql: String,
    param_names: Vec<String>,
    params: Columns,
    columns: Columns,
    closed: Arc<AtomicBool>,
}

impl Statement {
    pub(crate) fn new(
        id: u32,
        sql: String,
        param_names: Vec<String>,
        params: Columns,
        columns: Columns,
    ) -> Self {
        Self {
            id,
            sql,
            param_names,
            params,
            columns,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// SQL as written by the caller, before named parameters were rewritten.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Names in placeholder order; empty for positional statements.
    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn params(&self) -> &Columns {
        &self.params
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::usage(
                UsageErrorKind::StatementClosed,
                format!("statement {} is closed", self.id),
            ));
        }
        Ok(())
    }

    /// Order `params` into the positional list the server expects.
    pub fn bind(&self, params: Params) -> Result<Vec<Value>> {
        let expected = self.param_count();
        match params {
            Params::Positional(values) => {
                if values.len() < expected {
                    return Err(Error::usage(
                        UsageErrorKind::MissingParameter,
                        format!("statement expects {expected} parameters, got {}", values.len()),
                    ));
                }
                if values.len() > expected {
                    return Err(Error::usage(
                        UsageErrorKind::ExtraParameter,
                        format!("statement expects {expected} parameters, got {}", values.len()),
                    ));
                }
                Ok(values)
            }
            Params::Named(pairs) => self.bind_named(pairs),
        }
    }

    fn bind_named(&self, pairs: Vec<(String, Value)>) -> Result<Vec<Value>> {
        if self.param_names.len() != self.param_count() {
            return Err(Error::usage(
                UsageErrorKind::UnknownParameter,
                "statement does not use named parameters",
            ));
        }
        for (i, (name, _)) in pairs.iter().enumerate() {
            if !self.param_names.contains(name) {
                return Err(Error::usage(
                    UsageErrorKind::UnknownParameter,
                    format!("unknown parameter :{name}"),
                ));
            }
            if pairs[..i].iter().any(|(prev, _)| prev == name) {
                return Err(Error::usage(
                    UsageErrorKind::ExtraParameter,
                    format!("parameter :{name} bound twice"),
                ));
            }
        }
        self.param_names
            .iter()
            .map(|name| {
                pairs
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| {
                        Error::usage(
                            UsageErrorKind::MissingParameter,
                            format!("missing parameter :{name}"),
                        )
                    })
            })
            .collect()
    }
}

/// An open server-side cursor created by executing a statement.
#[derive(Debug, Clone)]
pub struct StatementCursor {
    statement_id: u32,
    columns: Columns,
    statement_closed: Arc<AtomicBool>,
    exhausted: Arc<AtomicBool>,
}

impl StatementCursor {
    pub(crate) fn new(statement: &Statement, columns: Columns) -> Self {
        Self {
            statement_id: statement.id,
            columns,
            statement_closed: Arc::clone(&statement.closed),
            exhausted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn statement_id(&self) -> u32 {
        self.statement_id
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// The server sent its last row.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_exhausted(&self) {
        self.exhausted.store(true, Ordering::Release);
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.statement_closed.load(Ordering::Acquire) {
            return Err(Error::usage(
                UsageErrorKind::StatementClosed,
                format!("statement {} is closed", self.statement_id),
            ));
        }
        if self.is_exhausted() {
            return Err(Error::usage(
                UsageErrorKind::InvalidState,
                "cursor has no more rows",
            ));
        }
        Ok(())
    }
}

/// Parameters for executing a prepared statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl Params {
    pub fn none() -> Self {
        Params::Positional(Vec::new())
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl From<&[Value]> for Params {
    fn from(values: &[Value]) -> Self {
        Params::Positional(values.to_vec())
    }
}

impl<S: Into<String>> From<Vec<(S, Value)>> for Params {
    fn from(pairs: Vec<(S, Value)>) -> Self {
        Params::Named(pairs.into_iter().map(|(n, v)| (n.into(), v)).collect())
    }
}

/// Replace `:name` placeholders with `?`, returning the names in order.
///
/// Placeholders inside quoted strings or identifiers are left alone, as is
/// the `::` cast operator.
pub fn rewrite_named_params(sql: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(sql.len());
    let mut names = Vec::new();
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' && q != '`' {
                if let Some((_, escaped)) = chars.next() {
                    out.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
            }
            ':' if chars.peek().is_some_and(|&(_, n)| n == ':') => {
                out.push_str("::");
                chars.next();
            }
            ':' if chars
                .peek()
                .is_some_and(|&(_, n)| n.is_ascii_alphabetic() || n == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, n)) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        end = j + n.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                names.push(sql[start..end].to_string());
                out.push('?');
            }
            _ => out.push(c),
        }
    }
    (out, names)
}
