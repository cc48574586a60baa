//! MySQL connection configuration.
//!
//! Holds everything the driver needs before the first byte is exchanged:
//! credentials, character set, TLS policy, compression and LOCAL INFILE
//! permission. [`MySqlConfig::from_uri`] accepts
//! `scheme://[user[:password]@]host[:port][/database][?options]`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use sqlwire_core::{Error, Result};

use crate::command::LoginParams;
use crate::protocol::charset;

/// Socket used for `unix://` URIs naming a loopback host.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/mysqld/mysqld.sock";

/// TLS settings handed verbatim to the transport when upgrading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// Name to verify the certificate against (defaults to the host).
    pub server_name: Option<String>,
    /// Verify the server certificate chain.
    pub verify: bool,
    pub ca_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            server_name: None,
            verify: true,
            ca_path: None,
            cert_path: None,
            key_path: None,
        }
    }
}

/// MySQL connection configuration.
#[derive(Debug, Clone)]
pub struct MySqlConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 3306)
    pub port: u16,
    /// Unix domain socket, used instead of host/port when set
    pub socket: Option<PathBuf>,
    pub user: String,
    pub password: Option<String>,
    /// Default schema sent with the handshake
    pub database: Option<String>,
    /// TCP connect timeout used by [`MySqlStream::connect`](crate::MySqlStream::connect)
    pub connect_timeout: Duration,
    /// Character set / collation id sent in the handshake (default: utf8mb4)
    pub charset: u8,
    /// Collation applied with `SET NAMES` once authenticated
    pub collation: Option<String>,
    /// Enable compression (CLIENT_COMPRESS capability)
    pub compression: bool,
    /// Upgrade to TLS when the server offers it
    pub tls: Option<TlsOptions>,
    /// Refuse servers without TLS (non-loopback hosts)
    pub tls_required: bool,
    /// Refuse servers without TLS on loopback hosts
    pub tls_required_for_localhost: bool,
    /// Allow `mysql_clear_password` over an unencrypted transport
    pub allow_cleartext_password: bool,
    /// Additional connection attributes
    pub attributes: HashMap<String, String>,
    /// Local infile handling (disabled by default for security)
    pub local_infile: bool,
    /// Max allowed packet size (default: 64MB)
    pub max_packet_size: u32,
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            socket: None,
            user: String::new(),
            password: None,
            database: None,
            connect_timeout: Duration::from_secs(30),
            charset: charset::DEFAULT_CHARSET,
            collation: None,
            compression: false,
            tls: None,
            tls_required: false,
            tls_required_for_localhost: false,
            allow_cleartext_password: false,
            attributes: HashMap::new(),
            local_infile: false,
            max_packet_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl MySqlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket = Some(path.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    /// Collation applied after authentication, e.g. `utf8mb4_unicode_ci`.
    pub fn collation(mut self, collation: impl Into<String>) -> Self {
        self.collation = Some(collation.into());
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Upgrade to TLS when the server supports it.
    pub fn tls(mut self, options: TlsOptions) -> Self {
        self.tls = Some(options);
        self
    }

    /// Fail the connection if TLS cannot be negotiated.
    pub fn tls_required(mut self, required: bool) -> Self {
        self.tls_required = required;
        self
    }

    pub fn tls_required_for_localhost(mut self, required: bool) -> Self {
        self.tls_required_for_localhost = required;
        self
    }

    pub fn allow_cleartext_password(mut self, allowed: bool) -> Self {
        self.allow_cleartext_password = allowed;
        self
    }

    /// Set a connection attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Enable or disable local infile handling.
    ///
    /// # Security Warning
    /// The server chooses which file to ask for. Only enable this against
    /// trusted servers, and hand the driver a handler that restricts access.
    pub fn local_infile(mut self, enabled: bool) -> Self {
        self.local_infile = enabled;
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Get the socket address string for connection.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_localhost(&self) -> bool {
        self.socket.is_some() || is_loopback(&self.host)
    }

    /// TLS is mandatory for this host.
    pub fn requires_tls(&self) -> bool {
        if self.is_localhost() {
            self.tls_required_for_localhost
        } else {
            self.tls_required
        }
    }

    /// TLS settings to use, if TLS should be attempted at all.
    pub fn tls_options(&self) -> Option<TlsOptions> {
        match (&self.tls, self.requires_tls()) {
            (Some(options), _) => Some(options.clone()),
            (None, true) => Some(TlsOptions::default()),
            (None, false) => None,
        }
    }

    /// Name the server certificate is checked against.
    pub fn tls_server_name(&self) -> String {
        self.tls
            .as_ref()
            .and_then(|t| t.server_name.clone())
            .unwrap_or_else(|| self.host.clone())
    }

    /// Build capability flags based on configuration.
    pub fn capability_flags(&self) -> u32 {
        use crate::protocol::capabilities::{
            CLIENT_COMPRESS, CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_LOCAL_FILES,
            DEFAULT_CLIENT_FLAGS,
        };

        let mut flags = DEFAULT_CLIENT_FLAGS;
        if self.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }
        if self.compression {
            flags |= CLIENT_COMPRESS;
        }
        if self.local_infile {
            flags |= CLIENT_LOCAL_FILES;
        }
        if !self.attributes.is_empty() {
            flags |= CLIENT_CONNECT_ATTRS;
        }
        flags
    }

    /// Handshake fields for the given negotiated capabilities.
    pub(crate) fn login_params(&self, capabilities: u32) -> LoginParams {
        let mut attributes: Vec<(String, String)> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        attributes.sort();
        LoginParams {
            capabilities,
            max_packet_size: self.max_packet_size,
            charset: self.charset,
            user: self.user.clone(),
            database: self.database.clone(),
            attributes,
        }
    }

    /// `SET NAMES` statement for the configured collation.
    pub(crate) fn set_names_sql(&self) -> Option<String> {
        self.collation.as_ref().map(|collation| {
            format!(
                "SET NAMES {} COLLATE {}",
                charset::name(self.charset),
                collation
            )
        })
    }

    /// Parse a connection URI.
    ///
    /// Schemes `mysql`, `tcp` and `tls` connect over TCP (`tls` also makes
    /// TLS mandatory); `unix` connects to a domain socket, either the path
    /// in the URI or the default socket for loopback hosts.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::config(format!("missing scheme in '{}'", redact(uri))))?;
        let mut config = Self::default();

        let (rest, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, authority),
        };

        if let Some(userinfo) = userinfo {
            let (user, password) = match userinfo.split_once(':') {
                Some((user, password)) => (user, Some(password)),
                None => (userinfo, None),
            };
            config.user = percent_decode(user)?;
            config.password = password.map(percent_decode).transpose()?;
        }

        match scheme.to_ascii_lowercase().as_str() {
            "mysql" | "tcp" => config.parse_host_port(hostport)?,
            "tls" => {
                config.parse_host_port(hostport)?;
                config.tls_required = true;
                config.tls_required_for_localhost = true;
                config.tls.get_or_insert_with(TlsOptions::default);
            }
            "unix" => {
                let host = percent_decode(hostport)?;
                if host.is_empty() || is_loopback(&host) {
                    config.socket = Some(PathBuf::from(DEFAULT_SOCKET_PATH));
                    if !host.is_empty() {
                        config.host = host;
                    }
                } else {
                    config.socket = Some(PathBuf::from(host));
                }
            }
            other => {
                return Err(Error::config(format!("unsupported URI scheme '{other}'")));
            }
        }

        if !path.is_empty() {
            config.database = Some(percent_decode(path)?);
        }
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, "true"));
            config.apply_option(key, &percent_decode(value)?)?;
        }
        Ok(config)
    }

    fn parse_host_port(&mut self, hostport: &str) -> Result<()> {
        let (host, port) = if let Some(bracketed) = hostport.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| Error::config(format!("unterminated IPv6 host '{hostport}'")))?;
            (host, tail.strip_prefix(':'))
        } else {
            match hostport.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (hostport, None),
            }
        };
        if !host.is_empty() {
            self.host = percent_decode(host)?;
        }
        if let Some(port) = port {
            self.port = port
                .parse()
                .map_err(|_| Error::config(format!("invalid port '{port}'")))?;
        }
        Ok(())
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "charset" => {
                self.charset = charset::from_name(value)
                    .ok_or_else(|| Error::config(format!("unknown charset '{value}'")))?;
            }
            "collation" => {
                if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(Error::config(format!("invalid collation '{value}'")));
                }
                self.collation = Some(value.to_string());
            }
            "compress" => self.compression = parse_bool(key, value)?,
            "connect_timeout" => {
                let secs: u64 = value.parse().map_err(|_| {
                    Error::config(format!("connect_timeout expects seconds, got '{value}'"))
                })?;
                self.connect_timeout = Duration::from_secs(secs);
            }
            "local_infile" => self.local_infile = parse_bool(key, value)?,
            "ssl" | "tls" => match value.to_ascii_lowercase().as_str() {
                "preferred" | "prefer" => {
                    self.tls.get_or_insert_with(TlsOptions::default);
                }
                "required" | "require" => {
                    self.tls.get_or_insert_with(TlsOptions::default);
                    self.tls_required = true;
                }
                _ => {
                    if parse_bool(key, value)? {
                        self.tls.get_or_insert_with(TlsOptions::default);
                        self.tls_required = true;
                    } else {
                        self.tls = None;
                        self.tls_required = false;
                        self.tls_required_for_localhost = false;
                    }
                }
            },
            other => tracing::warn!(option = other, "ignoring unknown connection option"),
        }
        Ok(())
    }
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "option '{key}' expects a boolean, got '{value}'"
        ))),
    }
}

fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| Error::config(format!("invalid percent escape in '{s}'")))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::config("percent-decoded URI part is not UTF-8"))
}

/// The URI with any password masked, for error messages.
fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(start), Some(at)) if at > start => {
            let userinfo = &uri[start + 3..at];
            match userinfo.split_once(':') {
                Some((user, _)) => format!("{}{}:***{}", &uri[..start + 3], user, &uri[at..]),
                None => uri.to_string(),
            }
        }
        _ => uri.to_string(),
    }
}
