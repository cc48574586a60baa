//! Authentication plugins and the registry the driver selects them from.
//!
//! Supported plugins:
//! - `mysql_native_password`: `SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))`
//! - `caching_sha2_password`: SHA-256 scramble with a fast path and a full
//!   authentication path (cleartext over TLS, RSA-OAEP otherwise)
//! - `mysql_clear_password`: NUL-terminated password, secure transports only
//!
//! A registry maps either a server capability bit or a plugin name to a
//! factory. Lookups walk the registrations in order and the first match wins.

use std::fmt;
use std::sync::Arc;

use sha1::Sha1;
use sha2::{Digest, Sha256};

use rand::rngs::OsRng;

use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;

use sqlwire_core::Result;

use crate::buffer::Buffer;
use crate::error::auth_error;
use crate::message::Handshake;
use crate::protocol::{SCRAMBLE_LENGTH, capabilities};

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Status bytes of the caching_sha2_password exchange.
pub mod caching_sha2 {
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// What a plugin wants to do after the server sent more auth data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    /// Nothing to send; the server's next packet decides.
    Wait,
    /// Send these bytes as the next auth packet.
    Send(Vec<u8>),
}

/// Inputs shared by every plugin instance.
#[derive(Clone)]
pub struct AuthContext {
    /// Scramble from the greeting or the latest auth switch request.
    pub scramble: Vec<u8>,
    pub password: String,
    /// The transport is TLS or a local socket.
    pub secure: bool,
    /// Permit `mysql_clear_password` on an insecure transport.
    pub allow_cleartext: bool,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("scramble_len", &self.scramble.len())
            .field("password", &"<redacted>")
            .field("secure", &self.secure)
            .field("allow_cleartext", &self.allow_cleartext)
            .finish()
    }
}

/// An authentication mechanism.
pub trait AuthPlugin: Send {
    /// Plugin name as announced on the wire.
    fn name(&self) -> &'static str;

    /// Raw token for the current scramble, as sent in an auth switch response.
    fn auth_token(&self, password: &str) -> Result<Vec<u8>>;

    /// Token for the handshake response: a length prefix followed by
    /// [`auth_token`](Self::auth_token). An empty token is a single zero byte.
    fn compute_handshake_auth(&self, password: &str) -> Result<Vec<u8>> {
        let token = self.auth_token(password)?;
        let mut buf = Buffer::with_capacity(token.len() + 1);
        buf.put_lenenc_bytes(&token);
        Ok(buf.into_vec())
    }

    /// React to an `AuthMoreData` packet.
    fn receive_more_data(&mut self, data: &[u8]) -> Result<AuthResponse>;
}

// ==================== mysql_native_password ====================

/// SHA1 challenge-response.
#[derive(Debug)]
pub struct NativePassword {
    scramble: Vec<u8>,
}

impl NativePassword {
    pub fn new(scramble: &[u8]) -> Self {
        Self {
            scramble: scramble[..scramble.len().min(SCRAMBLE_LENGTH)].to_vec(),
        }
    }
}

impl AuthPlugin for NativePassword {
    fn name(&self) -> &'static str {
        plugins::MYSQL_NATIVE_PASSWORD
    }

    fn auth_token(&self, password: &str) -> Result<Vec<u8>> {
        Ok(native_scramble(password, &self.scramble))
    }

    fn receive_more_data(&mut self, _data: &[u8]) -> Result<AuthResponse> {
        Err(auth_error(
            "mysql_native_password does not support additional auth data",
        ))
    }
}

/// `SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))`, empty for an
/// empty password.
pub fn native_scramble(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

// ==================== caching_sha2_password ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sha2Phase {
    Scrambled,
    AwaitingPublicKey,
    SentFullAuth,
}

/// SHA-256 challenge-response with full-auth fallback.
pub struct CachingSha2Password {
    scramble: Vec<u8>,
    password: String,
    secure: bool,
    phase: Sha2Phase,
}

impl fmt::Debug for CachingSha2Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingSha2Password")
            .field("secure", &self.secure)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl CachingSha2Password {
    pub fn new(ctx: &AuthContext) -> Self {
        Self {
            scramble: ctx.scramble[..ctx.scramble.len().min(SCRAMBLE_LENGTH)].to_vec(),
            password: ctx.password.clone(),
            secure: ctx.secure,
            phase: Sha2Phase::Scrambled,
        }
    }

    fn cleartext(&self) -> Vec<u8> {
        let mut out = self.password.as_bytes().to_vec();
        out.push(0);
        out
    }
}

impl AuthPlugin for CachingSha2Password {
    fn name(&self) -> &'static str {
        plugins::CACHING_SHA2_PASSWORD
    }

    fn auth_token(&self, password: &str) -> Result<Vec<u8>> {
        Ok(sha2_scramble(password, &self.scramble))
    }

    fn receive_more_data(&mut self, data: &[u8]) -> Result<AuthResponse> {
        match self.phase {
            Sha2Phase::Scrambled => match data.first() {
                Some(&caching_sha2::FAST_AUTH_SUCCESS) => {
                    tracing::debug!("caching_sha2_password fast auth succeeded");
                    Ok(AuthResponse::Wait)
                }
                Some(&caching_sha2::PERFORM_FULL_AUTH) => {
                    if self.secure {
                        tracing::debug!("caching_sha2_password full auth over secure transport");
                        self.phase = Sha2Phase::SentFullAuth;
                        Ok(AuthResponse::Send(self.cleartext()))
                    } else {
                        tracing::debug!("caching_sha2_password requesting server public key");
                        self.phase = Sha2Phase::AwaitingPublicKey;
                        Ok(AuthResponse::Send(vec![caching_sha2::REQUEST_PUBLIC_KEY]))
                    }
                }
                other => Err(auth_error(format!(
                    "unexpected caching_sha2_password status byte: {:?}",
                    other
                ))),
            },
            Sha2Phase::AwaitingPublicKey => {
                let encrypted = rsa_encrypt_password(&self.password, &self.scramble, data)?;
                self.phase = Sha2Phase::SentFullAuth;
                Ok(AuthResponse::Send(encrypted))
            }
            Sha2Phase::SentFullAuth => Err(auth_error(
                "unexpected auth data after caching_sha2_password full authentication",
            )),
        }
    }
}

/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)`.
pub fn sha2_scramble(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let hash1: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let hash2: [u8; 32] = Sha256::digest(hash1).into();

    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(scramble);
    let hash3: [u8; 32] = hasher.finalize().into();

    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Encrypt `password + NUL`, XORed with the rotating scramble, with the
/// server's RSA public key (OAEP padding).
fn rsa_encrypt_password(password: &str, scramble: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    if scramble.is_empty() {
        return Err(auth_error("cannot encrypt password without a scramble"));
    }
    let mut plain = password.as_bytes().to_vec();
    plain.push(0);
    for (i, byte) in plain.iter_mut().enumerate() {
        *byte ^= scramble[i % scramble.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_error(format!("server public key is not valid PEM: {e}")))?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_error(format!("failed to parse server public key: {e}")))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
        .map_err(|e| auth_error(format!("RSA encryption failed: {e}")))
}

// ==================== mysql_clear_password ====================

/// Cleartext password, permitted only on secure transports unless allowed.
#[derive(Debug)]
pub struct ClearPassword {
    permitted: bool,
}

impl ClearPassword {
    pub fn new(ctx: &AuthContext) -> Self {
        Self {
            permitted: ctx.secure || ctx.allow_cleartext,
        }
    }
}

impl AuthPlugin for ClearPassword {
    fn name(&self) -> &'static str {
        plugins::MYSQL_CLEAR_PASSWORD
    }

    fn auth_token(&self, password: &str) -> Result<Vec<u8>> {
        if !self.permitted {
            return Err(auth_error(
                "mysql_clear_password requires a secure transport",
            ));
        }
        let mut out = password.as_bytes().to_vec();
        out.push(0);
        Ok(out)
    }

    fn receive_more_data(&mut self, _data: &[u8]) -> Result<AuthResponse> {
        Err(auth_error(
            "mysql_clear_password does not support additional auth data",
        ))
    }
}

// ==================== Registry ====================

/// What a registry entry matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthKey {
    /// A server capability bit.
    Capability(u32),
    /// A plugin name from the greeting or an auth switch request.
    Name(String),
}

/// Builds a plugin instance for one authentication exchange.
pub type AuthFactory = Arc<dyn Fn(&AuthContext) -> Box<dyn AuthPlugin> + Send + Sync>;

/// Ordered plugin registrations, owned by the client that creates drivers.
#[derive(Clone, Default)]
pub struct AuthRegistry {
    entries: Vec<(AuthKey, AuthFactory)>,
}

impl fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(key, _)| key))
            .finish()
    }
}

impl AuthRegistry {
    /// A registry with no plugins.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in plugins, by name, with native password as the
    /// `CLIENT_SECURE_CONNECTION` fallback for greetings without a plugin name.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(
            AuthKey::Name(plugins::CACHING_SHA2_PASSWORD.to_string()),
            Arc::new(|ctx: &AuthContext| Box::new(CachingSha2Password::new(ctx)) as Box<dyn AuthPlugin>),
        );
        registry.register(
            AuthKey::Name(plugins::MYSQL_NATIVE_PASSWORD.to_string()),
            Arc::new(|ctx: &AuthContext| Box::new(NativePassword::new(&ctx.scramble)) as Box<dyn AuthPlugin>),
        );
        registry.register(
            AuthKey::Name(plugins::MYSQL_CLEAR_PASSWORD.to_string()),
            Arc::new(|ctx: &AuthContext| Box::new(ClearPassword::new(ctx)) as Box<dyn AuthPlugin>),
        );
        registry.register(
            AuthKey::Capability(capabilities::CLIENT_SECURE_CONNECTION),
            Arc::new(|ctx: &AuthContext| Box::new(NativePassword::new(&ctx.scramble)) as Box<dyn AuthPlugin>),
        );
        registry
    }

    /// Append a registration. Earlier registrations take precedence.
    pub fn register(&mut self, key: AuthKey, factory: AuthFactory) -> &mut Self {
        self.entries.push((key, factory));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Choose the plugin for a server greeting.
    pub fn for_handshake(&self, handshake: &Handshake, ctx: &AuthContext) -> Result<Box<dyn AuthPlugin>> {
        let name = handshake.auth_plugin.as_deref();
        let found = self.entries.iter().find(|(key, _)| match key {
            AuthKey::Capability(bit) => handshake.capabilities & bit != 0,
            AuthKey::Name(n) => Some(n.as_str()) == name,
        });
        match found {
            Some((key, factory)) => {
                tracing::debug!(?key, server_plugin = ?name, "selected auth plugin");
                Ok(factory(ctx))
            }
            None => Err(auth_error(format!(
                "no registered auth plugin matches server plugin '{}'",
                name.unwrap_or("<none>")
            ))),
        }
    }

    /// Choose the plugin named by an auth switch request.
    pub fn by_name(&self, name: &str, ctx: &AuthContext) -> Result<Box<dyn AuthPlugin>> {
        self.entries
            .iter()
            .find(|(key, _)| matches!(key, AuthKey::Name(n) if n == name))
            .map(|(_, factory)| factory(ctx))
            .ok_or_else(|| auth_error(format!("unsupported auth plugin '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlwire_core::Error;
    use sqlwire_core::error::ConnectionErrorKind;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn ctx(secure: bool) -> AuthContext {
        AuthContext {
            scramble: b"_hello world of rub_".to_vec(),
            password: "plasma-mysql".to_string(),
            secure,
            allow_cleartext: false,
        }
    }

    fn handshake(plugin: Option<&str>, caps: u32) -> Handshake {
        Handshake {
            protocol_version: 10,
            server_version: "8.0.36".to_string(),
            connection_id: 1,
            scramble: vec![1; 20],
            capabilities: caps,
            charset: Some(45),
            status_flags: Some(2),
            auth_plugin: plugin.map(str::to_string),
        }
    }

    fn is_auth_error(err: &Error) -> bool {
        matches!(err, Error::Connection(c) if c.kind == ConnectionErrorKind::Authentication)
    }

    #[test]
    fn test_native_handshake_auth_vector() {
        let plugin = NativePassword::new(b"_hello world of rub_");
        let token = plugin.compute_handshake_auth("plasma-mysql").unwrap();
        assert_eq!(hex(&token), "14bd5a77488737773b19a763e34af0bdcc6d08d916");
    }

    #[test]
    fn test_native_empty_password_is_single_zero() {
        let plugin = NativePassword::new(&[9; 20]);
        assert_eq!(plugin.compute_handshake_auth("").unwrap(), vec![0]);
        assert!(plugin.auth_token("").unwrap().is_empty());
    }

    #[test]
    fn test_native_rejects_more_data() {
        let mut plugin = NativePassword::new(&[0; 20]);
        let err = plugin.receive_more_data(&[0x04]).unwrap_err();
        assert!(is_auth_error(&err));
    }

    #[test]
    fn test_sha2_scramble_shape() {
        let token = sha2_scramble("secret", &[7; 20]);
        assert_eq!(token.len(), 32);
        assert_eq!(token, sha2_scramble("secret", &[7; 20]));
        assert_ne!(token, sha2_scramble("secret", &[8; 20]));
        assert!(sha2_scramble("", &[7; 20]).is_empty());
    }

    #[test]
    fn test_caching_sha2_fast_auth_waits() {
        let mut plugin = CachingSha2Password::new(&ctx(false));
        assert_eq!(
            plugin.receive_more_data(&[caching_sha2::FAST_AUTH_SUCCESS]).unwrap(),
            AuthResponse::Wait
        );
    }

    #[test]
    fn test_caching_sha2_full_auth_secure_sends_cleartext() {
        let mut plugin = CachingSha2Password::new(&ctx(true));
        let response = plugin.receive_more_data(&[caching_sha2::PERFORM_FULL_AUTH]).unwrap();
        assert_eq!(response, AuthResponse::Send(b"plasma-mysql\0".to_vec()));
        assert!(plugin.receive_more_data(&[0x01]).is_err());
    }

    #[test]
    fn test_caching_sha2_full_auth_insecure_requests_key() {
        let mut plugin = CachingSha2Password::new(&ctx(false));
        let response = plugin.receive_more_data(&[caching_sha2::PERFORM_FULL_AUTH]).unwrap();
        assert_eq!(response, AuthResponse::Send(vec![caching_sha2::REQUEST_PUBLIC_KEY]));
        let err = plugin.receive_more_data(b"not a pem").unwrap_err();
        assert!(is_auth_error(&err));
    }

    #[test]
    fn test_clear_password_requires_secure_transport() {
        let plugin = ClearPassword::new(&ctx(false));
        assert!(plugin.auth_token("pw").is_err());

        let plugin = ClearPassword::new(&ctx(true));
        assert_eq!(plugin.auth_token("pw").unwrap(), b"pw\0".to_vec());

        let mut allowed = ctx(false);
        allowed.allow_cleartext = true;
        assert!(ClearPassword::new(&allowed).auth_token("pw").is_ok());
    }

    #[test]
    fn test_registry_first_match_wins() {
        let registry = AuthRegistry::with_defaults();
        let caps = capabilities::DEFAULT_CLIENT_FLAGS;

        let plugin = registry
            .for_handshake(&handshake(Some("caching_sha2_password"), caps), &ctx(false))
            .unwrap();
        assert_eq!(plugin.name(), plugins::CACHING_SHA2_PASSWORD);

        // No plugin name: the capability fallback applies.
        let plugin = registry.for_handshake(&handshake(None, caps), &ctx(false)).unwrap();
        assert_eq!(plugin.name(), plugins::MYSQL_NATIVE_PASSWORD);

        // A capability entry registered first shadows the name entries.
        let mut shadowed = AuthRegistry::empty();
        shadowed.register(
            AuthKey::Capability(capabilities::CLIENT_PROTOCOL_41),
            Arc::new(|c: &AuthContext| Box::new(NativePassword::new(&c.scramble)) as Box<dyn AuthPlugin>),
        );
        shadowed.register(
            AuthKey::Name(plugins::CACHING_SHA2_PASSWORD.to_string()),
            Arc::new(|c: &AuthContext| Box::new(CachingSha2Password::new(c)) as Box<dyn AuthPlugin>),
        );
        let plugin = shadowed
            .for_handshake(&handshake(Some("caching_sha2_password"), caps), &ctx(false))
            .unwrap();
        assert_eq!(plugin.name(), plugins::MYSQL_NATIVE_PASSWORD);
    }

    #[test]
    fn test_registry_unknown_switch_names_plugin() {
        let registry = AuthRegistry::with_defaults();
        let err = registry.by_name("auth_gssapi_client", &ctx(false)).err().unwrap();
        assert!(is_auth_error(&err));
        assert!(err.to_string().contains("auth_gssapi_client"));
    }

    #[test]
    fn test_empty_registry_rejects_handshake() {
        let registry = AuthRegistry::empty();
        assert!(registry.is_empty());
        let err = registry
            .for_handshake(&handshake(Some("mysql_native_password"), 0), &ctx(false))
            .err()
            .unwrap();
        assert!(is_auth_error(&err));
    }
}
