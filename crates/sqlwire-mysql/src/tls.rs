//! TLS upgrade for MySQL connections (feature `tls`).
//!
//! MySQL negotiates TLS in-band: after the greeting the client sends a short
//! SSL request packet, both sides run a TLS handshake over the same socket
//! and the handshake response continues with sequence id 2 inside the
//! encrypted channel. This module provides the rustls side of that upgrade.

use std::io::{Read, Write};
use std::sync::Arc;

use asupersync::net::TcpStream;
use sqlwire_core::Error;
use sqlwire_core::error::{ConnectionError, ConnectionErrorKind};

use crate::config::TlsOptions;
use crate::error::ssl_error;
use crate::transport::{flush_plain, read_some_plain, write_all_plain};

pub(crate) fn server_name(host: &str) -> Result<rustls::pki_types::ServerName<'static>, Error> {
    host.to_string()
        .try_into()
        .map_err(|e| ssl_error(format!("invalid server name '{host}': {e}")))
}

/// Build a rustls client config for `options`.
///
/// - `verify == false`: encrypt but accept any certificate
/// - `ca_path` set: verify against that CA bundle only
/// - otherwise: verify against the webpki root store
///
/// A client certificate is presented when both `cert_path` and `key_path`
/// are set.
pub fn build_client_config(options: &TlsOptions) -> Result<rustls::ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    if options.cert_path.is_some() != options.key_path.is_some() {
        return Err(ssl_error(
            "client certificate and key must be configured together",
        ));
    }

    if !options.verify {
        build_no_verify_config(&provider, options)
    } else if let Some(ca_path) = &options.ca_path {
        build_custom_ca_config(&provider, options, ca_path)
    } else {
        build_webpki_config(&provider, options)
    }
}

fn build_no_verify_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    options: &TlsOptions,
) -> Result<rustls::ClientConfig, Error> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    #[derive(Debug)]
    struct AcceptAny(Arc<rustls::crypto::CryptoProvider>);

    impl ServerCertVerifier for AcceptAny {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| ssl_error(format!("failed to set TLS versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAny(provider.clone())));

    add_client_auth(builder, options)
}

fn build_webpki_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    options: &TlsOptions,
) -> Result<rustls::ClientConfig, Error> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| ssl_error(format!("failed to set TLS versions: {e}")))?
        .with_root_certificates(roots);

    add_client_auth(builder, options)
}

fn build_custom_ca_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    options: &TlsOptions,
    ca_path: &std::path::Path,
) -> Result<rustls::ClientConfig, Error> {
    let certs = load_certs(ca_path, "CA certificate")?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| ssl_error(format!("failed to add CA certificate: {e}")))?;
    }

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| ssl_error(format!("failed to set TLS versions: {e}")))?
        .with_root_certificates(roots);

    add_client_auth(builder, options)
}

fn load_certs(
    path: &std::path::Path,
    what: &str,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| ssl_error(format!("failed to open {what} '{}': {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ssl_error(format!("failed to parse {what}: {e}")))?;

    if certs.is_empty() {
        return Err(ssl_error(format!(
            "no certificates found in {what} file '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    options: &TlsOptions,
) -> Result<rustls::ClientConfig, Error> {
    let (Some(cert_path), Some(key_path)) = (&options.cert_path, &options.key_path) else {
        return Ok(builder.with_no_client_auth());
    };

    let certs = load_certs(cert_path, "client certificate")?;

    let key_file = std::fs::File::open(key_path).map_err(|e| {
        ssl_error(format!(
            "failed to open client key '{}': {e}",
            key_path.display()
        ))
    })?;
    let mut key_reader = std::io::BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ssl_error(format!("failed to parse client key: {e}")))?
        .ok_or_else(|| ssl_error(format!("no private key found in '{}'", key_path.display())))?;

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| ssl_error(format!("failed to configure client auth: {e}")))
}

fn handshake_io_error(stage: &str, e: std::io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: format!("TLS handshake {stage} error: {e}"),
        source: Some(Box::new(e)),
    })
}

/// A TCP stream carrying a rustls client session.
pub struct TlsStream {
    tcp: TcpStream,
    tls: rustls::ClientConnection,
}

impl std::fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.tls.protocol_version())
            .field("is_handshaking", &self.tls.is_handshaking())
            .finish_non_exhaustive()
    }
}

impl TlsStream {
    /// Run the client handshake over `tcp`.
    pub async fn handshake(
        mut tcp: TcpStream,
        host: &str,
        options: &TlsOptions,
    ) -> Result<Self, Error> {
        let config = build_client_config(options)?;
        let name = server_name(options.server_name.as_deref().unwrap_or(host))?;
        let mut tls = rustls::ClientConnection::new(Arc::new(config), name)
            .map_err(|e| ssl_error(format!("failed to create TLS connection: {e}")))?;

        while tls.is_handshaking() {
            while tls.wants_write() {
                let mut out = Vec::new();
                tls.write_tls(&mut out)
                    .map_err(|e| handshake_io_error("write_tls", e))?;
                if !out.is_empty() {
                    write_all_plain(&mut tcp, &out)
                        .await
                        .map_err(|e| handshake_io_error("write", e))?;
                }
            }
            flush_plain(&mut tcp)
                .await
                .map_err(|e| handshake_io_error("flush", e))?;

            if tls.wants_read() {
                let mut buf = [0u8; 8192];
                let n = read_some_plain(&mut tcp, &mut buf)
                    .await
                    .map_err(|e| handshake_io_error("read", e))?;
                if n == 0 {
                    return Err(ssl_error("connection closed during TLS handshake"));
                }
                let mut cursor = std::io::Cursor::new(&buf[..n]);
                tls.read_tls(&mut cursor)
                    .map_err(|e| handshake_io_error("read_tls", e))?;
                tls.process_new_packets()
                    .map_err(|e| ssl_error(format!("TLS handshake failed: {e}")))?;
            }
        }

        tracing::debug!(version = ?tls.protocol_version(), "tls established");
        Ok(Self { tcp, tls })
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.tls.protocol_version()
    }

    pub(crate) async fn read_plain(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.tls.reader().read(out) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if !self.tls.wants_read() {
                return Ok(0);
            }

            let mut enc = [0u8; 8192];
            let n = read_some_plain(&mut self.tcp, &mut enc).await?;
            if n == 0 {
                return Ok(0);
            }

            let mut cursor = std::io::Cursor::new(&enc[..n]);
            self.tls.read_tls(&mut cursor)?;
            self.tls
                .process_new_packets()
                .map_err(|e| std::io::Error::other(format!("TLS error: {e}")))?;
        }
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.tls.writer().write(&buf[written..])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "TLS write zero",
                ));
            }
            written += n;
            self.flush().await?;
        }
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> std::io::Result<()> {
        self.tls.writer().flush()?;
        while self.tls.wants_write() {
            let mut out = Vec::new();
            self.tls.write_tls(&mut out)?;
            if !out.is_empty() {
                write_all_plain(&mut self.tcp, &out).await?;
            }
        }
        flush_plain(&mut self.tcp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_accepts_hosts_and_ips() {
        assert!(server_name("db.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("").is_err());
    }

    #[test]
    fn test_build_config_modes() {
        let webpki = TlsOptions::default();
        assert!(build_client_config(&webpki).is_ok());

        let insecure = TlsOptions {
            verify: false,
            ..TlsOptions::default()
        };
        assert!(build_client_config(&insecure).is_ok());
    }

    #[test]
    fn test_build_config_errors() {
        let missing_ca = TlsOptions {
            ca_path: Some("/nonexistent/ca.pem".into()),
            ..TlsOptions::default()
        };
        match build_client_config(&missing_ca) {
            Err(Error::Connection(c)) => assert_eq!(c.kind, ConnectionErrorKind::Ssl),
            other => panic!("unexpected: {other:?}"),
        }

        let half_client_auth = TlsOptions {
            cert_path: Some("/tmp/client.pem".into()),
            ..TlsOptions::default()
        };
        assert!(build_client_config(&half_client_auth).is_err());
    }
}
